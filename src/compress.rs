use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;

use crate::error::HoardError;
use crate::staging::Staging;

#[derive(Debug, Clone)]
pub enum Backend {
    /// External `pigz` with `threads` workers.
    Pigz { program: PathBuf, threads: usize },
    InProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressAction {
    Compressed,
    Existing,
}

#[derive(Debug, Clone)]
pub struct Compressed {
    pub path: Utf8PathBuf,
    pub action: CompressAction,
}

#[derive(Debug, Clone)]
pub struct Compressor {
    backend: Backend,
}

impl Compressor {
    /// Uses `pigz` when it is on `PATH`, in-process gzip otherwise.
    pub fn detect() -> Self {
        match find_in_path("pigz") {
            Some(program) => Self {
                backend: Backend::Pigz {
                    program,
                    threads: worker_threads(),
                },
            },
            None => {
                tracing::warn!("pigz not found on PATH, compressing in-process");
                Self {
                    backend: Backend::InProcess,
                }
            }
        }
    }

    pub fn with_backend(backend: Backend) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn output_path(input: &Utf8Path) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{input}.gz"))
    }

    /// Writes `<input>.gz`. An existing output is trusted and left alone.
    ///
    /// Output goes to a temp file that is renamed into place only when the
    /// compressor succeeded; on failure nothing is left under the final name
    /// and the error names the input.
    pub fn compress(&self, input: &Utf8Path) -> Result<Compressed, HoardError> {
        let output = Self::output_path(input);
        if output.exists() {
            return Ok(Compressed {
                path: output,
                action: CompressAction::Existing,
            });
        }

        let temp = Staging::temp_beside(&output)?;
        match &self.backend {
            Backend::Pigz { program, threads } => {
                let sink = temp
                    .reopen()
                    .map_err(|err| HoardError::Filesystem(err.to_string()))?;
                run_pigz(program, *threads, input, sink)?;
            }
            Backend::InProcess => gzip_in_process(input, temp.as_file())?,
        }
        Staging::persist(temp, &output)?;
        tracing::debug!(path = %output, "compressed");

        Ok(Compressed {
            path: output,
            action: CompressAction::Compressed,
        })
    }
}

fn run_pigz(
    program: &Path,
    threads: usize,
    input: &Utf8Path,
    sink: File,
) -> Result<(), HoardError> {
    let output = Command::new(program)
        .arg("-p")
        .arg(threads.to_string())
        .arg("-c")
        .arg(input.as_std_path())
        .stdout(Stdio::from(sink))
        .stderr(Stdio::piped())
        .output()
        .map_err(|err| compression_err(input, format!("spawn {}: {err}", program.display())))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() {
        format!("pigz exited with {}", output.status)
    } else {
        stderr
    };
    Err(compression_err(input, message))
}

fn gzip_in_process(input: &Utf8Path, sink: &File) -> Result<(), HoardError> {
    let source = File::open(input.as_std_path())
        .map_err(|err| compression_err(input, err.to_string()))?;
    let mut reader = BufReader::new(source);
    let mut encoder = GzEncoder::new(sink, Compression::default());
    io::copy(&mut reader, &mut encoder).map_err(|err| compression_err(input, err.to_string()))?;
    encoder
        .finish()
        .map_err(|err| compression_err(input, err.to_string()))?;
    Ok(())
}

fn compression_err(input: &Utf8Path, message: String) -> HoardError {
    HoardError::Compression {
        path: input.to_string(),
        message,
    }
}

/// Leaves one core for the rest of the pipeline.
pub fn worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
