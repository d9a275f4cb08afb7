pub mod catalog;
pub mod compress;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetcher;
pub mod inspect;
pub mod metadata;
pub mod mirror;
pub mod object_store;
pub mod output;
pub mod pipeline;
pub mod remote_index;
pub mod source;
pub mod staging;
pub mod upload;
