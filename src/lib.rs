pub mod app;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetcher;
pub mod mapping;
pub mod output;
pub mod progress;
pub mod reconciler;
pub mod remote;
pub mod resolve;
pub mod store;
