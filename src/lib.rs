pub mod app;
pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod providers;
pub mod relay;
pub mod request;
pub mod store;
pub mod transcript;
pub mod upstream;
