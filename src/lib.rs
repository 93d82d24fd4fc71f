pub mod config;
pub mod content;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod service;
pub mod store;
pub mod ui;
