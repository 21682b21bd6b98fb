//! Image Insight Service Library

pub mod config;
pub mod engine;
pub mod service;
pub mod storage;
pub mod api;
pub mod utils;

pub use config::Config;
