pub mod config;
pub mod encoding;
pub mod error;
pub mod gateway;
pub mod gemini;
pub mod image_processing;
pub mod models;
pub mod pipeline;
pub mod state;
pub mod storage;
