pub mod agent;
pub mod config;
pub mod critic;
pub mod diagram;
pub mod document;
pub mod error;
pub mod fixtures;
pub mod llm;
pub mod pipeline;
pub mod publish;
pub mod render;
pub mod server;
pub mod state;
pub mod storage;
