//! Nutrik Core Library
//! Chat orchestration over the Gemini API, configuration, and the HTTP server

pub mod config;
pub mod error;
pub mod proxy;
