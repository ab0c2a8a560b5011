//! Chat relay - request orchestration and HTTP server

pub mod server;
pub mod handlers;
pub mod mappers;
pub mod upstream;
pub mod rate_limit;
pub mod streaming;
pub mod service;

pub use server::{AppState, ChatServer};
pub use service::{ChatInput, ChatService};
pub use upstream::client::{GeminiClient, GenerativeProvider};
