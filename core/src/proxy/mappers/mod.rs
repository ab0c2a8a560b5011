// Mappers module
pub mod history;
pub mod request;
pub mod gemini;
