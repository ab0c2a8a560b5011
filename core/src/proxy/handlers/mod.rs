// Handlers module
pub mod chat;
