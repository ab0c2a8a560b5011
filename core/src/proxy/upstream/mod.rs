// Upstream module
pub mod client;
pub mod dispatcher;
