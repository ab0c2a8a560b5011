pub mod ask;
pub mod start;
pub mod status;
