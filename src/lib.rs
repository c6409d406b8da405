pub mod api;
pub mod config;
pub mod conversation;
pub mod inference;
