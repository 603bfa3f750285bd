pub mod cache;
pub mod chat;
pub mod config;
pub mod diagnostics;
pub mod twitch;
