pub mod api;
pub mod app;
pub mod cli;
pub mod config;
pub mod global;
pub mod live;
pub mod notify;
pub mod recorders;
