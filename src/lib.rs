pub mod chat;
pub mod citations;
pub mod config;
pub mod markdown;
pub mod models;
pub mod patch;
pub mod remote;
pub mod sanitize;
pub mod server;
pub mod session;
pub mod sources;

pub use config::AppConfig;
pub use server::run_server;
