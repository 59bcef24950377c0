//! HTTP listener feeding the output multiplexer

pub mod config;
pub mod listener;

pub use config::{ListenerConfig, DEFAULT_HTTP_PORT};
pub use listener::{ClientHandler, HttpServer};
