//! Concrete transports for the relay pipeline.

pub mod telegram;

pub use telegram::{TelegramConfig, TelegramTransport};
