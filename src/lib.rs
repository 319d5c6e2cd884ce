//! tg-relay: filter, rewrite and forward messages from monitored chats.

pub mod channels;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod pipeline;
pub mod shutdown;
