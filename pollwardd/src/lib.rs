#![deny(clippy::as_conversions)]

mod node;
mod sink;
mod telegram;

pub use node::*;
pub use sink::JsonLinesSink;
pub use telegram::{TelegramError, TelegramSource};
