//! Channel abstraction for message I/O.

pub mod channel;
#[cfg(test)]
pub(crate) mod recording;
pub mod telegram;

pub use channel::*;
pub use telegram::TelegramChannel;
