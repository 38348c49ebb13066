//! Bot front end: command parsing, message handling and per-user dispatch.

pub mod command;
pub mod dispatcher;
pub mod handler;

pub use command::{Command, CommandParser, Input};
pub use dispatcher::Dispatcher;
pub use handler::Bot;
