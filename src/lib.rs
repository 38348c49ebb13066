//! Taskbot: a role-gated task-assignment chat bot.

pub mod access;
pub mod bot;
pub mod channels;
pub mod config;
pub mod dialog;
pub mod error;
pub mod reminder;
pub mod session;
pub mod store;
