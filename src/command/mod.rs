//! The Command channel: fire-and-forget dispatch with at-most-once handling.

pub mod channel;
pub mod handler;

pub use channel::{CommandChannel, CommandHandlerRegistration};
pub use handler::{CommandHandler, CommandHandlerRegistry, HandlerError};
