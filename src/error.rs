//! Errors for the channel runtime.
//!
//! Important note: error variants avoid borrowing so a [`ConnectorError`] can
//! be cloned and delivered to every pending instruction a `failAll` drains.

use std::fmt;

/// A stable error-category identifier, either one of the client's own fixed
/// categories or a code propagated verbatim from the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ErrorCategory(String);

impl ErrorCategory {
    /// Sent back to the peer when a command has no registered handler.
    pub const NO_HANDLER_FOR_COMMAND: &'static str = "NO_HANDLER_FOR_COMMAND";
    /// Sent back to the peer when a query has no registered handler.
    pub const NO_HANDLER_FOR_QUERY: &'static str = "NO_HANDLER_FOR_QUERY";
    /// A registered handler raised an error while processing a command.
    pub const COMMAND_EXECUTION_ERROR: &'static str = "COMMAND_EXECUTION_ERROR";
    /// The command could not be handed to the transport at all.
    pub const COMMAND_DISPATCH_ERROR: &'static str = "COMMAND_DISPATCH_ERROR";

    /// Wraps any code, client-defined or server-supplied.
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// The raw category string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ErrorCategory {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A server-supplied error, as carried by a negative ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// The error category reported by the server.
    pub category: ErrorCategory,
    /// A human-readable message accompanying the category.
    pub message: String,
}

/// All errors surfaced by the channel runtime to user code.
///
/// Every variant is cheap to clone: `failAll` clones one cause across every
/// pending completion it drains.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectorError {
    /// The underlying transport was lost (connection reset, stream ended
    /// unexpectedly, or the peer closed the stream).
    #[error("transport lost on {channel} channel: {reason}")]
    Transport {
        /// Which logical channel lost its transport.
        channel: &'static str,
        /// A human-readable description of the loss.
        reason: String,
    },

    /// A send to the outbound stream could not be performed locally (no
    /// stream is currently installed, or the transport signalled local
    /// backpressure/buffer exhaustion).
    #[error("local dispatch failure ({category}): {message}")]
    LocalDispatch {
        /// The error category to report, e.g. [`ErrorCategory::COMMAND_DISPATCH_ERROR`].
        category: ErrorCategory,
        /// A human-readable description.
        message: String,
    },

    /// The server responded to a tracked instruction with a negative ack.
    #[error("server rejected instruction {instruction_id} ({}): {message}", .category)]
    ServerNack {
        /// The instruction id the nack correlates to.
        instruction_id: String,
        /// The server-reported error category.
        category: ErrorCategory,
        /// The server-reported message.
        message: String,
    },

    /// A user-registered handler raised an error while processing a frame.
    #[error("handler '{name}' failed: {message}")]
    HandlerExecution {
        /// The command or query name the handler was registered under.
        name: String,
        /// The error message the handler produced.
        message: String,
    },

    /// An inbound frame carried a kind the dispatch table has no routine
    /// for. Non-fatal: a nack is sent and the stream stays open.
    #[error("protocol violation: unknown frame kind '{kind}'")]
    ProtocolViolation {
        /// The unrecognized frame kind, for logging.
        kind: String,
        /// The instruction id to nack, if the frame carried one.
        instruction_id: Option<String>,
    },

    /// The channel has no active connection and the caller did not ask to
    /// wait for reconnection.
    #[error("channel is disconnected")]
    Disconnected,
}

impl ConnectorError {
    /// Builds the error a pending instruction resolves with when the server
    /// acks negatively.
    #[must_use]
    pub fn from_server_error(instruction_id: impl Into<String>, err: ServerError) -> Self {
        ConnectorError::ServerNack {
            instruction_id: instruction_id.into(),
            category: err.category,
            message: err.message,
        }
    }
}
