//! Client engine for the Debug Adapter Protocol (DAP) server embedded in the
//! Godot editor.
//!
//! The engine opens a `Content-Length`-framed TCP connection to the editor's
//! debug adapter, sends typed requests, correlates the asynchronous responses
//! back to their callers, and fans unsolicited events out to observers. A
//! [`Session`] wraps the lower-level [`Client`] with the launch/configuration
//! ordering Godot requires before execution may begin:
//!
//! ```text
//! initialize -> launch (stored) -> setBreakpoints* -> configurationDone -> run/stop
//! ```
//!
//! Godot only starts the game when `configurationDone` arrives, and it refuses
//! breakpoints set after that point, so the [`Session`] state machine rejects
//! out-of-order calls locally before any bytes reach the wire.
//!
//! [`Client`] is safe to share across tasks: a single background read task
//! owns the receive side of the connection, while any number of concurrent
//! callers may issue requests. Every blocking call carries a deadline and is
//! woken with [`DapError::Disconnected`] when the connection goes away.

pub mod codec;
pub mod launch;
pub mod messages;

mod client;
mod poison;
mod session;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;

use std::io;

use thiserror::Error;

pub use client::{Client, ClientConfig};
pub use launch::{resolve_source_path, LaunchConfig, LaunchConfigError, Platform, SceneMode};
pub use messages::{
    Breakpoint, Capabilities, ContinueOutcome, EvaluateOutcome, Event, Scope, Source, StackFrame,
    StackTrace, StoppedBody, Thread, Variable,
};
pub use session::{LaunchHandle, Session, SessionState};

pub type Result<T> = std::result::Result<T, DapError>;

/// Every way a façade call can fail.
///
/// `Protocol` and `Timeout` are local to one call; framing/encoding failures
/// on the read path poison the whole connection and surface as
/// `Disconnected` on every outstanding and future call.
#[derive(Debug, Error)]
pub enum DapError {
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// The `Content-Length` header section was malformed. The byte stream can
    /// no longer be trusted and the connection is torn down.
    #[error("malformed frame: {0}")]
    Framing(String),

    /// A frame body was not a well-formed DAP message.
    #[error("malformed message: {0}")]
    Encoding(String),

    /// The adapter answered with `success: false`; carries the adapter's own
    /// error message.
    #[error("adapter error: {0}")]
    Protocol(String),

    /// The operation is not allowed in the session's current lifecycle state.
    /// Rejected locally, before any I/O.
    #[error("{operation} is not valid while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("invalid launch configuration: {0}")]
    LaunchConfig(#[from] LaunchConfigError),

    #[error("no response from the adapter within the deadline")]
    Timeout,

    /// The connection went away, whichever side closed it; every blocked
    /// caller wakes with this.
    #[error("connection closed while the call was outstanding")]
    Disconnected,

    /// A single call was cancelled by its caller before completing.
    /// Connection teardown is not cancellation; it is `Disconnected`.
    #[error("call cancelled")]
    Cancelled,
}
