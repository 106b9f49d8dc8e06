//! Browser terminal sessions
//!
//! Each session attaches a WebSocket to an interactive shell running inside a
//! sandbox container and bridges the two with three tasks: client input,
//! shell output and an exit watcher.

mod manager;
mod protocol;

pub use manager::{
    Connection, SessionSummary, TerminalError, TerminalManager, TerminalSession, WsSink, WsStream,
};
pub use protocol::{Message, MessageType, Utf8Decoder};
