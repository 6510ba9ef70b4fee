//! Terminals: shell processes bridged to connections.
//!
//! - [`ProcessSession`]: one shell and the task pumping its output to a sink
//! - [`TerminalMultiplexer`]: the shells of one project, keyed by logical id
//! - [`preview`]: dev-server URL detection in output

pub mod multiplexer;
pub mod preview;
pub mod process;

pub use multiplexer::TerminalMultiplexer;
pub use process::{OutputSink, ProcessSession};
