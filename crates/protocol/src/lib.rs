//! # Sandpit Protocol Library
//!
//! Wire types shared by the Sandpit server and its clients.
//!
//! ## Overview
//!
//! - **Requests**: one closed [`Request`] enum covering heartbeat, file,
//!   deployment and terminal events, wrapped in an [`Envelope`] with a
//!   correlation id
//! - **Replies and pushes**: [`Outbound`] frames carrying either a [`Reply`]
//!   to a request or a [`ServerEvent`] pushed by the server
//! - **Codec**: JSON for text frames, MessagePack for binary frames
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Encoding, Envelope, Request};
//! use protocol::messages::TerminalTarget;
//!
//! let envelope = Envelope::new(1, Request::CreateTerminal(TerminalTarget { id: "main".into() }));
//! let bytes = Encoding::Json.encode(&envelope).unwrap();
//! let decoded = Encoding::Json.decode_envelope(&bytes).unwrap();
//! assert_eq!(decoded, envelope);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Protocol message definitions
//! - [`codec`]: Frame encoding
//! - [`error`]: Error types

pub mod codec;
pub mod error;
pub mod messages;

pub use codec::{Encoding, MAX_FRAME_SIZE};
pub use error::{ProtocolError, Result};
pub use messages::{
    Dimensions, Envelope, ErrorCode, ErrorMessage, FileKind, FileNode, Outbound, Reply,
    ReplyResult, Request, Response, ServerEvent, PROTOCOL_VERSION,
};
