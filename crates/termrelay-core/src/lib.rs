//! termrelay-core: Shared protocol library for the terminal relay.
//!
//! Provides the JSON frame types and codec, the error taxonomy shared by the
//! server and clients, HMAC bearer tokens, and incremental UTF-8 decoding of
//! terminal output.

pub mod error;
pub mod frame;
pub mod text;
pub mod token;

// Re-export commonly used items at crate root.
pub use error::{RelayError, RelayResult};
pub use frame::{
    decode, decode_bytes, encode, DecodeError, ErrorCode, Frame, SessionId, SessionType,
    TerminalSize,
};
pub use text::Utf8Stream;
pub use token::{generate_secret, issue_token, verify_token};
