//! Parley wire protocol
//!
//! The framing and line grammar shared by the server and any protocol
//! client: CRLF line framing with a hard size cap, and the
//! `VERB REQ_ID key=value...` request grammar with its OK/ERR/PUSH
//! response shapes.

#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod error;
pub mod framing;
pub mod wire;

pub use error::{FrameError, WireError};
pub use framing::{LineFramer, MAX_LINE};
pub use wire::{fmt_err, fmt_ok, fmt_push, kv_get, PushSubject, Request};
