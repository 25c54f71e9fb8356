//! Error types for the wire layer

use thiserror::Error;

/// Errors produced while splitting a byte stream into protocol lines
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// More than the permitted number of bytes accumulated without a `\r\n`
    #[error("line exceeds {max} bytes without a terminator")]
    LineTooLong {
        /// The configured line cap
        max: usize,
    },

    /// A complete line was found but is not valid UTF-8
    #[error("line is not valid utf-8")]
    Encoding,
}

/// Errors produced while parsing a framed line into a request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// VERB or REQ_ID is missing, empty, or longer than the token cap
    #[error("malformed request line")]
    Malformed,
}
