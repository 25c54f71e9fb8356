//! Request/response line grammar
//!
//! One logical line is one protocol unit:
//!
//! ```text
//! Request : VERB SP REQ_ID [SP payload]
//! OK      : OK SP REQ_ID [SP payload]
//! ERR     : ERR SP REQ_ID SP CODE SP MESSAGE
//! Push    : PUSH SP SUBJECT SP payload
//! ```
//!
//! Payloads are flat `key=value` sequences separated by single spaces. Values
//! cannot contain spaces; everything after the first `=` of a token belongs to
//! the value, so Base64 padding survives untouched.

use crate::error::WireError;

/// Upper bound on the VERB and REQ_ID tokens, in bytes.
pub const MAX_TOKEN: usize = 31;

/// A parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Command verb, e.g. `LOGIN`.
    pub verb: String,
    /// Client-chosen correlation id echoed back in the response.
    pub req_id: String,
    /// Raw payload text after the second token; empty when absent.
    pub payload: String,
}

impl Request {
    /// Parse a framed line (terminator already stripped) into a request.
    ///
    /// Leading spaces and runs of spaces between tokens are tolerated, the
    /// way a forgiving hand-typed client expects. VERB and REQ_ID must be
    /// present, non-empty and at most [`MAX_TOKEN`] bytes.
    pub fn parse(line: &str) -> Result<Request, WireError> {
        let rest = line.trim_start_matches(' ');

        let (verb, rest) = split_token(rest)?;
        let rest = rest.trim_start_matches(' ');
        let (req_id, rest) = split_token(rest)?;
        let payload = rest.trim_start_matches(' ');

        Ok(Request {
            verb: verb.to_owned(),
            req_id: req_id.to_owned(),
            payload: payload.to_owned(),
        })
    }

    /// Look up a payload key, first match wins.
    pub fn arg(&self, key: &str) -> Option<&str> {
        kv_get(&self.payload, key)
    }
}

fn split_token(s: &str) -> Result<(&str, &str), WireError> {
    let end = s.find(' ').unwrap_or(s.len());
    let token = &s[..end];
    if token.is_empty() || token.len() > MAX_TOKEN {
        return Err(WireError::Malformed);
    }
    Ok((token, &s[end..]))
}

/// Extract the value of `key` from a flat `key=value` payload.
///
/// Tokens without `=` are skipped; only the first `=` of a token splits key
/// from value, and only the first matching token is returned.
pub fn kv_get<'a>(payload: &'a str, key: &str) -> Option<&'a str> {
    payload
        .split(' ')
        .filter(|t| !t.is_empty())
        .find_map(|token| {
            let (k, v) = token.split_once('=')?;
            (k == key).then_some(v)
        })
}

/// Subjects a server-initiated push frame may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushSubject {
    /// Live private message to a recipient viewing the conversation.
    Pm,
    /// The 1:1 partner entered the conversation view.
    Join,
    /// The 1:1 partner left the conversation view.
    Leave,
    /// Live group message to members viewing the group.
    Gm,
    /// A member entered the group (membership or chat view).
    GmJoin,
    /// A member left the group (membership or chat view).
    GmLeave,
    /// The receiving member was removed from the group by its owner.
    GmKicked,
}

impl PushSubject {
    /// Wire spelling of the subject.
    pub fn as_str(self) -> &'static str {
        match self {
            PushSubject::Pm => "PM",
            PushSubject::Join => "JOIN",
            PushSubject::Leave => "LEAVE",
            PushSubject::Gm => "GM",
            PushSubject::GmJoin => "GM_JOIN",
            PushSubject::GmLeave => "GM_LEAVE",
            PushSubject::GmKicked => "GM_KICKED",
        }
    }
}

/// Format a success response, omitting the payload slot when empty.
pub fn fmt_ok(req_id: &str, payload: &str) -> String {
    if payload.is_empty() {
        format!("OK {req_id}\r\n")
    } else {
        format!("OK {req_id} {payload}\r\n")
    }
}

/// Format an error response.
pub fn fmt_err(req_id: &str, code: u16, message: &str) -> String {
    format!("ERR {req_id} {code} {message}\r\n")
}

/// Format a push frame.
pub fn fmt_push(subject: PushSubject, payload: &str) -> String {
    format!("PUSH {} {payload}\r\n", subject.as_str())
}
