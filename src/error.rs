use std::fmt::{Display, Formatter};

use crate::protocol::response::Response;

/// A terminal server reply with an error code (4xx / 5xx).
///
/// Delivered through `anyhow::Error` so callers that care about the reply
///  code can `downcast_ref::<ReplyError>()` while everything else treats it
///  as an opaque failure.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReplyError {
    pub code: u16,
    pub text: String,
}

impl ReplyError {
    pub(crate) fn from_response(response: &Response) -> ReplyError {
        ReplyError {
            code: response.code,
            text: response.text.clone(),
        }
    }
}

impl Display for ReplyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

impl std::error::Error for ReplyError {}
