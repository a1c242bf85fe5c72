//! Streaming output
//!
//! What an engine sends back for one request, piece by piece.

/// Represents one message from a generation task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamToken {
    /// A piece of output text
    Token(String),
    /// Generation completed successfully
    Done,
    /// Generation failed; nothing follows
    Error(String),
}

impl StreamToken {
    /// Returns true if this is a token variant
    pub fn is_token(&self) -> bool {
        matches!(self, StreamToken::Token(_))
    }

    /// Extracts the token string if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamToken::Token(s) => Some(s),
            _ => None,
        }
    }
}
