//! Error types.

use std::io;

use crate::core::message::{Arity, MessageKind};

/// Errors produced while decoding the text wire format.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("invalid length prefix `{0}`")]
    InvalidLength(String),
    #[error("declared length {declared} doesn't match the actual length {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("missing message kind")]
    MissingKind,
    #[error("unknown message kind `{0}`")]
    UnknownKind(String),
    #[error("unterminated quoted field")]
    UnterminatedQuote,
    #[error("dangling escape in quoted field")]
    DanglingEscape,
    #[error("{kind} expects {expected} fields, got {actual}")]
    FieldCount {
        kind: MessageKind,
        expected: Arity,
        actual: usize,
    },
}

/// Errors produced while reading a typed payload out of a [`Message`](crate::message::Message).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("expected a {expected} message, got {actual}")]
    WrongKind {
        expected: MessageKind,
        actual: MessageKind,
    },
    #[error("{kind} is missing field {index}")]
    MissingField { kind: MessageKind, index: usize },
    #[error("invalid {what} `{value}`")]
    Invalid { what: &'static str, value: String },
}

impl PayloadError {
    pub(crate) fn invalid(what: &'static str, value: &str) -> Self {
        Self::Invalid {
            what,
            value: value.to_owned(),
        }
    }
}

/// The crate-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("no tokio runtime is available")]
    NoRuntime,
}
