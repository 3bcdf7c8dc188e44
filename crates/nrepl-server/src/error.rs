// Copyright (C) 2025 Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NReplError>;

/// Number of leading bytes rendered into a protocol error preview
const PREVIEW_LEN: usize = 100;

#[derive(Debug, Error)]
pub enum NReplError {
    /// Socket-level failure; ends the connection it happened on
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// Malformed frame marker (e.g. a message that does not start with `d`)
    #[error("Protocol error at byte {position}: {message}{}", .buffer_preview.as_deref().unwrap_or(""))]
    Protocol {
        message: String,
        position: usize,
        buffer_preview: Option<String>,
    },

    /// Non-numeric length or integer, or a length above the allowed maximum
    #[error("Format error at byte {position}: {message}")]
    Format { message: String, position: usize },

    /// A string declared more bytes than the input holds
    #[error("Truncated input at byte {position}: expected {expected} bytes, {available} available")]
    TruncatedInput {
        position: usize,
        expected: usize,
        available: usize,
    },

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),
}

impl NReplError {
    /// Create a protocol error without context
    pub fn protocol(message: impl Into<String>, position: usize) -> Self {
        Self::Protocol {
            message: message.into(),
            position,
            buffer_preview: None,
        }
    }

    /// Create a protocol error with a hex preview of the offending buffer
    pub fn protocol_with_preview(
        message: impl Into<String>,
        position: usize,
        buffer: &[u8],
    ) -> Self {
        let preview_len = buffer.len().min(PREVIEW_LEN);
        let hex_preview = buffer[..preview_len]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ");

        Self::Protocol {
            message: message.into(),
            position,
            buffer_preview: Some(format!(" (buffer preview: {})", hex_preview)),
        }
    }

    pub fn format(message: impl Into<String>, position: usize) -> Self {
        Self::Format {
            message: message.into(),
            position,
        }
    }

    /// True for errors that only invalidate a single message, not the connection
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Connection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_preview_is_hex() {
        let err = NReplError::protocol_with_preview("Expected 'd'", 0, b"x1");
        let rendered = err.to_string();
        assert!(rendered.contains("Expected 'd'"));
        assert!(rendered.contains("buffer preview: 78 31"));
    }

    #[test]
    fn test_preview_is_capped() {
        let buffer = vec![b'a'; 500];
        match NReplError::protocol_with_preview("too long", 0, &buffer) {
            NReplError::Protocol {
                buffer_preview: Some(preview),
                ..
            } => assert_eq!(preview.matches("61").count(), PREVIEW_LEN),
            other => panic!("Expected Protocol error, got: {:?}", other),
        }
    }

    #[test]
    fn test_only_connection_errors_are_fatal() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(!NReplError::from(io).is_recoverable());
        assert!(NReplError::format("bad integer", 3).is_recoverable());
        assert!(NReplError::UnknownOperation("frobnicate".to_string()).is_recoverable());
    }
}
