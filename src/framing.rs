//! Incremental JSON framing
//!
//! Senders write bare JSON values back to back with no length prefix or
//! delimiter. Bytes are buffered until a complete value parses; a value split
//! across reads waits for the rest, several values in one read come out one
//! at a time.

use serde_json::{Deserializer, Value};
use thiserror::Error;

/// Framing failures. Both leave the stream unsynchronized, so the
/// connection is closed.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("invalid JSON in stream: {0}")]
    Syntax(#[source] serde_json::Error),

    #[error("buffered {0} bytes without a complete value")]
    Oversized(usize),
}

pub struct JsonFramer {
    buf: Vec<u8>,
    max_bytes: usize,
}

impl JsonFramer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_bytes,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held back waiting for the end of a value
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete value, or `None` if more bytes are needed
    pub fn next_value(&mut self) -> Result<Option<Value>, FrameError> {
        let (next, consumed) = {
            let mut stream = Deserializer::from_slice(&self.buf).into_iter::<Value>();
            let next = stream.next();
            (next, stream.byte_offset())
        };

        match next {
            Some(Ok(value)) => {
                self.buf.drain(..consumed);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => {
                if self.buf.len() > self.max_bytes {
                    return Err(FrameError::Oversized(self.buf.len()));
                }
                Ok(None)
            }
            Some(Err(e)) => Err(FrameError::Syntax(e)),
            None => {
                // Only whitespace left
                self.buf.clear();
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(framer: &mut JsonFramer) -> Vec<Value> {
        let mut out = Vec::new();
        while let Some(value) = framer.next_value().unwrap() {
            out.push(value);
        }
        out
    }

    #[test]
    fn test_single_value() {
        let mut framer = JsonFramer::new(1024);
        framer.push(br#"{"type":"ping"}"#);
        assert_eq!(drain(&mut framer), vec![json!({"type": "ping"})]);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_value_split_across_reads() {
        let mut framer = JsonFramer::new(1024);
        framer.push(br#"{"type":"send_"#);
        assert!(framer.next_value().unwrap().is_none());
        framer.push(br#"message","id":"m1"}"#);
        assert_eq!(
            framer.next_value().unwrap(),
            Some(json!({"type": "send_message", "id": "m1"}))
        );
    }

    #[test]
    fn test_several_values_in_one_read() {
        let mut framer = JsonFramer::new(1024);
        framer.push(b"{\"type\":\"ping\"}{\"type\":\"get_status\"}\n  {\"type\":\"get_");
        let values = drain(&mut framer);
        assert_eq!(values.len(), 2);
        assert_eq!(values[1]["type"], "get_status");

        framer.push(br#"messages"}"#);
        assert_eq!(drain(&mut framer), vec![json!({"type": "get_messages"})]);
    }

    #[test]
    fn test_whitespace_only_is_discarded() {
        let mut framer = JsonFramer::new(1024);
        framer.push(b" \r\n\t ");
        assert!(framer.next_value().unwrap().is_none());
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_braces_inside_strings() {
        let mut framer = JsonFramer::new(1024);
        framer.push(br#"{"type":"send_message","text":"}{ not a boundary"}"#);
        let values = drain(&mut framer);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["text"], "}{ not a boundary");
    }

    #[test]
    fn test_syntax_error() {
        let mut framer = JsonFramer::new(1024);
        framer.push(b"{\"type\": oops}");
        assert!(matches!(framer.next_value(), Err(FrameError::Syntax(_))));
    }

    #[test]
    fn test_oversized_partial_value() {
        let mut framer = JsonFramer::new(16);
        framer.push(br#"{"type":"sync_contacts","contacts":["#);
        assert!(matches!(framer.next_value(), Err(FrameError::Oversized(_))));
    }

    #[test]
    fn test_multibyte_split() {
        let mut framer = JsonFramer::new(1024);
        let bytes = r#"{"text":"hej då"}"#.as_bytes();
        let split = bytes.iter().position(|b| *b == 0xC3).unwrap() + 1;
        framer.push(&bytes[..split]);
        assert!(framer.next_value().unwrap().is_none());
        framer.push(&bytes[split..]);
        assert_eq!(framer.next_value().unwrap(), Some(json!({"text": "hej då"})));
    }
}
