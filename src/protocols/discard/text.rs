//! Streaming UTF-8 decoding for logged inbound text.

use crate::error::ConnectionError;

/// Decodes a byte stream as UTF-8 chunk by chunk.
///
/// A multi-byte character split across two chunks is held back and
/// completed by the next chunk. Only bytes that can never form valid
/// UTF-8 are an error.
#[derive(Debug, Default)]
pub struct TextDecoder {
    /// Trailing bytes of an incomplete character (at most 3).
    pending: Vec<u8>,
    /// Stream bytes seen so far, including `pending`.
    position: usize,
}

impl TextDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next chunk, returning the complete text it finishes.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<String, ConnectionError> {
        let start = self.position - self.pending.len();
        self.position += chunk.len();

        let mut combined = std::mem::take(&mut self.pending);
        combined.extend_from_slice(chunk);

        match std::str::from_utf8(&combined) {
            Ok(text) => Ok(text.to_owned()),
            Err(e) => {
                let valid = e.valid_up_to();
                if e.error_len().is_some() {
                    return Err(ConnectionError::Decode {
                        offset: start + valid,
                    });
                }
                self.pending = combined.split_off(valid);
                String::from_utf8(combined).map_err(|e| ConnectionError::Decode {
                    offset: start + e.utf8_error().valid_up_to(),
                })
            }
        }
    }

    /// Bytes held back waiting for the rest of a character.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
