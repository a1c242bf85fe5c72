//! Text codec
//!
//! Converts between the host's string representation (UTF-16 code units, as
//! handed over by JVM, .NET and JS runtimes) and the byte-exact UTF-8 the
//! native side works with.

use thiserror::Error;

/// Errors raised when text cannot be converted losslessly
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unpaired surrogate 0x{unit:04X} at code unit {index}")]
    UnpairedSurrogate { index: usize, unit: u16 },

    #[error("invalid UTF-8 sequence at byte {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("truncated UTF-8 sequence at byte {offset}")]
    TruncatedUtf8 { offset: usize },

    #[error("null text pointer with length {0}")]
    NullPointer(usize),

    #[error("null output pointer for returned text")]
    NullOutput,
}

/// Encodes host text as UTF-8.
///
/// Surrogate pairs are combined into a single code point; a lone surrogate is
/// rejected instead of being replaced.
pub fn encode(host: &[u16]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(host.len());
    let mut index = 0;
    for decoded in char::decode_utf16(host.iter().copied()) {
        match decoded {
            Ok(c) => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                index += c.len_utf16();
            }
            Err(e) => {
                return Err(CodecError::UnpairedSurrogate {
                    index,
                    unit: e.unpaired_surrogate(),
                })
            }
        }
    }
    Ok(out)
}

/// Decodes UTF-8 bytes into host text.
pub fn decode(bytes: &[u8]) -> Result<Vec<u16>, CodecError> {
    let text = utf8_str(bytes)?;
    Ok(text.encode_utf16().collect())
}

/// Host text to an owned Rust string.
pub fn host_to_string(host: &[u16]) -> Result<String, CodecError> {
    let bytes = encode(host)?;
    // `encode` only produces well-formed UTF-8.
    String::from_utf8(bytes).map_err(|e| CodecError::InvalidUtf8 {
        offset: e.utf8_error().valid_up_to(),
    })
}

/// Rust string to host text.
pub fn string_to_host(text: &str) -> Vec<u16> {
    text.encode_utf16().collect()
}

fn utf8_str(bytes: &[u8]) -> Result<&str, CodecError> {
    std::str::from_utf8(bytes).map_err(|e| classify(e, 0))
}

fn classify(e: std::str::Utf8Error, base: usize) -> CodecError {
    let offset = base + e.valid_up_to();
    match e.error_len() {
        Some(_) => CodecError::InvalidUtf8 { offset },
        None => CodecError::TruncatedUtf8 { offset },
    }
}

/// Reassembles UTF-8 text from arbitrary byte pieces.
///
/// Token pieces produced by a tokenizer may split a multi-byte character.
/// The assembler hands out the longest complete prefix and keeps the
/// incomplete tail until the next piece arrives.
#[derive(Debug, Default)]
pub struct Utf8Assembler {
    pending: Vec<u8>,
    consumed: usize,
}

impl Utf8Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `piece` and returns whatever complete text is now available.
    ///
    /// Returns an empty string while a character is still incomplete.
    pub fn push(&mut self, piece: &[u8]) -> Result<String, CodecError> {
        self.pending.extend_from_slice(piece);

        let complete = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) => match e.error_len() {
                Some(_) => return Err(classify(e, self.consumed)),
                None => e.valid_up_to(),
            },
        };

        let tail = self.pending.split_off(complete);
        let head = std::mem::replace(&mut self.pending, tail);
        self.consumed += head.len();
        String::from_utf8(head).map_err(|e| classify(e.utf8_error(), self.consumed))
    }

    /// Returns true if bytes of an incomplete character are held back.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Ends the stream, dropping a held-back partial character.
    ///
    /// Returns how many bytes were dropped.
    pub fn discard_pending(self) -> usize {
        self.pending.len()
    }

    /// Ends the stream; a held-back partial character is an error.
    pub fn finish(self) -> Result<(), CodecError> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(CodecError::TruncatedUtf8 {
                offset: self.consumed,
            })
        }
    }
}
