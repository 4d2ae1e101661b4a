//! Letters and the decoder that turns them into readable text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw letter as delivered by the upstream producer.
///
/// The body is hex-encoded UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Letter {
    pub writer: String,
    #[serde(default)]
    pub location: String,
    pub body: String,
}

/// Letter after a successful decode, ready for the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedLetter {
    pub author: String,
    pub location: String,
    pub content: String,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("letter has no writer")]
    MissingWriter,
    #[error("letter body is not valid hex")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("letter body is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Pure letter decoder. Must not have side effects.
pub trait Decoder: Send + Sync {
    fn decode(&self, letter: &Letter) -> Result<DecodedLetter, DecodeError>;
}

/// Decodes hex-encoded letter bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct HexDecoder;

impl Decoder for HexDecoder {
    fn decode(&self, letter: &Letter) -> Result<DecodedLetter, DecodeError> {
        let author = letter.writer.trim();
        if author.is_empty() {
            return Err(DecodeError::MissingWriter);
        }

        let bytes = hex::decode(letter.body.trim())?;
        let content = String::from_utf8(bytes)?;

        Ok(DecodedLetter {
            author: author.to_string(),
            location: letter.location.clone(),
            content,
        })
    }
}

impl Letter {
    /// Build a letter with a hex-encoded body from plain text.
    pub fn encode(writer: impl Into<String>, location: impl Into<String>, text: &str) -> Self {
        Self {
            writer: writer.into(),
            location: location.into(),
            body: hex::encode(text),
        }
    }
}
