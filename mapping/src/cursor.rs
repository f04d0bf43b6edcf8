use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Position in a mapping listing. Entries are listed by canonical filter key;
/// the next page starts after `after`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MappingCursor {
    pub after: String,
}

impl MappingCursor {
    pub fn new<S: Into<String>>(after: S) -> Self {
        MappingCursor {
            after: after.into(),
        }
    }

    pub fn encode(&self) -> String {
        // Serializing a struct of one string cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        STANDARD.encode(json)
    }
}

impl FromStr for MappingCursor {
    type Err = CursorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = STANDARD.decode(s.as_bytes())?;
        let cursor: MappingCursor = serde_json::from_slice(&decoded)?;
        Ok(cursor)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("Invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
