use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Position of the change detector in the durable store's change stream.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ChangeCursor {
    // milliseconds since 1970-01-01 00:00:00 UTC
    pub start_time: i64,
    // Highest row id consumed in the current pass. None between passes.
    pub last_id: Option<u64>,
}

impl ChangeCursor {
    pub fn at(start_time: i64) -> Self {
        ChangeCursor {
            start_time,
            last_id: None,
        }
    }

    pub fn advance(&mut self, id: u64) {
        self.last_id = Some(self.last_id.map_or(id, |last| last.max(id)));
    }

    pub fn page_start(&self) -> u64 {
        self.last_id.unwrap_or(0)
    }
}

impl fmt::Display for ChangeCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_vec(self).map_err(|_| fmt::Error)?;
        f.write_str(&STANDARD.encode(json))
    }
}

impl FromStr for ChangeCursor {
    type Err = CursorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = STANDARD.decode(s.trim().as_bytes())?;
        let cursor: ChangeCursor = serde_json::from_slice(&decoded)?;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_parse() {
        let cursor_data = serde_json::json!({
            "start_time": 1757030409000i64,
            "last_id": null
        });
        let encoded = STANDARD.encode(cursor_data.to_string().as_bytes());

        let cursor: ChangeCursor = encoded.parse().unwrap();
        assert_eq!(cursor, ChangeCursor::at(1757030409000));
    }

    #[test]
    fn test_display_parses_back() {
        let mut cursor = ChangeCursor::at(42);
        cursor.advance(7);
        cursor.advance(3);
        assert_eq!(cursor.page_start(), 7);
        let parsed: ChangeCursor = format!("{cursor}\n").parse().unwrap();
        assert_eq!(parsed, cursor);
    }

    #[test]
    fn test_invalid_base64() {
        let result: Result<ChangeCursor, _> = "invalid!".parse();
        assert!(matches!(result, Err(CursorError::Base64(_))));
    }
}
