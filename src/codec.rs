//! Inline encoding of per-request result records.
//!
//! A record looks like `-~:<hash_ms>:<success>:<total_ms>:~-` and may sit
//! anywhere inside a larger line of log text.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LoadtestError, Result};

pub const START_TAG: &str = "-~:";
pub const END_TAG: &str = ":~-";
pub const DELIMITER: &str = ":";

/// Non-greedy match of one tagged record; group 1 is the field payload
pub static RECORD_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        "{}(.*?){}",
        regex::escape(START_TAG),
        regex::escape(END_TAG)
    ))
    .unwrap()
});

/// Outcome and timing of a single request attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestResult {
    pub success: bool,
    /// Server-reported processing time (opaque response body)
    pub hash_duration_millis: i64,
    /// Round trip observed by the worker
    pub total_duration_millis: i64,
}

impl RequestResult {
    pub fn success(hash_duration_millis: i64, total_duration_millis: i64) -> Self {
        Self {
            success: true,
            hash_duration_millis,
            total_duration_millis,
        }
    }

    /// A failed attempt carries no timing
    pub fn failure() -> Self {
        Self {
            success: false,
            hash_duration_millis: 0,
            total_duration_millis: 0,
        }
    }
}

impl fmt::Display for RequestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode(self))
    }
}

/// Encode a result as a tagged record
///
/// Failed results always serialize both durations as `0`, whatever the
/// struct holds.
pub fn encode(result: &RequestResult) -> String {
    let (hash, total) = if result.success {
        (result.hash_duration_millis, result.total_duration_millis)
    } else {
        (0, 0)
    };

    format!(
        "{START_TAG}{hash}{DELIMITER}{}{DELIMITER}{total}{END_TAG}",
        result.success
    )
}

/// Decode a tagged record
///
/// Accepts either the full tagged substring or just its payload
/// (`<hash>:<success>:<total>`).
pub fn decode(record: &str) -> Result<RequestResult> {
    let payload = record.strip_prefix(START_TAG).unwrap_or(record);
    let payload = payload.strip_suffix(END_TAG).unwrap_or(payload);

    let malformed = || LoadtestError::MalformedRecord(record.to_string());

    let parts: Vec<&str> = payload.split(DELIMITER).collect();
    if parts.len() != 3 {
        return Err(malformed());
    }

    let hash_duration_millis: i64 = parts[0].parse().map_err(|_| malformed())?;
    let success = match parts[1] {
        "true" => true,
        "false" => false,
        _ => return Err(malformed()),
    };
    let total_duration_millis: i64 = parts[2].parse().map_err(|_| malformed())?;

    if !success {
        return Ok(RequestResult::failure());
    }

    Ok(RequestResult::success(
        hash_duration_millis,
        total_duration_millis,
    ))
}

/// Break up any tags in free text so it can share the output stream
/// with records without being decoded as one
pub fn defang(text: &str) -> String {
    text.replace(START_TAG, "-~ :").replace(END_TAG, ": ~-")
}
