//! Hook events - 監査ログ
//!
//! HookEvent は実行の各フェーズ（pre / post / stop）を記録する追記専用レコードです。
//! Task の状態遷移には一切影響しません。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::errors::TaskError;
use super::ids::{EventId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPhase {
    /// Before the handler is invoked.
    Pre,
    /// After the handler returned (or was abandoned).
    Post,
    /// After the task's state was finalized for this attempt.
    Stop,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HookPhase::Pre => "pre",
            HookPhase::Post => "post",
            HookPhase::Stop => "stop",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookEvent {
    pub event_id: EventId,
    pub task_id: TaskId,
    pub phase: HookPhase,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub timestamp: DateTime<Utc>,
}

const DIGEST_HEX_LEN: usize = 16;

/// Short SHA-256 digest (first 16 hex chars) of a value's JSON encoding.
///
/// Returns `None` if the value cannot be encoded.
pub fn digest<T: Serialize + ?Sized>(value: &T) -> Option<String> {
    let bytes = serde_json::to_vec(value).ok()?;
    let hash = Sha256::digest(&bytes);
    let mut hex = String::with_capacity(DIGEST_HEX_LEN);
    for byte in hash.iter().take(DIGEST_HEX_LEN / 2) {
        hex.push_str(&format!("{byte:02x}"));
    }
    Some(hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_and_short() {
        let a = digest(&["AAPL", "MSFT"]).unwrap();
        let b = digest(&["AAPL", "MSFT"]).unwrap();
        let c = digest(&["MSFT", "AAPL"]).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn phase_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&HookPhase::Stop).unwrap(), "\"stop\"");
        assert_eq!(HookPhase::Pre.to_string(), "pre");
    }
}
