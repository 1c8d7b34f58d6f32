//! Tracked entities (instruments) and their analysis bookkeeping.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::VigilError;

const MAX_ENTITY_ID_LEN: usize = 64;

/// Identifier of a tracked entity, e.g. `AAPL` or `NYSE:BRK.B`.
///
/// Ordering is plain lexicographic on the string, which the scheduler
/// relies on for its tie-break.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    /// Validate and wrap an entity id.
    pub fn parse(raw: impl Into<String>) -> Result<Self, VigilError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(VigilError::Validation("entity id must not be empty".into()));
        }
        if raw.len() > MAX_ENTITY_ID_LEN {
            return Err(VigilError::Validation(format!(
                "entity id '{raw}' exceeds {MAX_ENTITY_ID_LEN} characters"
            )));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-')))
        {
            return Err(VigilError::Validation(format!(
                "entity id '{raw}' contains invalid character '{bad}'"
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EntityId {
    type Error = VigilError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Whether the scheduler should consider an entity at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    #[default]
    Active,
    /// Still tracked, but excluded from scheduling (e.g. delisted, halted).
    Suspended,
}

/// Per-entity record owned by the StateStore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: EntityId,
    pub last_analysis_ts: Option<DateTime<Utc>>,
    pub last_event_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: EntityStatus,
}

impl EntityState {
    pub fn new(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            last_analysis_ts: None,
            last_event_ts: None,
            status: EntityStatus::Active,
        }
    }

    /// Never analyzed, or analyzed strictly longer than `threshold` ago.
    pub fn is_stale(&self, threshold: chrono::Duration, now: DateTime<Utc>) -> bool {
        match self.last_analysis_ts {
            None => true,
            Some(ts) => now - ts > threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[rstest]
    #[case::ticker("AAPL")]
    #[case::exchange_prefixed("NYSE:BRK.B")]
    #[case::underscore("fx_EUR-USD")]
    fn accepts_valid_ids(#[case] raw: &str) {
        assert_eq!(EntityId::parse(raw).unwrap().as_str(), raw);
    }

    #[rstest]
    #[case::empty("")]
    #[case::space("BRK B")]
    #[case::slash("a/b")]
    fn rejects_invalid_ids(#[case] raw: &str) {
        assert!(matches!(EntityId::parse(raw), Err(VigilError::Validation(_))));
    }

    #[test]
    fn rejects_overlong_ids() {
        let raw = "X".repeat(MAX_ENTITY_ID_LEN + 1);
        assert!(EntityId::parse(raw).is_err());
    }

    #[test]
    fn deserialization_validates() {
        let ok: EntityId = serde_json::from_str("\"MSFT\"").unwrap();
        assert_eq!(ok.as_str(), "MSFT");
        assert!(serde_json::from_str::<EntityId>("\"bad id\"").is_err());
    }

    #[test]
    fn staleness_is_strictly_greater_than_threshold() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let threshold = chrono::Duration::hours(24);
        let mut state = EntityState::new(EntityId::parse("X").unwrap());

        assert!(state.is_stale(threshold, t0));

        state.last_analysis_ts = Some(t0);
        assert!(!state.is_stale(threshold, t0 + chrono::Duration::hours(10)));
        assert!(!state.is_stale(threshold, t0 + threshold));
        assert!(state.is_stale(threshold, t0 + chrono::Duration::hours(25)));
    }
}
