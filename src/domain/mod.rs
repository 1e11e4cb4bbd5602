use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub type VoterId = u64;
pub type PollId = u64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PollEntry {
    pub poll_id: PollId,
    #[serde(with = "rfc3339")]
    pub vote_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Voter {
    pub id: VoterId,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub poll_history: Vec<PollEntry>,
}

impl Voter {
    pub fn new(id: VoterId, first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            id,
            first_name: first_name.into(),
            last_name: last_name.into(),
            poll_history: Vec::new(),
        }
    }

    /// A voter known only by id, as created when a poll is recorded for an unknown voter.
    pub fn bare(id: VoterId) -> Self {
        Self::new(id, "", "")
    }

    pub fn poll(&self, poll_id: PollId) -> Option<&PollEntry> {
        self.poll_history.iter().find(|p| p.poll_id == poll_id)
    }

    /// First poll id that appears more than once in the history, if any.
    pub fn duplicate_poll(&self) -> Option<PollId> {
        let mut seen = std::collections::HashSet::with_capacity(self.poll_history.len());
        self.poll_history
            .iter()
            .map(|p| p.poll_id)
            .find(|id| !seen.insert(*id))
    }

    /// Appends an entry for `poll_id` unless one is already present.
    ///
    /// Returns the entry that ends up in the history and whether it was newly inserted.
    pub(crate) fn add_poll(&mut self, poll_id: PollId, at: DateTime<Utc>) -> (PollEntry, bool) {
        if let Some(existing) = self.poll(poll_id) {
            return (existing.clone(), false);
        }
        let entry = PollEntry {
            poll_id,
            vote_timestamp: at,
        };
        self.poll_history.push(entry.clone());
        (entry, true)
    }

    /// Removes the entry for `poll_id`, keeping the order of the remaining entries.
    pub(crate) fn remove_poll(&mut self, poll_id: PollId) -> Option<PollEntry> {
        let idx = self.poll_history.iter().position(|p| p.poll_id == poll_id)?;
        Some(self.poll_history.remove(idx))
    }
}

mod rfc3339 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&at.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
