use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::{
    config::{Backend, Config},
    domain::{PollEntry, PollId, Voter, VoterId},
    medium::{Medium, MediumError, MemoryMedium, RedisMedium},
};

pub const KEY_PREFIX: &str = "voter:";

const LOCK_STRIPES: usize = 64;

pub fn voter_key(id: VoterId) -> String {
    format!("{KEY_PREFIX}{id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    NotFound,
    AlreadyExists,
    PartialFailure,
    MediumUnavailable,
    InvalidVoter,
}

#[derive(Debug)]
pub enum StoreError {
    VoterNotFound { id: VoterId },
    PollNotFound { voter_id: VoterId, poll_id: PollId },
    AlreadyExists { id: VoterId },
    PartialFailure { expected: u64, deleted: u64 },
    DuplicatePoll { voter_id: VoterId, poll_id: PollId },
    Medium(MediumError),
    Decode { key: String, source: serde_json::Error },
    Encode { key: String, source: serde_json::Error },
}

impl StoreError {
    pub fn kind(&self) -> StoreErrorKind {
        match self {
            Self::VoterNotFound { .. } | Self::PollNotFound { .. } => StoreErrorKind::NotFound,
            Self::AlreadyExists { .. } => StoreErrorKind::AlreadyExists,
            Self::PartialFailure { .. } => StoreErrorKind::PartialFailure,
            Self::DuplicatePoll { .. } => StoreErrorKind::InvalidVoter,
            Self::Medium(_) | Self::Decode { .. } | Self::Encode { .. } => {
                StoreErrorKind::MediumUnavailable
            }
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VoterNotFound { id } => write!(f, "voter not found: {id}"),
            Self::PollNotFound { voter_id, poll_id } => {
                write!(f, "poll not found: voter_id={voter_id} poll_id={poll_id}")
            }
            Self::AlreadyExists { id } => write!(f, "voter already exists: {id}"),
            Self::PartialFailure { expected, deleted } => write!(
                f,
                "one or more voters could not be deleted: expected {expected}, deleted {deleted}"
            ),
            Self::DuplicatePoll { voter_id, poll_id } => write!(
                f,
                "poll history lists poll more than once: voter_id={voter_id} poll_id={poll_id}"
            ),
            Self::Medium(e) => write!(f, "{e}"),
            Self::Decode { key, source } => write!(f, "malformed document at {key}: {source}"),
            Self::Encode { key, source } => write!(f, "cannot encode document for {key}: {source}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Medium(e) => Some(e),
            Self::Decode { source, .. } | Self::Encode { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<MediumError> for StoreError {
    fn from(value: MediumError) -> Self {
        Self::Medium(value)
    }
}

/// Striped per-voter mutexes serializing read-modify-write sequences.
struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    async fn lock(&self, id: VoterId) -> MutexGuard<'_, ()> {
        let idx = (id % self.stripes.len() as u64) as usize;
        self.stripes[idx].lock().await
    }
}

/// Voter records kept as one JSON document per voter in a [`Medium`].
///
/// Cloning is cheap and clones share the medium and the per-voter locks. Mutations of one
/// voter are serialized within this process; writers in other processes sharing the same
/// document cache can still interleave with the load-modify-store sequences.
#[derive(Clone)]
pub struct VoterStore {
    medium: Arc<dyn Medium>,
    locks: Arc<KeyLocks>,
}

impl VoterStore {
    pub fn new(medium: Arc<dyn Medium>) -> Self {
        Self {
            medium,
            locks: Arc::new(KeyLocks::new(LOCK_STRIPES)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryMedium::new()))
    }

    /// Builds the store for the configured backend and checks the medium is reachable.
    pub async fn connect(config: &Config) -> Result<Self, StoreError> {
        let medium: Arc<dyn Medium> = match config.backend {
            Backend::Memory => Arc::new(MemoryMedium::new()),
            Backend::Redis => Arc::new(RedisMedium::connect(config.redis_options()?).await?),
        };
        medium.ping().await?;
        info!(medium = medium.name(), "voter store ready");
        Ok(Self::new(medium))
    }

    pub fn medium_name(&self) -> &'static str {
        self.medium.name()
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        Ok(self.medium.ping().await?)
    }

    pub async fn add_voter(&self, voter: Voter) -> Result<Voter, StoreError> {
        check_history(&voter)?;
        let _guard = self.locks.lock(voter.id).await;
        let key = voter_key(voter.id);
        if self.exists(&key).await? {
            return Err(StoreError::AlreadyExists { id: voter.id });
        }
        self.save(&key, &voter).await?;
        debug!(voter_id = voter.id, "voter added");
        Ok(voter)
    }

    pub async fn get_voter(&self, id: VoterId) -> Result<Voter, StoreError> {
        self.load(id).await
    }

    /// All voters ordered by id; empty when nothing is stored.
    pub async fn list_voters(&self) -> Result<Vec<Voter>, StoreError> {
        let keys = self.medium.list_keys(KEY_PREFIX).await?;
        let mut voters = Vec::with_capacity(keys.len());
        for key in keys {
            let document = match self.medium.get(&key).await {
                Ok(document) => document,
                // Deleted between enumeration and fetch.
                Err(MediumError::NotFound { .. }) => continue,
                Err(e) => return Err(e.into()),
            };
            voters.push(decode(&key, &document)?);
        }
        voters.sort_by_key(|v| v.id);
        Ok(voters)
    }

    /// Replaces the stored voter wholesale; the voter must already exist.
    ///
    /// Like [`Self::add_voter`], rejects a history that lists the same poll twice.
    pub async fn update_voter(&self, voter: Voter) -> Result<Voter, StoreError> {
        check_history(&voter)?;
        let _guard = self.locks.lock(voter.id).await;
        let key = voter_key(voter.id);
        if !self.exists(&key).await? {
            return Err(StoreError::VoterNotFound { id: voter.id });
        }
        self.save(&key, &voter).await?;
        debug!(voter_id = voter.id, "voter updated");
        Ok(voter)
    }

    pub async fn delete_voter(&self, id: VoterId) -> Result<(), StoreError> {
        let _guard = self.locks.lock(id).await;
        match self.medium.delete_one(&voter_key(id)).await {
            Ok(()) => {
                debug!(voter_id = id, "voter deleted");
                Ok(())
            }
            Err(MediumError::NotFound { .. }) => Err(StoreError::VoterNotFound { id }),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes every voter and returns how many were removed.
    pub async fn delete_all_voters(&self) -> Result<u64, StoreError> {
        let keys = self.medium.list_keys(KEY_PREFIX).await?;
        let expected = keys.len() as u64;
        let deleted = self.medium.delete_many(&keys).await?;
        if deleted != expected {
            return Err(StoreError::PartialFailure { expected, deleted });
        }
        info!(deleted, "all voters deleted");
        Ok(deleted)
    }

    pub async fn voter_history(&self, id: VoterId) -> Result<Vec<PollEntry>, StoreError> {
        Ok(self.load(id).await?.poll_history)
    }

    pub async fn get_poll_entry(
        &self,
        id: VoterId,
        poll_id: PollId,
    ) -> Result<PollEntry, StoreError> {
        self.load(id)
            .await?
            .poll(poll_id)
            .cloned()
            .ok_or(StoreError::PollNotFound {
                voter_id: id,
                poll_id,
            })
    }

    /// Records participation in `poll_id`, creating a bare voter when `id` is unknown.
    ///
    /// A poll that is already recorded is left untouched and its existing entry returned.
    pub async fn add_poll_entry(&self, id: VoterId, poll_id: PollId) -> Result<PollEntry, StoreError> {
        let _guard = self.locks.lock(id).await;
        let (mut voter, created) = match self.load(id).await {
            Ok(voter) => (voter, false),
            Err(StoreError::VoterNotFound { .. }) => (Voter::bare(id), true),
            Err(e) => return Err(e),
        };

        let (entry, inserted) = voter.add_poll(poll_id, Utc::now());
        if inserted {
            self.save(&voter_key(id), &voter).await?;
            debug!(voter_id = id, poll_id, created, "poll recorded");
        }
        Ok(entry)
    }

    pub async fn delete_poll_entry(&self, id: VoterId, poll_id: PollId) -> Result<(), StoreError> {
        let _guard = self.locks.lock(id).await;
        let mut voter = self.load(id).await?;
        if voter.remove_poll(poll_id).is_none() {
            return Err(StoreError::PollNotFound {
                voter_id: id,
                poll_id,
            });
        }
        self.save(&voter_key(id), &voter).await?;
        debug!(voter_id = id, poll_id, "poll removed");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self.medium.get(key).await {
            Ok(_) => Ok(true),
            Err(MediumError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn load(&self, id: VoterId) -> Result<Voter, StoreError> {
        let key = voter_key(id);
        match self.medium.get(&key).await {
            Ok(document) => decode(&key, &document),
            Err(MediumError::NotFound { .. }) => Err(StoreError::VoterNotFound { id }),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, voter: &Voter) -> Result<(), StoreError> {
        let document = serde_json::to_string(voter).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;
        Ok(self.medium.put(key, document).await?)
    }
}

fn check_history(voter: &Voter) -> Result<(), StoreError> {
    match voter.duplicate_poll() {
        Some(poll_id) => Err(StoreError::DuplicatePoll {
            voter_id: voter.id,
            poll_id,
        }),
        None => Ok(()),
    }
}

fn decode(key: &str, document: &str) -> Result<Voter, StoreError> {
    serde_json::from_str(document).map_err(|source| StoreError::Decode {
        key: key.to_string(),
        source,
    })
}
