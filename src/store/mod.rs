//! Versioned access to session records.
//!
//! A store hands out each record together with a monotonically increasing
//! [`Version`]. Writes are conditional on that version: a write against a
//! stale version fails with [`Error::Conflict`] and never overwrites what
//! another writer stored in between.

use std::fmt;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast::Receiver;
use crate::data::{Invalid, Session};

pub use args::Args;
pub use backend::Backend;
pub use kube::KubeClient;
pub use memory::MemoryStore;

mod args;
mod backend;
mod kube;
mod memory;

#[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Version(pub u64);

#[derive(Clone, Debug)]
pub struct Versioned {
    pub version: Version,
    pub session: Session,
}

#[derive(Clone, Debug)]
pub enum Event {
    Applied(Versioned),
    Deleted(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("version conflict on {name}: expected {expected}")]
    Conflict { name: String, expected: Version },
    #[error("session {0} not found")]
    NotFound(String),
    #[error("gave up after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error("invalid write: {0}")]
    Invalid(#[from] Invalid),
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn list(&self) -> Result<Vec<Versioned>>;

    async fn get(&self, name: &str) -> Result<Versioned>;

    /// Replaces the status of `session` if the stored record is still at
    /// `expected`, returning the new version.
    async fn update(&self, expected: Version, session: &Session) -> Result<Version>;

    /// Change notifications, if the backend has them. Backends without a
    /// push channel return `None` and are polled through `list`.
    fn subscribe(&self) -> Option<Receiver<Event>>;
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Backend(_))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
