//! Shared holder of the current credential.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use svidkit_core::Credential;

/// A credential together with the generation it was installed at.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Starts at 1 and increases by one on every [`CredentialStore::set`].
    pub generation: u64,
    pub credential: Arc<Credential>,
}

/// Holds exactly one current credential.
///
/// Readers get an immutable `Arc` snapshot; a writer replaces the whole value.
/// A reader never observes a half-updated credential.
#[derive(Debug)]
pub struct CredentialStore {
    current: RwLock<Snapshot>,
    generation_tx: watch::Sender<u64>,
}

impl CredentialStore {
    /// Create a store holding `initial` at generation 1.
    pub fn new(initial: Credential) -> Self {
        let (generation_tx, _) = watch::channel(1);
        Self {
            current: RwLock::new(Snapshot {
                generation: 1,
                credential: Arc::new(initial),
            }),
            generation_tx,
        }
    }

    /// Current credential.
    pub fn get(&self) -> Arc<Credential> {
        self.snapshot().credential
    }

    /// Current credential and its generation, read together.
    pub fn snapshot(&self) -> Snapshot {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn generation(&self) -> u64 {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }

    /// Replace the current credential. Returns the new generation.
    pub fn set(&self, credential: Credential) -> u64 {
        let generation = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            current.generation += 1;
            current.credential = Arc::new(credential);
            current.generation
        };
        self.generation_tx.send_replace(generation);
        generation
    }

    /// Receive the generation number every time the credential is replaced.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation_tx.subscribe()
    }

    /// Time until the current credential expires, zero once expired.
    pub fn time_to_expiry(&self, now: DateTime<Utc>) -> Duration {
        self.get().time_to_expiry(now)
    }
}
