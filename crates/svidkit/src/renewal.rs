//! Background credential renewal.
//!
//! The scheduler wakes every check interval and, once the current credential
//! is within the renewal threshold of expiry, fetches a replacement. Failed
//! attempts are logged and retried on a backoff schedule; the old credential
//! stays in place until a replacement arrives.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use svidkit_client::IssuanceApi;
use svidkit_core::{BackoffPolicy, SpiffeId, WorkloadHandle};

use crate::backoff::Backoff;
use crate::clock::Clock;
use crate::crypto;
use crate::error::RenewalError;
use crate::store::{CredentialStore, Snapshot};

/// Where the scheduler is within one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalState {
    Idle,
    Checking,
    Renewing,
}

/// Result of a single check.
#[derive(Debug)]
pub enum TickOutcome {
    /// The credential is outside the renewal threshold.
    Fresh,
    /// A new credential was installed.
    Renewed { generation: u64 },
    /// The refresh attempt failed. The old credential is still current.
    Failed(RenewalError),
    /// Renewal is due but the last failure's backoff has not elapsed.
    Deferred { retry_in: Duration },
}

/// Fetches and installs a new credential, one caller at a time.
///
/// Every refresh resolves the workload handle again before fetching, so a
/// workload re-registered on the issuance side keeps renewing.
///
/// Callers pass the generation they observed. If another caller already
/// replaced that generation while they waited, they get the newer credential
/// without a second fetch.
pub struct Refresher {
    issuance: Arc<dyn IssuanceApi>,
    identity: SpiffeId,
    handle: RwLock<WorkloadHandle>,
    store: Arc<CredentialStore>,
    in_flight: tokio::sync::Mutex<()>,
}

impl Refresher {
    /// `handle` is the one resolved at startup.
    pub fn new(
        issuance: Arc<dyn IssuanceApi>,
        identity: SpiffeId,
        handle: WorkloadHandle,
        store: Arc<CredentialStore>,
    ) -> Self {
        Self {
            issuance,
            identity,
            handle: RwLock::new(handle),
            store,
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Refresh unless `observed` is no longer the current generation.
    pub async fn refresh_if_current(&self, observed: u64) -> Result<Snapshot, RenewalError> {
        let _guard = self.in_flight.lock().await;

        let current = self.store.snapshot();
        if current.generation != observed {
            debug!(
                observed = observed,
                current = current.generation,
                "Credential already refreshed"
            );
            return Ok(current);
        }

        let handle = self
            .issuance
            .lookup_workload_handle(&self.identity)
            .await
            .map_err(RenewalError::Lookup)?;
        self.update_handle(&handle);

        let credential = self.issuance.fetch_credential(&handle).await?;
        self.store.set(credential);
        Ok(self.store.snapshot())
    }

    fn update_handle(&self, handle: &WorkloadHandle) {
        let mut current = self.handle.write().unwrap_or_else(PoisonError::into_inner);
        if *current != *handle {
            info!(
                identity = %self.identity,
                previous = %current,
                handle = %handle,
                "Workload handle changed"
            );
            *current = handle.clone();
        }
    }

    /// Refresh from whatever generation is current now.
    pub async fn refresh(&self) -> Result<Snapshot, RenewalError> {
        let observed = self.store.generation();
        self.refresh_if_current(observed).await
    }

    /// Handle used by the most recent refresh.
    pub fn handle(&self) -> WorkloadHandle {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct RetryWindow {
    backoff: Backoff,
    not_before: Option<DateTime<Utc>>,
}

/// Periodically checks the credential and renews it before expiry.
pub struct RenewalScheduler {
    store: Arc<CredentialStore>,
    refresher: Arc<Refresher>,
    clock: Arc<dyn Clock>,
    threshold: Duration,
    check_interval: Duration,
    state: Mutex<RenewalState>,
    retry: Mutex<RetryWindow>,
}

impl RenewalScheduler {
    pub fn new(
        store: Arc<CredentialStore>,
        refresher: Arc<Refresher>,
        clock: Arc<dyn Clock>,
        threshold: Duration,
        check_interval: Duration,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            refresher,
            clock,
            threshold,
            check_interval,
            state: Mutex::new(RenewalState::Idle),
            retry: Mutex::new(RetryWindow {
                backoff: Backoff::new(backoff, check_interval),
                not_before: None,
            }),
        }
    }

    pub fn state(&self) -> RenewalState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: RenewalState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Run one check.
    pub async fn tick(&self) -> TickOutcome {
        self.set_state(RenewalState::Checking);

        let now = self.clock.now();
        let snapshot = self.store.snapshot();
        let time_to_expiry = snapshot.credential.time_to_expiry(now);

        if time_to_expiry > self.threshold {
            debug!(
                time_to_expiry_secs = time_to_expiry.as_secs(),
                "Credential is fresh"
            );
            self.set_state(RenewalState::Idle);
            return TickOutcome::Fresh;
        }

        if let Some(retry_in) = self.retry_pending(now) {
            debug!(retry_in_secs = retry_in.as_secs(), "Renewal deferred by backoff");
            self.set_state(RenewalState::Idle);
            return TickOutcome::Deferred { retry_in };
        }

        self.set_state(RenewalState::Renewing);
        info!(
            generation = snapshot.generation,
            time_to_expiry_secs = time_to_expiry.as_secs(),
            "Renewing credential"
        );

        let outcome = match self.refresher.refresh_if_current(snapshot.generation).await {
            Ok(renewed) => {
                self.clear_retry();
                info!(
                    generation = renewed.generation,
                    expires_at = %renewed.credential.expires_at(),
                    fingerprint = %crypto::leaf_fingerprint(&renewed.credential)
                        .unwrap_or_else(|| "unknown".to_string()),
                    "Credential renewed"
                );
                TickOutcome::Renewed {
                    generation: renewed.generation,
                }
            }
            Err(e) => {
                let delay = self.schedule_retry(now);
                warn!(
                    error = %e,
                    retry_in_secs = delay.as_secs(),
                    expires_at = %snapshot.credential.expires_at(),
                    "Credential renewal failed"
                );
                TickOutcome::Failed(e)
            }
        };

        self.set_state(RenewalState::Idle);
        outcome
    }

    fn retry_pending(&self, now: DateTime<Utc>) -> Option<Duration> {
        let retry = self.retry.lock().unwrap_or_else(PoisonError::into_inner);
        let not_before = retry.not_before?;
        (now < not_before).then(|| (not_before - now).to_std().unwrap_or_default())
    }

    fn schedule_retry(&self, now: DateTime<Utc>) -> Duration {
        let mut retry = self.retry.lock().unwrap_or_else(PoisonError::into_inner);
        let delay = retry.backoff.next_delay();
        let delta = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
        retry.not_before = now.checked_add_signed(delta);
        delay
    }

    fn clear_retry(&self) {
        let mut retry = self.retry.lock().unwrap_or_else(PoisonError::into_inner);
        retry.backoff.reset();
        retry.not_before = None;
    }

    /// Check every interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut timer = tokio::time::interval(self.check_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            check_interval_secs = self.check_interval.as_secs(),
            threshold_secs = self.threshold.as_secs(),
            "Renewal scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.tick() => {}
                    }
                }
            }
        }

        self.set_state(RenewalState::Idle);
        info!("Renewal scheduler stopped");
    }

    /// Run in a background task.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}
