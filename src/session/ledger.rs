//! Correlation ledger
//!
//! Pairs outbound requests with the `result` envelopes the broker publishes
//! later on the same connectionless channel. Each logical key gets a lane:
//! a second request for a key waits in FIFO order until the first one has
//! settled, so at most one request per key is ever in flight.
//!
//! Settlement is first-wins. A result that arrives after its request timed
//! out finds no entry and is logged as unmatched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex as LaneLock, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SessionError;

type Outcome = Result<String, SessionError>;

#[derive(Debug)]
struct Outstanding {
    tx: oneshot::Sender<Outcome>,
    issued_at: Instant,
}

#[derive(Debug, Default)]
pub struct CorrelationLedger {
    pending: Mutex<HashMap<String, Outstanding>>,
    lanes: Mutex<HashMap<String, Arc<LaneLock<()>>>>,
}

impl CorrelationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs one correlated exchange for `key`
    ///
    /// `usable` is consulted before queueing on the lane and again once the
    /// lane is ours; `publish` hands the request to the transport. Resolves
    /// with the broker's reason text.
    pub async fn send_correlated<U, P>(
        &self,
        key: &str,
        timeout: Duration,
        usable: U,
        publish: P,
    ) -> Result<String, SessionError>
    where
        U: Fn() -> Result<(), SessionError>,
        P: FnOnce() -> Result<(), SessionError>,
    {
        usable()?;

        let mut slot = Slot {
            ledger: self,
            key,
            lane: self.lane(key),
            turn: None,
        };
        slot.turn = Some(slot.lane.clone().lock_owned().await);
        self.exchange(key, timeout, &usable, publish).await
    }

    async fn exchange<U, P>(
        &self,
        key: &str,
        timeout: Duration,
        usable: &U,
        publish: P,
    ) -> Result<String, SessionError>
    where
        U: Fn() -> Result<(), SessionError>,
        P: FnOnce() -> Result<(), SessionError>,
    {
        usable()?;

        let (tx, mut rx) = oneshot::channel();
        let issued_at = Instant::now();
        self.pending_map()
            .insert(key.to_string(), Outstanding { tx, issued_at });

        if let Err(e) = publish() {
            self.pending_map().remove(key);
            return Err(e);
        }
        debug!("Request {} published, waiting up to {:?}", key, timeout);

        tokio::select! {
            outcome = &mut rx => outcome.unwrap_or_else(|_| {
                Err(SessionError::Transport(format!("request {} abandoned", key)))
            }),
            _ = tokio::time::sleep(timeout) => {
                if self.pending_map().remove(key).is_some() {
                    warn!("Request {} timed out after {:?}", key, timeout);
                    return Err(SessionError::Timeout {
                        key: key.to_string(),
                        timeout,
                    });
                }
                // settled between the deadline and our removal
                rx.try_recv().unwrap_or_else(|_| {
                    Err(SessionError::Timeout {
                        key: key.to_string(),
                        timeout,
                    })
                })
            }
        }
    }

    /// Resolves or rejects the outstanding request for `key`
    ///
    /// Returns false when nothing was waiting for it.
    pub fn settle(&self, key: &str, success: bool, reason: String) -> bool {
        let Some(outstanding) = self.pending_map().remove(key) else {
            info!("Unmatched result for {}: success={} reason={}", key, success, reason);
            return false;
        };
        debug!(
            "Result for {} after {:?}: success={}",
            key,
            outstanding.issued_at.elapsed(),
            success
        );
        let outcome = if success {
            Ok(reason)
        } else {
            Err(SessionError::Rejected {
                key: key.to_string(),
                reason,
            })
        };
        if outstanding.tx.send(outcome).is_err() {
            debug!("Requester for {} went away before settlement", key);
        }
        true
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending_map().contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending_map().len()
    }

    fn lane(&self, key: &str) -> Arc<LaneLock<()>> {
        self.lanes_map()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(LaneLock::new(())))
            .clone()
    }

    fn pending_map(&self) -> MutexGuard<'_, HashMap<String, Outstanding>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lanes_map(&self) -> MutexGuard<'_, HashMap<String, Arc<LaneLock<()>>>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One request's claim on its key's lane
///
/// Released on drop, so a caller that stops polling mid-exchange leaves
/// neither a pending entry nor a lane behind.
struct Slot<'a> {
    ledger: &'a CorrelationLedger,
    key: &'a str,
    lane: Arc<LaneLock<()>>,
    turn: Option<OwnedMutexGuard<()>>,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        // only the lane holder can own the pending entry
        if self.turn.is_some() && self.ledger.pending_map().remove(self.key).is_some() {
            debug!("Request {} abandoned before settlement", self.key);
        }
        drop(self.turn.take());
        let mut lanes = self.ledger.lanes_map();
        // map + our clone; anything more means another request is queued
        if Arc::strong_count(&self.lane) == 2 && self.lane.try_lock().is_ok() {
            lanes.remove(self.key);
        }
    }
}
