//! Controller lease - advisory single-writer enforcement
//!
//! A client claims the lease by writing `{clientId, heartbeatEpochMs}` to the
//! session's lease key and renews it every `renew_period`. A heartbeat older
//! than `timeout` means the lease is vacant and anyone may claim it.
//!
//! This is a liveness heuristic, not consensus: after a lost heartbeat two
//! clients can briefly both believe they hold the lease.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use matchclock_core::{ClientId, EpochMillis};

/// Lease document stored at the lease key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub client_id: ClientId,
    pub heartbeat_epoch_ms: EpochMillis,
}

impl LeaseRecord {
    /// Newer heartbeat wins; simultaneous claims go to the lower client id
    pub fn outranks(&self, other: &LeaseRecord) -> bool {
        match self.heartbeat_epoch_ms.cmp(&other.heartbeat_epoch_ms) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.client_id < other.client_id,
        }
    }
}

/// Lease timing
#[derive(Clone, Debug)]
pub struct LeaseConfig {
    /// Heartbeat period
    pub renew_period: Duration,
    /// Heartbeat age after which the lease counts as vacant
    pub timeout: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        LeaseConfig {
            renew_period: Duration::from_secs(3),
            timeout: Duration::from_secs(9),
        }
    }
}

impl LeaseConfig {
    fn timeout_ms(&self) -> i64 {
        self.timeout.as_millis() as i64
    }
}

/// Result of observing a lease record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseChange {
    /// This client now holds the lease
    Acquired,
    /// Another client took over
    Lost,
    /// Holder changed between other clients, or a heartbeat was renewed
    Updated,
    /// Stale or irrelevant record
    Unchanged,
}

/// One client's view of the lease
#[derive(Debug)]
pub struct ControllerLease {
    client_id: ClientId,
    config: LeaseConfig,
    holder: Option<LeaseRecord>,
}

/// Lease shared between the engine and the heartbeat task
pub type SharedLease = Arc<Mutex<ControllerLease>>;

impl ControllerLease {
    pub fn new(client_id: ClientId, config: LeaseConfig) -> Self {
        ControllerLease {
            client_id,
            config,
            holder: None,
        }
    }

    pub fn shared(self) -> SharedLease {
        Arc::new(Mutex::new(self))
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Last known holder, expired or not
    pub fn holder(&self) -> Option<&LeaseRecord> {
        self.holder.as_ref()
    }

    fn is_expired(&self, record: &LeaseRecord, now: EpochMillis) -> bool {
        now.saturating_sub(record.heartbeat_epoch_ms) > self.config.timeout_ms()
    }

    /// True if nobody holds a live lease
    pub fn is_vacant(&self, now: EpochMillis) -> bool {
        match &self.holder {
            Some(record) => self.is_expired(record, now),
            None => true,
        }
    }

    /// True if this client holds a live lease
    pub fn is_controller(&self, now: EpochMillis) -> bool {
        match &self.holder {
            Some(record) => record.client_id == self.client_id && !self.is_expired(record, now),
            None => false,
        }
    }

    /// Claim or renew the lease.
    ///
    /// Returns the record to publish if this client holds the lease or it is
    /// vacant; `None` while another client's heartbeat is fresh.
    pub fn heartbeat(&mut self, now: EpochMillis) -> Option<LeaseRecord> {
        if !self.is_controller(now) && !self.is_vacant(now) {
            return None;
        }
        let record = LeaseRecord {
            client_id: self.client_id.clone(),
            heartbeat_epoch_ms: now,
        };
        self.holder = Some(record.clone());
        Some(record)
    }

    /// Apply a record delivered by the store
    pub fn observe(&mut self, record: Option<LeaseRecord>) -> LeaseChange {
        let Some(record) = record else {
            // Key absent. Keep our own optimistic claim; forget anyone else.
            return match &self.holder {
                Some(held) if held.client_id != self.client_id => {
                    self.holder = None;
                    LeaseChange::Updated
                }
                _ => LeaseChange::Unchanged,
            };
        };

        let was_ours = self
            .holder
            .as_ref()
            .is_some_and(|held| held.client_id == self.client_id);
        if let Some(held) = &self.holder {
            if *held == record || !record.outranks(held) {
                return LeaseChange::Unchanged;
            }
        }

        let is_ours = record.client_id == self.client_id;
        self.holder = Some(record);
        match (was_ours, is_ours) {
            (false, true) => LeaseChange::Acquired,
            (true, false) => LeaseChange::Lost,
            _ => LeaseChange::Updated,
        }
    }

    /// Give up the lease locally. Other clients see it vacate on timeout.
    pub fn release(&mut self) -> bool {
        let ours = self
            .holder
            .as_ref()
            .is_some_and(|held| held.client_id == self.client_id);
        if ours {
            self.holder = None;
        }
        ours
    }
}
