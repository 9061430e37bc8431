//! Per-conversation leases.
//!
//! At most one turn runs per conversation key. A lease carries a TTL so a
//! holder that dies without releasing only blocks the key until the lease
//! expires; after that the next caller takes it over. A running turn renews
//! its lease before every step and while a handler is in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use parley_types::{ConversationKey, FlowError, Result};

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: Uuid,
    expires_at: Instant,
}

struct Inner {
    leases: Mutex<HashMap<ConversationKey, Lease>>,
    released: Notify,
    ttl: Duration,
}

/// In-process lease table shared by every turn of one engine.
#[derive(Clone)]
pub struct LeaseTable {
    inner: Arc<Inner>,
}

impl LeaseTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                leases: Mutex::new(HashMap::new()),
                released: Notify::new(),
                ttl,
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Take the lease if it is free or expired.
    pub fn try_acquire(&self, key: &ConversationKey) -> Option<LeaseGuard> {
        self.grant(key).ok()
    }

    /// Take the lease, queueing up to `wait` behind the current holder.
    pub async fn acquire(&self, key: &ConversationKey, wait: Duration) -> Result<LeaseGuard> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed.
            notified.as_mut().enable();

            let expires_at = match self.grant(key) {
                Ok(guard) => return Ok(guard),
                Err(expires_at) => expires_at,
            };
            if Instant::now() >= deadline {
                tracing::debug!(conversation = %key, "Lease still held after waiting");
                return Err(FlowError::LockBusy {
                    key: key.to_string(),
                });
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(expires_at.min(deadline)) => {}
            }
        }
    }

    pub fn is_held(&self, key: &ConversationKey) -> bool {
        self.inner
            .leases
            .lock()
            .get(key)
            .is_some_and(|lease| lease.expires_at > Instant::now())
    }

    /// Grant a fresh lease, or report when the current one expires.
    fn grant(&self, key: &ConversationKey) -> std::result::Result<LeaseGuard, Instant> {
        let now = Instant::now();
        let mut leases = self.inner.leases.lock();
        if let Some(current) = leases.get(key) {
            if current.expires_at > now {
                return Err(current.expires_at);
            }
            tracing::warn!(conversation = %key, "Taking over expired lease");
        }
        let token = Uuid::new_v4();
        leases.insert(
            key.clone(),
            Lease {
                token,
                expires_at: now + self.inner.ttl,
            },
        );
        Ok(LeaseGuard {
            inner: self.inner.clone(),
            key: key.clone(),
            token,
        })
    }
}

/// Releases the lease on drop, unless it was taken over after expiring.
pub struct LeaseGuard {
    inner: Arc<Inner>,
    key: ConversationKey,
    token: Uuid,
}

impl LeaseGuard {
    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// Push the expiry out by one TTL. Returns false if the lease was lost.
    pub fn renew(&self) -> bool {
        let mut leases = self.inner.leases.lock();
        match leases.get_mut(&self.key) {
            Some(lease) if lease.token == self.token => {
                lease.expires_at = Instant::now() + self.inner.ttl;
                true
            }
            _ => false,
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        {
            let mut leases = self.inner.leases.lock();
            if leases.get(&self.key).is_some_and(|l| l.token == self.token) {
                leases.remove(&self.key);
            }
        }
        self.inner.released.notify_waiters();
    }
}
