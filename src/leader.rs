// =============================================================================
// Leader Election — TTL lease in the distributed cache
// =============================================================================
//
// Exactly one engine instance may own the exchange websocket. Ownership is a
// lease under `price_stream:leader`: whoever finds the key absent or stale
// beyond the TTL writes its own lease and becomes leader. Leaders heartbeat
// at 30 % of the TTL; a failed heartbeat demotes to follower so another
// instance can take over within one TTL window.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, LEADER_KEY};

/// Lease payload stored in the shared cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderLease {
    pub instance_id: String,
    pub hostname: String,
    /// Unix milliseconds at which the lease was written/refreshed.
    pub timestamp: i64,
}

pub struct LeaderElection {
    cache: Arc<dyn CacheStore>,
    instance_id: String,
    hostname: String,
    ttl: Duration,
    is_leader: AtomicBool,
}

impl LeaderElection {
    pub fn new(cache: Arc<dyn CacheStore>, instance_id: String, ttl: Duration) -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
        Self {
            cache,
            instance_id,
            hostname,
            ttl,
            is_leader: AtomicBool::new(false),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Heartbeat cadence: 30 % of the lease TTL.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis((self.ttl.as_millis() as f64 * 0.3) as u64)
    }

    /// Attempt to become (or remain) leader.
    ///
    /// The happy path is a single atomic set-if-absent: whoever creates the
    /// key owns the lease. When the key exists, ownership is decided by the
    /// payload: our own lease is refreshed in place, a stale lease (timestamp
    /// older than the TTL — possible when the backing cache does not expire
    /// keys itself) is deleted and re-contested atomically.
    pub async fn try_acquire(&self) -> Result<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let lease = LeaderLease {
            instance_id: self.instance_id.clone(),
            hostname: self.hostname.clone(),
            timestamp: now_ms,
        };
        let payload = serde_json::to_string(&lease)?;

        if self
            .cache
            .set_if_absent(LEADER_KEY, &payload, self.ttl)
            .await?
        {
            return Ok(self.mark_leader(true));
        }

        let current: Option<LeaderLease> = match self.cache.get(LEADER_KEY).await? {
            Some(raw) => serde_json::from_str(&raw).ok(),
            None => None,
        };

        match current {
            // Key vanished between the two calls — contest again next round.
            None => Ok(self.mark_leader(false)),
            Some(ref held) if held.instance_id == self.instance_id => {
                // Our lease: refresh the timestamp.
                self.cache.set(LEADER_KEY, &payload, self.ttl).await?;
                Ok(self.mark_leader(true))
            }
            Some(ref held) if now_ms - held.timestamp > self.ttl.as_millis() as i64 => {
                // Stale lease from a dead instance: clear it and re-contest.
                self.cache.delete(LEADER_KEY).await?;
                let won = self
                    .cache
                    .set_if_absent(LEADER_KEY, &payload, self.ttl)
                    .await?;
                Ok(self.mark_leader(won))
            }
            Some(held) => {
                if self.is_leader() {
                    warn!(
                        instance = %self.instance_id,
                        holder = %held.instance_id,
                        "lost leadership to another instance"
                    );
                }
                Ok(self.mark_leader(false))
            }
        }
    }

    fn mark_leader(&self, leader: bool) -> bool {
        let was = self.is_leader.swap(leader, Ordering::SeqCst);
        if leader && !was {
            info!(instance = %self.instance_id, "acquired price-stream leadership");
        } else if leader {
            debug!(instance = %self.instance_id, "leader heartbeat refreshed");
        }
        leader
    }

    /// Refresh the lease. A failed refresh demotes to follower.
    pub async fn heartbeat(&self) -> bool {
        match self.try_acquire().await {
            Ok(leader) => leader,
            Err(e) => {
                warn!(error = %e, "leader heartbeat failed — demoting to follower");
                self.is_leader.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Release the lease on shutdown so a follower can take over immediately.
    pub async fn release(&self) {
        if !self.is_leader.swap(false, Ordering::SeqCst) {
            return;
        }
        // Only delete our own lease.
        if let Ok(Some(raw)) = self.cache.get(LEADER_KEY).await {
            if let Ok(lease) = serde_json::from_str::<LeaderLease>(&raw) {
                if lease.instance_id == self.instance_id {
                    if let Err(e) = self.cache.delete(LEADER_KEY).await {
                        warn!(error = %e, "failed to release leader lease");
                    } else {
                        info!(instance = %self.instance_id, "released price-stream leadership");
                    }
                }
            }
        }
    }
}
