// =============================================================================
// PubSubBus — publish/subscribe fabric over PostgreSQL NOTIFY/LISTEN
// =============================================================================
//
// One dedicated listener connection carries every LISTEN; publishing goes
// through the shared pool via pg_notify. `LISTEN` is issued on the first
// subscription to a channel and `UNLISTEN` when the last handler is removed.
// A dropped listener connection is rebuilt after 5 seconds and every known
// channel re-listened.
//
// Channel names are lowercased and restricted to `[a-z0-9_]`; anything else
// fails loudly. Payloads are JSON and capped at 8 KB to match the database
// NOTIFY limit.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::postgres::{PgListener, PgPool};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Maximum payload accepted for publish (database NOTIFY limit).
pub const MAX_PAYLOAD_BYTES: usize = 8 * 1024;

/// Delay before the listener connection is rebuilt after a failure.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub type Handler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("invalid channel name: {0:?}")]
    InvalidChannel(String),
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_BYTES} byte limit")]
    PayloadTooLarge(usize),
    #[error("pub-sub backend error: {0}")]
    Backend(String),
}

/// Lowercase a channel name and verify it only contains `[a-z0-9_]`.
pub fn sanitize_channel(name: &str) -> Result<String, PubSubError> {
    let lowered = name.to_lowercase();
    if lowered.is_empty()
        || !lowered
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(PubSubError::InvalidChannel(name.to_string()));
    }
    Ok(lowered)
}

/// Publish/subscribe capability contract.
#[async_trait]
pub trait PubSubBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PubSubError>;
    /// Register a handler; returns a token for `unsubscribe`.
    async fn subscribe(&self, channel: &str, handler: Handler) -> Result<u64, PubSubError>;
    async fn unsubscribe(&self, channel: &str, token: u64) -> Result<(), PubSubError>;
}

type HandlerMap = Arc<RwLock<HashMap<String, Vec<(u64, Handler)>>>>;

fn dispatch(handlers: &HandlerMap, channel: &str, payload: &str) {
    let map = handlers.read();
    if let Some(list) = map.get(channel) {
        for (_, handler) in list {
            handler(payload);
        }
    }
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

enum ListenerCmd {
    Listen(String),
    Unlisten(String),
}

/// NOTIFY/LISTEN bus backed by the shared connection pool plus one dedicated
/// listener connection owned by a background task.
pub struct PgBus {
    pool: PgPool,
    handlers: HandlerMap,
    next_token: AtomicU64,
    cmd_tx: mpsc::UnboundedSender<ListenerCmd>,
}

impl PgBus {
    /// Build the bus and spawn the listener task.
    pub async fn start(pool: PgPool) -> Result<Arc<Self>, PubSubError> {
        let handlers: HandlerMap = Arc::new(RwLock::new(HashMap::new()));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let listener = PgListener::connect_with(&pool)
            .await
            .map_err(|e| PubSubError::Backend(e.to_string()))?;

        tokio::spawn(run_listener(
            pool.clone(),
            listener,
            cmd_rx,
            Arc::clone(&handlers),
        ));

        Ok(Arc::new(Self {
            pool,
            handlers,
            next_token: AtomicU64::new(1),
            cmd_tx,
        }))
    }
}

#[async_trait]
impl PubSubBus for PgBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PubSubError> {
        let channel = sanitize_channel(channel)?;
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(PubSubError::PayloadTooLarge(payload.len()));
        }

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| PubSubError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: Handler) -> Result<u64, PubSubError> {
        let channel = sanitize_channel(channel)?;
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);

        let first = {
            let mut map = self.handlers.write();
            let list = map.entry(channel.clone()).or_default();
            list.push((token, handler));
            list.len() == 1
        };

        if first {
            // LISTEN only on the first subscription for a channel.
            self.cmd_tx
                .send(ListenerCmd::Listen(channel.clone()))
                .map_err(|_| PubSubError::Backend("listener task gone".into()))?;
            debug!(channel = %channel, "LISTEN requested");
        }
        Ok(token)
    }

    async fn unsubscribe(&self, channel: &str, token: u64) -> Result<(), PubSubError> {
        let channel = sanitize_channel(channel)?;

        let empty = {
            let mut map = self.handlers.write();
            if let Some(list) = map.get_mut(&channel) {
                list.retain(|(t, _)| *t != token);
                if list.is_empty() {
                    map.remove(&channel);
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };

        if empty {
            self.cmd_tx
                .send(ListenerCmd::Unlisten(channel.clone()))
                .map_err(|_| PubSubError::Backend("listener task gone".into()))?;
            debug!(channel = %channel, "UNLISTEN requested");
        }
        Ok(())
    }
}

/// What the listener task decided to do after one select round. The enum
/// exists so the `select!` arms never touch the listener themselves — its
/// mutable borrow is released before the action runs.
enum ListenerAction {
    Apply(ListenerCmd),
    Dispatch(String, String),
    Reconnect,
    Exit,
}

/// Listener task: multiplexes LISTEN/UNLISTEN commands with incoming
/// notifications and rebuilds the connection on failure.
async fn run_listener(
    pool: PgPool,
    mut listener: PgListener,
    mut cmd_rx: mpsc::UnboundedReceiver<ListenerCmd>,
    handlers: HandlerMap,
) {
    let mut channels: HashSet<String> = HashSet::new();

    loop {
        let action = tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => ListenerAction::Apply(cmd),
                None => ListenerAction::Exit,
            },
            notification = listener.recv() => match notification {
                Ok(n) => ListenerAction::Dispatch(n.channel().to_string(), n.payload().to_string()),
                Err(e) => {
                    warn!(error = %e, "listener connection lost — reconnecting in 5s");
                    ListenerAction::Reconnect
                }
            },
        };

        match action {
            ListenerAction::Apply(ListenerCmd::Listen(ch)) => {
                channels.insert(ch.clone());
                if let Err(e) = listener.listen(&ch).await {
                    error!(channel = %ch, error = %e, "LISTEN failed");
                }
            }
            ListenerAction::Apply(ListenerCmd::Unlisten(ch)) => {
                channels.remove(&ch);
                if let Err(e) = listener.unlisten(&ch).await {
                    warn!(channel = %ch, error = %e, "UNLISTEN failed");
                }
            }
            ListenerAction::Dispatch(channel, payload) => {
                dispatch(&handlers, &channel, &payload);
            }
            ListenerAction::Reconnect => {
                tokio::time::sleep(RECONNECT_DELAY).await;
                listener = reconnect(&pool, &channels).await;
            }
            ListenerAction::Exit => {
                info!("pub-sub bus dropped — listener task exiting");
                return;
            }
        }
    }
}

/// Rebuild the dedicated listener connection and re-LISTEN every known
/// channel. Retries forever; the engine has no panic path.
async fn reconnect(pool: &PgPool, channels: &HashSet<String>) -> PgListener {
    loop {
        match PgListener::connect_with(pool).await {
            Ok(mut listener) => {
                let mut ok = true;
                for ch in channels {
                    if let Err(e) = listener.listen(ch).await {
                        error!(channel = %ch, error = %e, "re-LISTEN failed");
                        ok = false;
                        break;
                    }
                }
                if ok {
                    info!(channels = channels.len(), "pub-sub listener reconnected");
                    return listener;
                }
            }
            Err(e) => {
                warn!(error = %e, "listener reconnect failed — retrying in 5s");
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

// ---------------------------------------------------------------------------
// In-process implementation
// ---------------------------------------------------------------------------

/// Synchronous in-process bus with identical validation semantics. Backs
/// tests and single-node deployments.
#[derive(Default)]
pub struct MemoryBus {
    handlers: HandlerMap,
    next_token: AtomicU64,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            next_token: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl PubSubBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PubSubError> {
        let channel = sanitize_channel(channel)?;
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(PubSubError::PayloadTooLarge(payload.len()));
        }
        dispatch(&self.handlers, &channel, payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: Handler) -> Result<u64, PubSubError> {
        let channel = sanitize_channel(channel)?;
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.handlers
            .write()
            .entry(channel)
            .or_default()
            .push((token, handler));
        Ok(token)
    }

    async fn unsubscribe(&self, channel: &str, token: u64) -> Result<(), PubSubError> {
        let channel = sanitize_channel(channel)?;
        let mut map = self.handlers.write();
        if let Some(list) = map.get_mut(&channel) {
            list.retain(|(t, _)| *t != token);
            if list.is_empty() {
                map.remove(&channel);
            }
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn channel_names_are_lowercased() {
        assert_eq!(
            sanitize_channel("Price_Updates_BTC_USD").unwrap(),
            "price_updates_btc_usd"
        );
    }

    #[test]
    fn invalid_channel_names_fail_loudly() {
        assert!(sanitize_channel("").is_err());
        assert!(sanitize_channel("price updates").is_err());
        assert!(sanitize_channel("price-updates").is_err());
        assert!(sanitize_channel("btc/usd").is_err());
    }

    #[tokio::test]
    async fn memory_bus_delivers_to_subscribers() {
        let bus = MemoryBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        bus.subscribe(
            "price_updates_btc_usd",
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

        bus.publish("price_updates_btc_usd", "{}").await.unwrap();
        bus.publish("price_updates_eth_usd", "{}").await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = MemoryBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let token = bus
            .subscribe(
                "events",
                Arc::new(move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        bus.publish("events", "a").await.unwrap();
        bus.unsubscribe("events", token).await.unwrap();
        bus.publish("events", "b").await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oversized_payload_rejected() {
        let bus = MemoryBus::new();
        let payload = "x".repeat(MAX_PAYLOAD_BYTES + 1);
        assert!(matches!(
            bus.publish("events", &payload).await,
            Err(PubSubError::PayloadTooLarge(_))
        ));
    }
}
