//! Client session registry: per-session interest sets, the global interest
//! index, and the 0↔1 transitions that create or tear down upstream
//! subscriptions.
//!
//! All interest mutations and their paired multiplexer calls happen under
//! one async mutex, so no two concurrent subscribes can observe a key in a
//! half-created state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::mux::Multiplexer;
use crate::types::SubscriptionKey;

pub type SessionId = u64;

#[derive(Debug, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// First global listener; the upstream subscription was created.
    Created,
    /// Key already live for another session.
    Shared,
    /// Key already in this session's interest set.
    AlreadySubscribed,
    Failed(String),
}

#[derive(Debug, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    NotSubscribed,
    /// Removed from this session; other listeners remain.
    Removed,
    /// Last listener gone; the upstream subscription was torn down.
    RemovedLast,
}

#[derive(Default)]
struct Inner {
    /// Session → interest set.
    sessions: HashMap<SessionId, HashSet<SubscriptionKey>>,
    /// Key → interested sessions. Entries are removed when the set empties.
    interest: HashMap<SubscriptionKey, HashSet<SessionId>>,
}

pub struct Registry {
    mux: Arc<Multiplexer>,
    /// Config-pinned keys survive the last client disconnect.
    pinned: HashSet<SubscriptionKey>,
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new(mux: Arc<Multiplexer>, pinned: impl IntoIterator<Item = SubscriptionKey>) -> Arc<Self> {
        Arc::new(Self {
            mux,
            pinned: pinned.into_iter().collect(),
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(1),
        })
    }

    pub async fn register(&self) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .await
            .sessions
            .insert(id, HashSet::new());
        id
    }

    pub async fn subscribe(&self, session: SessionId, key: SubscriptionKey) -> SubscribeOutcome {
        let mut inner = self.inner.lock().await;
        match inner.sessions.get(&session) {
            Some(interest) if interest.contains(&key) => return SubscribeOutcome::AlreadySubscribed,
            Some(_) => {}
            None => return SubscribeOutcome::Failed("unknown session".to_string()),
        }

        let first_global = inner
            .interest
            .get(&key)
            .map_or(true, |sessions| sessions.is_empty());
        if first_global && !self.mux.subscribe(&key, "client_request").await {
            return SubscribeOutcome::Failed("Failed to create subscription".to_string());
        }

        inner
            .sessions
            .get_mut(&session)
            .expect("session checked above")
            .insert(key.clone());
        inner.interest.entry(key).or_default().insert(session);

        if first_global {
            SubscribeOutcome::Created
        } else {
            SubscribeOutcome::Shared
        }
    }

    pub async fn unsubscribe(
        &self,
        session: SessionId,
        key: &SubscriptionKey,
    ) -> UnsubscribeOutcome {
        let mut inner = self.inner.lock().await;
        let removed = inner
            .sessions
            .get_mut(&session)
            .map(|interest| interest.remove(key))
            .unwrap_or(false);
        if !removed {
            return UnsubscribeOutcome::NotSubscribed;
        }

        let now_empty = match inner.interest.get_mut(key) {
            Some(sessions) => {
                sessions.remove(&session);
                sessions.is_empty()
            }
            None => true,
        };
        if !now_empty {
            return UnsubscribeOutcome::Removed;
        }

        inner.interest.remove(key);
        if self.pinned.contains(key) {
            return UnsubscribeOutcome::Removed;
        }
        self.mux.unsubscribe(&key.symbol, &key.timeframe).await;
        UnsubscribeOutcome::RemovedLast
    }

    /// Drop a session and tear down every key it was the last listener for.
    pub async fn disconnect(&self, session: SessionId) {
        let mut inner = self.inner.lock().await;
        let Some(interest) = inner.sessions.remove(&session) else {
            return;
        };
        for key in interest {
            let now_empty = match inner.interest.get_mut(&key) {
                Some(sessions) => {
                    sessions.remove(&session);
                    sessions.is_empty()
                }
                None => false,
            };
            if !now_empty {
                continue;
            }
            inner.interest.remove(&key);
            if self.pinned.contains(&key) {
                continue;
            }
            self.mux.unsubscribe(&key.symbol, &key.timeframe).await;
            info!(
                "Auto-unsubscribed from {}/{} (last client disconnected)",
                key.symbol, key.timeframe
            );
        }
    }

    /// Keys with non-empty global interest, sorted for stable output.
    pub async fn list(&self) -> Vec<SubscriptionKey> {
        let inner = self.inner.lock().await;
        let mut keys: Vec<_> = inner
            .interest
            .iter()
            .filter(|(_, sessions)| !sessions.is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    /// Whether the session holds `key` in its interest set (I3 checks).
    pub async fn is_interested(&self, session: SessionId, key: &SubscriptionKey) -> bool {
        self.inner
            .lock()
            .await
            .sessions
            .get(&session)
            .is_some_and(|interest| interest.contains(key))
    }
}
