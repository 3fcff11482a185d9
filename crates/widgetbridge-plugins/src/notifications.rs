use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use widgetbridge_core::config::DEFAULT_NOTIFICATION_TTL_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    #[default]
    Info,
    Success,
    Error,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Info => "info",
            NotificationKind::Success => "success",
            NotificationKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotificationId(u64);

impl NotificationId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: NotificationId,
    pub kind: NotificationKind,
    pub message: String,
    /// Unix timestamp in milliseconds.
    pub created_at: u64,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    entries: Vec<Notification>,
    timers: HashMap<NotificationId, JoinHandle<()>>,
}

impl QueueState {
    fn remove(&mut self, id: NotificationId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|n| n.id != id);
        before != self.entries.len()
    }
}

/// Transient status messages shown to a widget's consumer.
///
/// Every entry is removed after the TTL unless it was expired by hand first.
/// Expiry timers run on the ambient Tokio runtime and are kept in an id-keyed
/// map so a manual dismissal cancels the pending timer.
#[derive(Clone)]
pub struct NotificationQueue {
    inner: Arc<Mutex<QueueState>>,
    ttl: Duration,
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_NOTIFICATION_TTL_MS))
    }
}

impl NotificationQueue {
    pub fn new(ttl: Duration) -> Self {
        Self { inner: Arc::new(Mutex::new(QueueState::default())), ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn push(&self, kind: NotificationKind, message: impl Into<String>) -> NotificationId {
        let message = message.into();
        let mut state = self.lock();
        state.next_id += 1;
        let id = NotificationId(state.next_id);
        state.entries.push(Notification { id, kind, message, created_at: now_millis() });

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let weak = Arc::downgrade(&self.inner);
                let ttl = self.ttl;
                let timer = handle.spawn(async move {
                    tokio::time::sleep(ttl).await;
                    expire_from_timer(weak, id);
                });
                state.timers.insert(id, timer);
            }
            Err(_) => {
                warn!(id = id.0, "no runtime available, notification will not auto-expire");
            }
        }
        debug!(id = id.0, kind = kind.as_str(), "notification queued");
        id
    }

    /// Removes `id`. Returns false when it was already gone.
    pub fn expire(&self, id: NotificationId) -> bool {
        let mut state = self.lock();
        if let Some(timer) = state.timers.remove(&id) {
            timer.abort();
        }
        state.remove(id)
    }

    /// Drops every entry and cancels every pending timer.
    pub fn clear(&self) {
        let mut state = self.lock();
        for (_, timer) in state.timers.drain() {
            timer.abort();
        }
        state.entries.clear();
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        self.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn pending_timers(&self) -> usize {
        self.lock().timers.len()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn expire_from_timer(queue: Weak<Mutex<QueueState>>, id: NotificationId) {
    let Some(inner) = queue.upgrade() else {
        return;
    };
    let mut state = inner.lock().unwrap_or_else(PoisonError::into_inner);
    state.timers.remove(&id);
    if state.remove(id) {
        debug!(id = id.0, "notification expired");
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_millis(3000);

    #[tokio::test(start_paused = true)]
    async fn expires_after_ttl() {
        let queue = NotificationQueue::new(TTL);
        let id = queue.push(NotificationKind::Info, "saved");
        assert_eq!(queue.len(), 1);

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(queue.snapshot()[0].id, id);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(queue.is_empty());
        assert_eq!(queue.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_expire_before_ttl_removes_once() {
        let queue = NotificationQueue::new(TTL);
        let keep = queue.push(NotificationKind::Success, "first");
        let gone = queue.push(NotificationKind::Error, "second");

        assert!(queue.expire(gone));
        assert!(!queue.expire(gone));
        assert_eq!(queue.pending_timers(), 1);
        assert_eq!(queue.snapshot().iter().map(|n| n.id).collect::<Vec<_>>(), vec![keep]);

        tokio::time::sleep(TTL + Duration::from_millis(10)).await;
        assert!(queue.is_empty());
        assert!(!queue.expire(gone));
        assert!(!queue.expire(keep));
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_pushes_get_distinct_ids_in_order() {
        let queue = NotificationQueue::new(TTL);
        let ids: Vec<_> = (0..50)
            .map(|i| queue.push(NotificationKind::Info, format!("msg {i}")))
            .collect();
        let unique: std::collections::HashSet<_> = ids.iter().copied().collect();
        assert_eq!(unique.len(), 50);

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.first().map(|n| n.message.as_str()), Some("msg 0"));
        assert_eq!(snapshot.last().map(|n| n.message.as_str()), Some("msg 49"));
        assert!(snapshot.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cancels_timers() {
        let queue = NotificationQueue::new(TTL);
        queue.push(NotificationKind::Info, "a");
        queue.push(NotificationKind::Info, "b");
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.pending_timers(), 0);

        let id = queue.push(NotificationKind::Info, "c");
        tokio::time::sleep(TTL * 2).await;
        assert!(!queue.expire(id));
    }

    #[test]
    fn push_without_runtime_keeps_entry_until_expired() {
        let queue = NotificationQueue::default();
        let id = queue.push(NotificationKind::Error, "offline");
        assert_eq!(queue.pending_timers(), 0);
        assert!(queue.expire(id));
        assert!(queue.is_empty());
    }

    #[test]
    fn serializes_kind_in_lowercase() {
        let n = Notification {
            id: NotificationId(7),
            kind: NotificationKind::Success,
            message: "ok".into(),
            created_at: 1,
        };
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["kind"], "success");
        assert_eq!(v["createdAt"], 1);
        assert_eq!(v["id"], 7);
    }
}
