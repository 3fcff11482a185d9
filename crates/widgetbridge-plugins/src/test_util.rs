//! Scripted API proxy and bus helpers shared by the unit tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::api::{ApiError, ApiProxy};
use crate::bridge::{BridgeContext, BridgeHandle};
use crate::bus::{handler, EventBus, LocalEventBus};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Call {
    pub method: &'static str,
    pub path: String,
    pub body: Option<Value>,
}

/// Answers from a per-path script. Queued answers are consumed first, then
/// the sticky answer, then 404. While held, every call parks until released
/// by index (calls are numbered in arrival order).
#[derive(Default)]
pub(crate) struct MockApi {
    queued: Mutex<HashMap<String, VecDeque<Result<Value, ApiError>>>>,
    sticky: Mutex<HashMap<String, Result<Value, ApiError>>>,
    calls: Mutex<Vec<Call>>,
    held: AtomicBool,
    gates: Mutex<Vec<Option<oneshot::Sender<()>>>>,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, path: &str, result: Result<Value, ApiError>) {
        self.sticky.lock().unwrap().insert(path.to_string(), result);
    }

    pub fn respond_once(&self, path: &str, result: Result<Value, ApiError>) {
        self.queued
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self, index: usize) {
        let gate = self.gates.lock().unwrap().get_mut(index).and_then(Option::take);
        if let Some(tx) = gate {
            let _ = tx.send(());
        }
    }

    pub fn release_all(&self) {
        self.held.store(false, Ordering::SeqCst);
        for gate in self.gates.lock().unwrap().iter_mut() {
            if let Some(tx) = gate.take() {
                let _ = tx.send(());
            }
        }
    }

    pub fn parked(&self) -> usize {
        self.gates.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, method: &str, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.method == method && c.path == path)
            .count()
    }

    async fn answer(
        &self,
        method: &'static str,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, ApiError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call { method, path: path.to_string(), body });
        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(path)
            .and_then(VecDeque::pop_front);
        let result = queued
            .or_else(|| self.sticky.lock().unwrap().get(path).cloned())
            .unwrap_or(Err(ApiError::Status { status: 404, body: None }));

        if self.held.load(Ordering::SeqCst) {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().unwrap().push(Some(tx));
            let _ = rx.await;
        }
        result
    }
}

#[async_trait]
impl ApiProxy for MockApi {
    async fn get(&self, path: &str) -> Result<Value, ApiError> {
        self.answer("GET", path, None).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
        self.answer("POST", path, Some(body.clone())).await
    }
}

pub(crate) fn bridge_with(api: Option<Arc<MockApi>>) -> (Arc<LocalEventBus>, BridgeHandle) {
    let bus = Arc::new(LocalEventBus::new());
    let api = api.map(|a| a as Arc<dyn ApiProxy>);
    let bridge = BridgeHandle::new(bus.clone(), api, BridgeContext::for_tenant("tenant-1"));
    (bus, bridge)
}

/// Collects every payload emitted on `topic`.
pub(crate) fn record(bus: &LocalEventBus, topic: &str) -> Arc<Mutex<Vec<Value>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    // Recorders live as long as the bus.
    let _ = bus.on(topic, handler(move |p| sink.lock().unwrap().push(p.clone())));
    seen
}

/// Lets spawned tasks on the current-thread test runtime make progress.
pub(crate) async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

pub(crate) async fn until(mut ready: impl FnMut() -> bool) {
    for _ in 0..256 {
        if ready() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
