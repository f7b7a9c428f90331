//! Message interception pipeline
//!
//! The [`Interceptor`] sits between the agent's message stream and its
//! consumer. Every message goes straight back to the caller; copies are
//! queued for each registered [`Collector`], which runs on its own task with
//! its own bounded queue. A slow or failing collector only affects itself:
//! a full queue drops deliveries for that collector, and errors or panics
//! are recorded in its [`CollectorStatus`].

mod collectors;

pub use collectors::{BufferingCollector, LoggingCollector};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{FutureExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message from the agent stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub token_count: u32,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Set on tool invocations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            token_count: 0,
            timestamp: Utc::now(),
            tool_name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_name: Some(name.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    pub fn with_token_count(mut self, tokens: u32) -> Self {
        self.token_count = tokens;
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectorError {
    #[error("{0}")]
    Failed(String),

    #[error("collector panicked: {0}")]
    Panicked(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterceptorError {
    #[error("collector limit reached ({limit})")]
    TooManyCollectors { limit: usize },

    #[error("collectors must be registered from within a tokio runtime")]
    NoRuntime,
}

/// Observer of the message stream
#[async_trait]
pub trait Collector: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn on_message(&self, message: &Message) -> Result<(), CollectorError>;

    async fn on_stream_complete(&self) -> Result<(), CollectorError> {
        Ok(())
    }

    async fn on_stream_error(&self, _error: &str) -> Result<(), CollectorError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectorId(u64);

impl fmt::Display for CollectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Delivery and failure accounting for one collector
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectorStatus {
    pub id: CollectorId,
    pub name: String,
    pub error_count: u64,
    pub last_error: Option<String>,
    /// Deliveries handed to the collector, successful or not
    pub delivered: u64,
    /// Deliveries lost because the collector's queue was full
    pub dropped: u64,
}

/// Interceptor configuration (`[interceptor]` section)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptorConfig {
    pub max_collectors: usize,
    /// Per-collector queue depth. A collector that falls further behind
    /// than this loses messages (counted in `CollectorStatus::dropped`)
    /// instead of slowing the stream.
    pub queue_capacity: usize,
    /// Consecutive failures after which a collector is removed; `None` keeps it forever
    pub collector_error_threshold: Option<u32>,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            max_collectors: 16,
            queue_capacity: 4096,
            collector_error_threshold: Some(25),
        }
    }
}

enum Delivery {
    Message(Arc<Message>),
    StreamComplete,
    StreamError(Arc<str>),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct CollectorState {
    error_count: u64,
    consecutive_errors: u32,
    last_error: Option<String>,
    delivered: u64,
    dropped: u64,
}

struct CollectorHandle {
    name: String,
    sender: mpsc::Sender<Delivery>,
    state: Arc<Mutex<CollectorState>>,
    task: JoinHandle<()>,
}

impl CollectorHandle {
    fn status(&self, id: CollectorId) -> CollectorStatus {
        status_of(id, &self.name, &self.state)
    }
}

fn status_of(id: CollectorId, name: &str, state: &Mutex<CollectorState>) -> CollectorStatus {
    let state = lock(state);
    CollectorStatus {
        id,
        name: name.to_string(),
        error_count: state.error_count,
        last_error: state.last_error.clone(),
        delivered: state.delivered,
        dropped: state.dropped,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("Interceptor lock poisoned, recovering");
        poisoned.into_inner()
    })
}

struct Registry {
    config: InterceptorConfig,
    collectors: Mutex<HashMap<CollectorId, CollectorHandle>>,
    retired: Mutex<Vec<CollectorStatus>>,
    next_id: AtomicU64,
}

impl Registry {
    /// Remove a collector that kept failing, keeping its final status
    fn retire(&self, id: CollectorId) {
        let Some(handle) = lock(&self.collectors).remove(&id) else {
            return;
        };
        let status = handle.status(id);
        warn!(
            "Removed collector {} ({}) after {} consecutive failures; last error: {}",
            status.name,
            id,
            self.config.collector_error_threshold.unwrap_or_default(),
            status.last_error.as_deref().unwrap_or("none")
        );
        lock(&self.retired).push(status);
    }

    fn senders(&self) -> Vec<mpsc::Sender<Delivery>> {
        lock(&self.collectors)
            .values()
            .map(|h| h.sender.clone())
            .collect()
    }
}

/// Fans the message stream out to isolated collectors
#[derive(Clone)]
pub struct Interceptor {
    registry: Arc<Registry>,
}

impl Interceptor {
    pub fn new(config: InterceptorConfig) -> Self {
        Self {
            registry: Arc::new(Registry {
                config,
                collectors: Mutex::new(HashMap::new()),
                retired: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &InterceptorConfig {
        &self.registry.config
    }

    /// Start delivering messages to `collector`.
    ///
    /// Spawns the collector's worker on the current tokio runtime.
    pub fn register(&self, collector: Arc<dyn Collector>) -> Result<CollectorId, InterceptorError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| InterceptorError::NoRuntime)?;
        let config = &self.registry.config;

        let mut collectors = lock(&self.registry.collectors);
        if collectors.len() >= config.max_collectors {
            return Err(InterceptorError::TooManyCollectors {
                limit: config.max_collectors,
            });
        }

        let id = CollectorId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        let name = collector.name().to_string();
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let state = Arc::new(Mutex::new(CollectorState::default()));

        let worker = Worker {
            id,
            collector,
            state: state.clone(),
            registry: Arc::downgrade(&self.registry),
            error_threshold: config.collector_error_threshold,
        };
        let task = runtime.spawn(worker.run(receiver));

        info!("Registered collector {} ({})", name, id);
        collectors.insert(
            id,
            CollectorHandle {
                name,
                sender,
                state,
                task,
            },
        );
        Ok(id)
    }

    /// Stop delivering to a collector. Already queued messages are still processed.
    pub fn unregister(&self, id: CollectorId) -> Option<CollectorStatus> {
        let handle = lock(&self.registry.collectors).remove(&id)?;
        debug!("Unregistered collector {} ({})", handle.name, id);
        Some(handle.status(id))
    }

    /// Queue `message` for every collector and hand it back to the caller.
    ///
    /// Never waits on a collector. A collector whose queue is full misses
    /// this message; the others still get it, and the loss shows up in its
    /// `dropped` count. Delivery is complete only while each collector keeps
    /// within `queue_capacity` messages of the stream, so size the queue for
    /// the longest burst a slow collector must absorb.
    pub fn dispatch(&self, message: Message) -> Arc<Message> {
        let message = Arc::new(message);
        let collectors = lock(&self.registry.collectors);

        for (id, handle) in collectors.iter() {
            match handle.sender.try_send(Delivery::Message(message.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    lock(&handle.state).dropped += 1;
                    warn!("Collector {} ({}) queue full, dropping message", handle.name, id);
                }
                // Worker already gone; it will be retired or unregistered
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        message
    }

    /// Tell every collector the stream finished
    pub async fn notify_stream_complete(&self) {
        for sender in self.registry.senders() {
            let _ = sender.send(Delivery::StreamComplete).await;
        }
    }

    /// Tell every collector the stream failed
    pub async fn notify_stream_error(&self, error: &str) {
        let error: Arc<str> = Arc::from(error);
        for sender in self.registry.senders() {
            let _ = sender.send(Delivery::StreamError(error.clone())).await;
        }
    }

    /// Wait until every collector has processed what was queued before this call
    pub async fn flush(&self) {
        let mut pending = Vec::new();
        for sender in self.registry.senders() {
            let (ack, done) = oneshot::channel();
            if sender.send(Delivery::Flush(ack)).await.is_ok() {
                pending.push(done);
            }
        }
        for done in pending {
            // A worker that stopped drops the ack
            let _ = done.await;
        }
    }

    /// Unregister every collector and wait for their queues to drain
    pub async fn shutdown(&self) -> Vec<CollectorStatus> {
        let handles: Vec<(CollectorId, CollectorHandle)> =
            lock(&self.registry.collectors).drain().collect();

        let mut statuses = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            let CollectorHandle {
                name,
                sender,
                state,
                task,
            } = handle;
            drop(sender);
            if let Err(e) = task.await {
                warn!("Collector {} ({}) worker ended abnormally: {}", name, id, e);
            }
            statuses.push(status_of(id, &name, &state));
        }
        statuses.sort_by_key(|s| s.id);
        statuses
    }

    pub fn statuses(&self) -> Vec<CollectorStatus> {
        let mut statuses: Vec<_> = lock(&self.registry.collectors)
            .iter()
            .map(|(id, handle)| handle.status(*id))
            .collect();
        statuses.sort_by_key(|s| s.id);
        statuses
    }

    pub fn status(&self, id: CollectorId) -> Option<CollectorStatus> {
        lock(&self.registry.collectors)
            .get(&id)
            .map(|handle| handle.status(id))
    }

    /// Collectors removed for repeated failures
    pub fn retired(&self) -> Vec<CollectorStatus> {
        lock(&self.registry.retired).clone()
    }

    pub fn collector_count(&self) -> usize {
        lock(&self.registry.collectors).len()
    }

    /// Pass `stream` through unchanged while fanning each message out.
    ///
    /// Collectors see `on_stream_complete` when the source ends and
    /// `on_stream_error` when it yields an error; the wrapped stream ends
    /// after the first error.
    pub fn intercept<S, E>(&self, stream: S) -> impl Stream<Item = Result<Arc<Message>, E>> + Send
    where
        S: Stream<Item = Result<Message, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        futures_util::stream::unfold(
            (Box::pin(stream), self.clone(), false),
            |(mut source, interceptor, finished)| async move {
                if finished {
                    return None;
                }
                match source.next().await {
                    Some(Ok(message)) => {
                        let message = interceptor.dispatch(message);
                        Some((Ok(message), (source, interceptor, false)))
                    }
                    Some(Err(e)) => {
                        interceptor.notify_stream_error(&e.to_string()).await;
                        Some((Err(e), (source, interceptor, true)))
                    }
                    None => {
                        interceptor.notify_stream_complete().await;
                        None
                    }
                }
            },
        )
    }
}

impl Default for Interceptor {
    fn default() -> Self {
        Self::new(InterceptorConfig::default())
    }
}

struct Worker {
    id: CollectorId,
    collector: Arc<dyn Collector>,
    state: Arc<Mutex<CollectorState>>,
    registry: Weak<Registry>,
    error_threshold: Option<u32>,
}

impl Worker {
    async fn run(self, mut receiver: mpsc::Receiver<Delivery>) {
        while let Some(delivery) = receiver.recv().await {
            let result = match delivery {
                Delivery::Flush(ack) => {
                    let _ = ack.send(());
                    continue;
                }
                Delivery::Message(message) => {
                    let result = isolate(self.collector.on_message(&message)).await;
                    lock(&self.state).delivered += 1;
                    result
                }
                Delivery::StreamComplete => isolate(self.collector.on_stream_complete()).await,
                Delivery::StreamError(error) => {
                    isolate(self.collector.on_stream_error(&error)).await
                }
            };

            match result {
                Ok(()) => lock(&self.state).consecutive_errors = 0,
                Err(e) => {
                    if self.record_failure(e) {
                        if let Some(registry) = self.registry.upgrade() {
                            registry.retire(self.id);
                        }
                        break;
                    }
                }
            }
        }
        debug!("Collector {} ({}) worker stopped", self.collector.name(), self.id);
    }

    /// Returns true once the collector should be removed
    fn record_failure(&self, error: CollectorError) -> bool {
        warn!(
            "Collector {} ({}) failed: {}",
            self.collector.name(),
            self.id,
            error
        );
        let mut state = lock(&self.state);
        state.error_count += 1;
        state.consecutive_errors += 1;
        state.last_error = Some(error.to_string());
        self.error_threshold
            .is_some_and(|limit| state.consecutive_errors >= limit)
    }
}

/// Run a collector callback, turning a panic into an error
async fn isolate<F>(callback: F) -> Result<(), CollectorError>
where
    F: Future<Output = Result<(), CollectorError>>,
{
    match AssertUnwindSafe(callback).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(CollectorError::Panicked(reason))
        }
    }
}
