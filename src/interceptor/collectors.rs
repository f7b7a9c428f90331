//! General-purpose collectors

use super::{lock, Collector, CollectorError, Message};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Keeps the most recent messages in memory
pub struct BufferingCollector {
    name: String,
    capacity: usize,
    buffer: Mutex<VecDeque<Message>>,
    complete: AtomicBool,
    stream_error: Mutex<Option<String>>,
}

impl BufferingCollector {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            buffer: Mutex::new(VecDeque::new()),
            complete: AtomicBool::new(false),
            stream_error: Mutex::new(None),
        }
    }

    /// Buffered messages, oldest first
    pub fn messages(&self) -> Vec<Message> {
        lock(&self.buffer).iter().cloned().collect()
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    pub fn stream_error(&self) -> Option<String> {
        lock(&self.stream_error).clone()
    }
}

#[async_trait]
impl Collector for BufferingCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_message(&self, message: &Message) -> Result<(), CollectorError> {
        let mut buffer = lock(&self.buffer);
        if buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(message.clone());
        Ok(())
    }

    async fn on_stream_complete(&self) -> Result<(), CollectorError> {
        self.complete.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn on_stream_error(&self, error: &str) -> Result<(), CollectorError> {
        *lock(&self.stream_error) = Some(error.to_string());
        Ok(())
    }
}

/// Emits every message at debug level
pub struct LoggingCollector {
    name: String,
    seen: AtomicU64,
}

impl LoggingCollector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seen: AtomicU64::new(0),
        }
    }

    pub fn count(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Collector for LoggingCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_message(&self, message: &Message) -> Result<(), CollectorError> {
        let n = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        let preview: String = message.content.chars().take(80).collect();
        debug!(
            "[{}] #{} {:?} ({} tokens): {}",
            self.name, n, message.role, message.token_count, preview
        );
        Ok(())
    }

    async fn on_stream_complete(&self) -> Result<(), CollectorError> {
        debug!("[{}] stream complete after {} messages", self.name, self.count());
        Ok(())
    }

    async fn on_stream_error(&self, error: &str) -> Result<(), CollectorError> {
        debug!("[{}] stream error: {}", self.name, error);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_keeps_most_recent() {
        let collector = BufferingCollector::new("buffer", 2);
        for content in ["a", "b", "c"] {
            tokio_test::block_on(collector.on_message(&Message::user(content))).unwrap();
        }
        let contents: Vec<_> = collector.messages().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["b", "c"]);
    }

    #[test]
    fn test_logging_collector_counts() {
        let collector = LoggingCollector::new("log");
        tokio_test::block_on(async {
            collector.on_message(&Message::assistant("hi")).await.unwrap();
            collector.on_message(&Message::tool("Read", "src/lib.rs")).await.unwrap();
            collector.on_stream_complete().await.unwrap();
        });
        assert_eq!(collector.count(), 2);
    }

    #[test]
    fn test_buffer_records_stream_end() {
        let collector = BufferingCollector::new("buffer", 4);
        assert!(!collector.is_complete());
        tokio_test::block_on(collector.on_stream_error("timeout")).unwrap();
        assert_eq!(collector.stream_error().as_deref(), Some("timeout"));
        tokio_test::block_on(collector.on_stream_complete()).unwrap();
        assert!(collector.is_complete());
    }
}
