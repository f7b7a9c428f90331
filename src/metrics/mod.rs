//! Live metrics for the agent message stream

use crate::config::{Config, ConfigError};
use crate::interceptor::{Collector, CollectorError, Message, Role};
use crate::optimization::{ModelTier, PriceTable};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{LazyLock, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::warn;

const PREVIEW_CHARS: usize = 120;
/// Distinct completed dimensions kept; the oldest go first
const MAX_DIMENSIONS: usize = 64;

/// `45%`, `Progress: 60.5 %`
static PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3}(?:\.\d+)?)\s*%").expect("valid regex"));

/// `✓ Structural complexity: 0.45`
static DIMENSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"✓\s*([A-Za-z][\w ]*?)\s+complexity").expect("valid regex"));

/// `dimension 2/8`, `Wave 1/3`
static STAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:dimension|step|wave|phase)\s+(\d+)\s*/\s*(\d+)").expect("valid regex")
});

fn push_bounded<T>(items: &mut VecDeque<T>, item: T, limit: usize) {
    if limit == 0 {
        return;
    }
    if items.len() >= limit {
        items.pop_front();
    }
    items.push_back(item);
}

fn extract_progress(text: &str) -> Option<f64> {
    if let Some(caps) = PERCENT.captures_iter(text).last() {
        if let Ok(value) = caps[1].parse::<f64>() {
            return Some(value.clamp(0.0, 100.0));
        }
    }

    let caps = STAGE.captures_iter(text).last()?;
    let done: f64 = caps[1].parse().ok()?;
    let total: f64 = caps[2].parse().ok()?;
    if total > 0.0 {
        Some((done / total * 100.0).clamp(0.0, 100.0))
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Running,
    Completed,
    Errored,
}

/// Metrics configuration (`[metrics]` section)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Messages kept in the recent window
    pub recent_window: usize,
    /// Tier used to price the stream until told otherwise
    pub active_tier: ModelTier,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            recent_window: 50,
            active_tier: ModelTier::Sonnet,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageSummary {
    pub role: Role,
    pub preview: String,
    pub token_count: u32,
    pub timestamp: DateTime<Utc>,
}

/// Owned copy of the collector's state
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub operation: String,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub message_count: u64,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub cost_usd: f64,
    pub active_tier: ModelTier,
    pub progress_percent: f64,
    pub completed_dimensions: Vec<String>,
    /// Tool calls seen over the whole stream
    pub tool_call_count: u64,
    /// Most recent tool names, at most the recent window
    pub tool_calls: Vec<String>,
    pub recent_messages: Vec<MessageSummary>,
    pub status: StreamStatus,
    pub error: Option<String>,
}

impl MetricsSnapshot {
    pub fn total_tokens(&self) -> u64 {
        self.tokens_input + self.tokens_output
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== {} ===", self.operation)?;
        writeln!(f, "Status: {:?}", self.status)?;
        writeln!(f, "Duration: {:.1}s", self.duration_seconds)?;
        writeln!(f, "Messages: {}", self.message_count)?;
        writeln!(f, "Input tokens: {}", self.tokens_input)?;
        writeln!(f, "Output tokens: {}", self.tokens_output)?;
        writeln!(f, "Cost ({}): ${:.4}", self.active_tier, self.cost_usd)?;
        writeln!(f, "Progress: {:.0}%", self.progress_percent)?;
        if !self.completed_dimensions.is_empty() {
            writeln!(f, "Completed: {}", self.completed_dimensions.join(", "))?;
        }
        if self.tool_call_count > 0 {
            writeln!(f, "Tool calls: {}", self.tool_call_count)?;
        }
        if let Some(error) = &self.error {
            writeln!(f, "Error: {}", error)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct MetricsState {
    message_count: u64,
    tokens_input: u64,
    tokens_output: u64,
    cost_usd: f64,
    active_tier: ModelTier,
    progress_percent: f64,
    completed_dimensions: VecDeque<String>,
    tool_call_count: u64,
    tool_calls: VecDeque<String>,
    recent: VecDeque<MessageSummary>,
    status: StreamStatus,
    error: Option<String>,
    finished: Option<Instant>,
}

/// Counts messages, tokens and cost as they stream past, and picks up
/// progress markers from the agent's text
pub struct MetricsCollector {
    operation: String,
    started_at: DateTime<Utc>,
    started: Instant,
    prices: PriceTable,
    recent_window: usize,
    state: Mutex<MetricsState>,
}

impl MetricsCollector {
    pub fn new(operation: impl Into<String>, prices: PriceTable, active_tier: ModelTier) -> Self {
        Self {
            operation: operation.into(),
            started_at: Utc::now(),
            started: Instant::now(),
            prices,
            recent_window: MetricsSettings::default().recent_window,
            state: Mutex::new(MetricsState {
                message_count: 0,
                tokens_input: 0,
                tokens_output: 0,
                cost_usd: 0.0,
                active_tier,
                progress_percent: 0.0,
                completed_dimensions: VecDeque::new(),
                tool_call_count: 0,
                tool_calls: VecDeque::new(),
                recent: VecDeque::new(),
                status: StreamStatus::Running,
                error: None,
                finished: None,
            }),
        }
    }

    pub fn from_config(operation: impl Into<String>, config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::new(operation, config.price_table()?, config.metrics.active_tier)
            .with_recent_window(config.metrics.recent_window))
    }

    pub fn with_recent_window(mut self, window: usize) -> Self {
        self.recent_window = window;
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Metrics lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Price later messages at `tier`
    pub fn set_active_tier(&self, tier: ModelTier) {
        self.lock().active_tier = tier;
    }

    pub fn record(&self, message: &Message) {
        let mut state = self.lock();
        let state = &mut *state;
        let pricing = self.prices.get(state.active_tier);
        let tokens = message.token_count as u64;

        state.message_count += 1;
        match message.role {
            Role::User | Role::System => {
                state.tokens_input += tokens;
                state.cost_usd += tokens as f64 / 1000.0 * pricing.price_in;
            }
            Role::Assistant | Role::Tool => {
                state.tokens_output += tokens;
                state.cost_usd += tokens as f64 / 1000.0 * pricing.price_out;
            }
        }

        if message.role == Role::Tool {
            let tool = message.tool_name.clone().unwrap_or_else(|| {
                message
                    .content
                    .split_whitespace()
                    .next()
                    .unwrap_or("unknown")
                    .to_string()
            });
            state.tool_call_count += 1;
            push_bounded(&mut state.tool_calls, tool, self.recent_window);
        }

        if let Some(progress) = extract_progress(&message.content) {
            state.progress_percent = progress;
        }
        for caps in DIMENSION.captures_iter(&message.content) {
            let dimension = caps[1].trim().to_string();
            if !state.completed_dimensions.contains(&dimension) {
                push_bounded(&mut state.completed_dimensions, dimension, MAX_DIMENSIONS);
            }
        }

        if self.recent_window > 0 {
            let summary = MessageSummary {
                role: message.role,
                preview: message.content.chars().take(PREVIEW_CHARS).collect(),
                token_count: message.token_count,
                timestamp: message.timestamp,
            };
            push_bounded(&mut state.recent, summary, self.recent_window);
        }
    }

    pub fn mark_completed(&self) {
        let mut state = self.lock();
        state.status = StreamStatus::Completed;
        state.finished.get_or_insert_with(Instant::now);
    }

    pub fn mark_errored(&self, error: &str) {
        let mut state = self.lock();
        state.status = StreamStatus::Errored;
        state.error = Some(error.to_string());
        state.finished.get_or_insert_with(Instant::now);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.lock();
        let elapsed: Duration = match state.finished {
            Some(finished) => finished.duration_since(self.started),
            None => self.started.elapsed(),
        };

        MetricsSnapshot {
            operation: self.operation.clone(),
            started_at: self.started_at,
            duration_seconds: elapsed.as_secs_f64(),
            message_count: state.message_count,
            tokens_input: state.tokens_input,
            tokens_output: state.tokens_output,
            cost_usd: state.cost_usd,
            active_tier: state.active_tier,
            progress_percent: state.progress_percent,
            completed_dimensions: state.completed_dimensions.iter().cloned().collect(),
            tool_call_count: state.tool_call_count,
            tool_calls: state.tool_calls.iter().cloned().collect(),
            recent_messages: state.recent.iter().cloned().collect(),
            status: state.status,
            error: state.error.clone(),
        }
    }
}

#[async_trait]
impl Collector for MetricsCollector {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn on_message(&self, message: &Message) -> Result<(), CollectorError> {
        self.record(message);
        Ok(())
    }

    async fn on_stream_complete(&self) -> Result<(), CollectorError> {
        self.mark_completed();
        Ok(())
    }

    async fn on_stream_error(&self, error: &str) -> Result<(), CollectorError> {
        self.mark_errored(error);
        Ok(())
    }
}
