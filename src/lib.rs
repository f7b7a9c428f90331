//! session-optimizer - Observe, cache and cost-control AI coding-agent sessions
//!
//! This library sits on an agent's message stream and decides how much each
//! task may cost.
//!
//! ## Key Features
//!
//! - **Message Interception**: Fan the stream out to isolated collectors without slowing the consumer
//! - **Live Metrics**: Message, token and cost counts plus progress markers
//! - **Context-Aware Caching**: Analysis, command and capability tiers keyed by project context
//! - **Model Selection**: Cheapest model tier that can handle a task's complexity and context
//! - **Budget Enforcement**: Reserve / commit / release spend against a per-period limit

pub mod cache;
pub mod config;
pub mod interceptor;
pub mod metrics;
pub mod optimization;
pub mod session;

pub use cache::{CacheConfig, CacheKey, CacheManager, CacheSummary, CacheTier, ProjectContext};
pub use config::{Config, ConfigBuilder, ConfigError};
pub use interceptor::{Collector, CollectorError, Interceptor, InterceptorConfig, Message, Role};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use optimization::{
    BudgetEnforcer, BudgetError, CostEstimate, CostEstimator, CostOptimizer, ModelSelector,
    ModelTier,
};
pub use session::{SessionCore, SessionError, TaskRequest, TaskRunner};
