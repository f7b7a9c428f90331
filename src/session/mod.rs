//! Session coordination
//!
//! [`SessionCore`] wires the interceptor, metrics, cache and cost optimizer
//! together for one agent session. A task goes through:
//!
//! 1. model selection
//! 2. analysis cache lookup (a hit skips the model call)
//! 3. budget reservation for the estimated cost
//! 4. the model call, through a [`TaskRunner`]
//! 5. commit of the actual cost, or release if the call failed
//!
//! A runner that reports its model as unavailable gets the task retried on
//! the next suitable tier. A reservation refused by the budget moves the
//! task to a cheaper tier that fits, even one below the capability the
//! task's complexity asks for.

use crate::cache::{CacheError, CacheKey, CacheManager, CacheTier, ProjectContext};
use crate::config::{Config, ConfigError};
use crate::interceptor::{CollectorStatus, Interceptor, InterceptorError, Message};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::optimization::{
    BudgetError, CommitOutcome, CostOptimizer, CostReport, ModelTier, SelectionError, TaskProfile,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("model {0} is unavailable")]
    ModelUnavailable(ModelTier),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("model selection failed: {0}")]
    Selection(#[from] SelectionError),

    #[error("budget: {0}")]
    Budget(#[from] BudgetError),

    #[error("task failed on {tier}: {source}")]
    Runner {
        tier: ModelTier,
        #[source]
        source: anyhow::Error,
    },

    #[error("cache: {0}")]
    Cache(#[from] CacheError),

    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("interceptor: {0}")]
    Interceptor(#[from] InterceptorError),
}

/// A unit of work for the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub spec: String,
    #[serde(default)]
    pub context: ProjectContext,
    pub profile: TaskProfile,
}

/// What a runner produced and what it consumed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub result: serde_json::Value,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub result: serde_json::Value,
    /// `None` when served from cache
    pub tier: Option<ModelTier>,
    pub cached: bool,
    pub cost: f64,
    pub savings_vs_baseline: f64,
    /// Tier first chosen when the budget forced a cheaper one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downgraded_from: Option<ModelTier>,
    #[serde(skip)]
    pub commit: Option<CommitOutcome>,
}

/// Executes a task on a given model tier
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, tier: ModelTier, request: &TaskRequest) -> Result<TaskOutput, RunnerError>;
}

/// Interceptor, metrics, cache and cost control for one session.
///
/// The metrics collector prices the whole stream at a single active tier.
/// Every `run_task` sets it to the tier it is about to run, so concurrent
/// tasks on different tiers share one value and the cost estimate follows
/// whichever task started last. Use one `SessionCore` per concurrent task
/// when per-tier cost attribution matters.
pub struct SessionCore {
    interceptor: Interceptor,
    metrics: Arc<MetricsCollector>,
    cache: Arc<CacheManager>,
    optimizer: CostOptimizer,
    sweeper: Option<JoinHandle<()>>,
    ledger_path: Option<PathBuf>,
}

impl SessionCore {
    /// Assemble a session and register its metrics collector.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        interceptor: Interceptor,
        metrics: Arc<MetricsCollector>,
        cache: Arc<CacheManager>,
        optimizer: CostOptimizer,
    ) -> Result<Self, SessionError> {
        interceptor.register(metrics.clone())?;
        let sweeper = cache.spawn_configured_sweeper();
        Ok(Self {
            interceptor,
            metrics,
            cache,
            optimizer,
            sweeper,
            ledger_path: None,
        })
    }

    /// Build every component from `config`, restoring the cache snapshot and
    /// the budget ledger when their files exist
    pub fn from_config(operation: &str, config: &Config) -> Result<Self, SessionError> {
        let cache = Arc::new(CacheManager::from_config(config)?);
        if let Some(path) = &config.cache.snapshot_path {
            if path.exists() {
                match cache.load_snapshot(path) {
                    Ok(restored) => debug!("Restored {} cache entries", restored),
                    Err(e) => warn!("Ignoring unreadable cache snapshot {}: {}", path.display(), e),
                }
            }
        }

        let optimizer = CostOptimizer::from_config(config)?;
        if let Some(path) = &config.budget.ledger_path {
            if path.exists() {
                match optimizer.budget().load_from(path) {
                    Ok(restored) => debug!("Restored {} budget periods", restored),
                    Err(e) => warn!("Ignoring unreadable budget ledger {}: {}", path.display(), e),
                }
            }
        }

        let mut session = Self::new(
            Interceptor::new(config.interceptor.clone()),
            Arc::new(MetricsCollector::from_config(operation, config)?),
            cache,
            optimizer,
        )?;
        session.ledger_path = config.budget.ledger_path.clone();
        Ok(session)
    }

    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn optimizer(&self) -> &CostOptimizer {
        &self.optimizer
    }

    /// Feed an agent message through the interceptor
    pub fn dispatch(&self, message: Message) -> Arc<Message> {
        self.interceptor.dispatch(message)
    }

    /// Run a task, reusing a cached analysis when the spec and project are unchanged
    pub async fn run_task<R: TaskRunner + ?Sized>(
        &self,
        runner: &R,
        request: &TaskRequest,
    ) -> Result<TaskOutcome, SessionError> {
        let key = CacheKey::analysis(&request.spec, &request.context.hash());
        let mut excluded: Vec<ModelTier> = Vec::new();
        let mut downgraded_from: Option<ModelTier> = None;
        let mut refusal: Option<BudgetError> = None;

        loop {
            let selection = match self.optimizer.plan_excluding(&request.profile, &excluded) {
                Ok(selection) => selection,
                // Every cheaper tier was refused too
                Err(e) => return Err(refusal.map_or_else(|| e.into(), SessionError::Budget)),
            };

            if let Some(result) = self
                .cache
                .get_json::<serde_json::Value>(CacheTier::Analysis, &key)
            {
                debug!("Analysis cache hit for {}", key);
                return Ok(TaskOutcome {
                    result,
                    tier: None,
                    cached: true,
                    cost: 0.0,
                    savings_vs_baseline: 0.0,
                    downgraded_from: None,
                    commit: None,
                });
            }

            let budget = self.optimizer.budget();
            let token = match budget.reserve_current(selection.estimate.estimated_cost) {
                Ok(token) => token,
                Err(e @ BudgetError::Exceeded { .. }) => {
                    let refused_cost = selection.estimate.estimated_cost;
                    let estimator = self.optimizer.estimator();
                    for tier in ModelTier::ALL {
                        let cost = estimator
                            .estimate(
                                tier,
                                request.profile.context_tokens,
                                request.profile.expected_output_tokens,
                            )
                            .estimated_cost;
                        if cost >= refused_cost && !excluded.contains(&tier) {
                            excluded.push(tier);
                        }
                    }
                    warn!(
                        "Budget refused ${:.4} on {}, trying a cheaper tier",
                        refused_cost, selection.tier
                    );
                    downgraded_from.get_or_insert(selection.tier);
                    refusal = Some(e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            self.metrics.set_active_tier(selection.tier);

            match runner.run(selection.tier, request).await {
                Ok(output) => {
                    let estimator = self.optimizer.estimator();
                    let actual = estimator
                        .estimate(selection.tier, output.tokens_in, output.tokens_out)
                        .estimated_cost;
                    let savings = estimator.savings_vs(
                        selection.tier,
                        selection.baseline,
                        output.tokens_in,
                        output.tokens_out,
                    );
                    let commit = budget.commit(token, actual)?;
                    if let Some(over) = commit.over_budget_by {
                        warn!(
                            "Task on {} pushed {} over budget by ${:.4}",
                            selection.tier, commit.period_id, over
                        );
                    }

                    self.cache.set_json_with_cost(
                        CacheTier::Analysis,
                        &key,
                        &output.result,
                        None,
                        actual,
                    )?;

                    if let Some(planned) = downgraded_from {
                        info!("Budget moved task from {} to {}", planned, selection.tier);
                    }
                    info!(
                        "Task completed on {} for ${:.4} (${:.4} vs {})",
                        selection.tier, actual, savings, selection.baseline
                    );
                    return Ok(TaskOutcome {
                        result: output.result,
                        tier: Some(selection.tier),
                        cached: false,
                        cost: actual,
                        savings_vs_baseline: savings,
                        downgraded_from,
                        commit: Some(commit),
                    });
                }
                Err(RunnerError::ModelUnavailable(tier)) => {
                    budget.release(token)?;
                    warn!("{} unavailable, retrying on another tier", tier);
                    if !excluded.contains(&tier) {
                        excluded.push(tier);
                    }
                    if tier != selection.tier && !excluded.contains(&selection.tier) {
                        excluded.push(selection.tier);
                    }
                }
                Err(RunnerError::Failed(source)) => {
                    budget.release(token)?;
                    return Err(SessionError::Runner {
                        tier: selection.tier,
                        source,
                    });
                }
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn report(&self) -> CostReport {
        self.optimizer.report(&self.cache)
    }

    /// Drain collectors, stop the sweeper, then persist the cache and the
    /// budget ledger if configured
    pub async fn shutdown(self) -> Vec<CollectorStatus> {
        self.interceptor.flush().await;
        let statuses = self.interceptor.shutdown().await;

        if let Some(sweeper) = self.sweeper {
            sweeper.abort();
        }
        match self.cache.save_default_snapshot() {
            Ok(()) | Err(CacheError::NoSnapshotPath) => {}
            Err(e) => warn!("Failed to save cache snapshot: {}", e),
        }
        if let Some(path) = &self.ledger_path {
            if let Err(e) = self.optimizer.budget().save_to(path) {
                warn!("Failed to save budget ledger {}: {}", path.display(), e);
            }
        }

        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::config::ConfigBuilder;
    use crate::optimization::{
        BudgetEnforcer, BudgetPeriod, CostEstimator, PriceTable, SelectionPolicy,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedRunner {
        calls: AtomicUsize,
        tiers: Mutex<Vec<ModelTier>>,
        unavailable: Vec<ModelTier>,
        fail: bool,
    }

    #[async_trait]
    impl TaskRunner for ScriptedRunner {
        async fn run(
            &self,
            tier: ModelTier,
            request: &TaskRequest,
        ) -> Result<TaskOutput, RunnerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tiers.lock().unwrap().push(tier);
            if self.unavailable.contains(&tier) {
                return Err(RunnerError::ModelUnavailable(tier));
            }
            if self.fail {
                return Err(anyhow::anyhow!("agent crashed").into());
            }
            Ok(TaskOutput {
                result: serde_json::json!({ "spec": request.spec, "tier": tier }),
                tokens_in: request.profile.context_tokens,
                tokens_out: request.profile.expected_output_tokens,
            })
        }
    }

    fn session(limit: Option<f64>) -> SessionCore {
        let prices = PriceTable::default();
        let budget = Arc::new(BudgetEnforcer::new(BudgetPeriod::Session, limit));
        SessionCore::new(
            Interceptor::default(),
            Arc::new(MetricsCollector::new("session-test", prices.clone(), ModelTier::Sonnet)),
            Arc::new(CacheManager::new(
                CacheConfig::default(),
                CostEstimator::new(prices.clone()),
            )),
            CostOptimizer::new(prices, SelectionPolicy::default(), budget),
        )
        .unwrap()
    }

    fn request(spec: &str, complexity: f64) -> TaskRequest {
        TaskRequest {
            spec: spec.to_string(),
            context: ProjectContext::new().with_file("src/app.js", "v1"),
            profile: TaskProfile {
                complexity_score: complexity,
                context_tokens: 10_000,
                expected_output_tokens: 2_000,
            },
        }
    }

    #[tokio::test]
    async fn test_second_run_served_from_cache() {
        let session = session(Some(10.0));
        let runner = ScriptedRunner::default();
        let task = request("Add login button", 0.2);

        let first = session.run_task(&runner, &task).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.tier, Some(ModelTier::Haiku));
        assert!(first.cost > 0.0);

        let second = session.run_task(&runner, &task).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.result, first.result);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);

        let report = session.report();
        assert!((report.cache_savings - first.cost).abs() < 1e-9);
        assert!((report.budget.spent - first.cost).abs() < 1e-6);
        assert_eq!(report.budget.reserved, 0.0);
    }

    #[tokio::test]
    async fn test_changed_project_context_reruns() {
        let session = session(None);
        let runner = ScriptedRunner::default();
        let task = request("Add login button", 0.2);
        session.run_task(&runner, &task).await.unwrap();

        let mut changed = task.clone();
        changed.context = changed.context.with_file("src/app.js", "v2");
        let outcome = session.run_task(&runner, &changed).await.unwrap();
        assert!(!outcome.cached);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_simple_tasks_save_against_sonnet() {
        let session = session(None);
        let runner = ScriptedRunner::default();

        let mut total_cost = 0.0;
        let mut total_saved = 0.0;
        for i in 0..5 {
            let outcome = session
                .run_task(&runner, &request(&format!("simple task {i}"), 0.2))
                .await
                .unwrap();
            total_cost += outcome.cost;
            total_saved += outcome.savings_vs_baseline;
        }

        // Haiku is over 80% cheaper than Sonnet for the same tokens
        let baseline = total_cost + total_saved;
        assert!(total_saved / baseline > 0.8);
    }

    #[tokio::test]
    async fn test_budget_exceeded_skips_runner() {
        let session = session(Some(0.0001));
        let runner = ScriptedRunner::default();

        let err = session
            .run_task(&runner, &request("Refactor auth", 0.5))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Budget(BudgetError::Exceeded { .. })));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);

        let status = session.report().budget;
        assert_eq!(status.reserved, 0.0);
        assert_eq!(status.spent, 0.0);
    }

    #[tokio::test]
    async fn test_tight_budget_downgrades_to_cheaper_tier() {
        // Sonnet would cost $0.06 for this task, Haiku $0.005
        let session = session(Some(0.01));
        let runner = ScriptedRunner::default();

        let outcome = session
            .run_task(&runner, &request("Refactor auth", 0.5))
            .await
            .unwrap();
        assert_eq!(outcome.tier, Some(ModelTier::Haiku));
        assert_eq!(outcome.downgraded_from, Some(ModelTier::Sonnet));
        assert_eq!(*runner.tiers.lock().unwrap(), vec![ModelTier::Haiku]);

        let status = session.report().budget;
        assert!((status.spent - 0.005).abs() < 1e-9);
        assert_eq!(status.reserved, 0.0);
    }

    #[tokio::test]
    async fn test_ample_budget_keeps_planned_tier() {
        let session = session(Some(10.0));
        let runner = ScriptedRunner::default();

        let outcome = session
            .run_task(&runner, &request("Refactor auth", 0.5))
            .await
            .unwrap();
        assert_eq!(outcome.tier, Some(ModelTier::Sonnet));
        assert_eq!(outcome.downgraded_from, None);
    }

    #[tokio::test]
    async fn test_runner_failure_releases_reservation() {
        let session = session(Some(10.0));
        let runner = ScriptedRunner {
            fail: true,
            ..Default::default()
        };

        let err = session
            .run_task(&runner, &request("Add OAuth2", 0.5))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Runner { tier: ModelTier::Sonnet, .. }));

        let status = session.report().budget;
        assert_eq!(status.reserved, 0.0);
        assert_eq!(status.spent, 0.0);
        assert_eq!(status.outstanding_reservations, 0);
        assert_eq!(session.cache().stats(CacheTier::Analysis).entries, 0);
    }

    #[tokio::test]
    async fn test_unavailable_model_falls_back() {
        let session = session(Some(10.0));
        let runner = ScriptedRunner {
            unavailable: vec![ModelTier::Haiku],
            ..Default::default()
        };

        let outcome = session
            .run_task(&runner, &request("List files", 0.1))
            .await
            .unwrap();
        assert_eq!(outcome.tier, Some(ModelTier::Sonnet));
        assert_eq!(
            *runner.tiers.lock().unwrap(),
            vec![ModelTier::Haiku, ModelTier::Sonnet]
        );
        assert_eq!(session.report().budget.reserved, 0.0);
    }

    #[tokio::test]
    async fn test_every_model_unavailable() {
        let session = session(None);
        let runner = ScriptedRunner {
            unavailable: ModelTier::ALL.to_vec(),
            ..Default::default()
        };

        let err = session
            .run_task(&runner, &request("Anything", 0.1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Selection(SelectionError::NoTierAvailable)
        ));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_messages_reach_metrics() {
        let session = session(None);
        session.dispatch(Message::user("Analyze the spec").with_token_count(1_000));
        session.dispatch(Message::assistant("Progress: 50%").with_token_count(200));
        session.interceptor().flush().await;

        let snapshot = session.snapshot();
        assert_eq!(snapshot.message_count, 2);
        assert_eq!(snapshot.progress_percent, 50.0);

        let statuses = session.shutdown().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].name, "metrics");
        assert_eq!(statuses[0].delivered, 2);
    }

    #[tokio::test]
    async fn test_from_config_persists_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ConfigBuilder::new().budget_limit(5.0).build();
        config.cache.snapshot_path = Some(dir.path().join("cache.json"));

        let runner = ScriptedRunner::default();
        let task = request("Add rate limiting", 0.2);

        let first = SessionCore::from_config("first", &config).unwrap();
        first.run_task(&runner, &task).await.unwrap();
        first.shutdown().await;

        let second = SessionCore::from_config("second", &config).unwrap();
        let outcome = second.run_task(&runner, &task).await.unwrap();
        assert!(outcome.cached);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_from_config_persists_budget_spend() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ConfigBuilder::new()
            .budget_limit(5.0)
            .budget_period(BudgetPeriod::Session)
            .build();
        config.budget.ledger_path = Some(dir.path().join("ledger.json"));
        let runner = ScriptedRunner::default();

        let first = SessionCore::from_config("first", &config).unwrap();
        let spent = first
            .run_task(&runner, &request("Add rate limiting", 0.2))
            .await
            .unwrap()
            .cost;
        first.shutdown().await;

        let second = SessionCore::from_config("second", &config).unwrap();
        assert!((second.report().budget.spent - spent).abs() < 1e-6);
        second
            .run_task(&runner, &request("Add audit log", 0.2))
            .await
            .unwrap();
        assert!((second.report().budget.spent - 2.0 * spent).abs() < 1e-6);
    }
}
