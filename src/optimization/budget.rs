//! Spend control with reserve / commit / release semantics
//!
//! Amounts are tracked internally in integer micro-dollars so the
//! `reserved + spent <= limit` check never suffers from float drift.

use crate::config::BudgetSettings;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

const MICROS_PER_USD: f64 = 1_000_000.0;
const LEDGER_VERSION: u32 = 1;

fn to_micros(usd: f64) -> i64 {
    (usd * MICROS_PER_USD).round() as i64
}

fn to_usd(micros: i64) -> f64 {
    micros as f64 / MICROS_PER_USD
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BudgetError {
    #[error("budget exceeded for period {period_id}: requested ${requested:.4}, available ${available:.4}")]
    Exceeded {
        period_id: String,
        requested: f64,
        available: f64,
    },

    #[error("invalid amount: {0}")]
    InvalidAmount(f64),

    #[error("reservation {0} is not outstanding")]
    UnknownReservation(u64),
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("budget ledger I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("budget ledger is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unsupported budget ledger version {0}")]
    UnsupportedVersion(u32),
}

/// Accounting window boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    #[default]
    Daily,
    Weekly,
    Monthly,
    /// One period for the lifetime of the process
    Session,
}

impl BudgetPeriod {
    pub fn period_id(&self, now: DateTime<Utc>) -> String {
        match self {
            BudgetPeriod::Daily => now.format("%Y-%m-%d").to_string(),
            BudgetPeriod::Weekly => {
                let week = now.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            BudgetPeriod::Monthly => now.format("%Y-%m").to_string(),
            BudgetPeriod::Session => "session".to_string(),
        }
    }
}

/// A period's budget as plain data
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Budget {
    pub period_id: String,
    pub limit: Option<f64>,
    pub reserved: f64,
    pub spent: f64,
}

/// Proof of a successful reservation. Consumed by commit or release.
#[derive(Debug)]
#[must_use = "a reservation must be committed or released"]
pub struct ReservationToken {
    id: u64,
    period_id: String,
    amount: f64,
}

impl ReservationToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn period_id(&self) -> &str {
        &self.period_id
    }

    pub fn amount(&self) -> f64 {
        self.amount
    }
}

/// Result of settling a reservation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitOutcome {
    pub period_id: String,
    pub reserved: f64,
    pub actual: f64,
    /// Set when the commit pushed the period past its limit
    pub over_budget_by: Option<f64>,
}

impl CommitOutcome {
    pub fn is_over_budget(&self) -> bool {
        self.over_budget_by.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub period_id: String,
    pub limit: Option<f64>,
    pub reserved: f64,
    pub spent: f64,
    pub remaining: Option<f64>,
    pub percent_used: f64,
    pub outstanding_reservations: usize,
    pub over_budget_events: u64,
}

impl fmt::Display for BudgetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Budget: {} ===", self.period_id)?;
        match (self.limit, self.remaining) {
            (Some(limit), Some(remaining)) => {
                writeln!(f, "Limit: ${:.4}", limit)?;
                writeln!(f, "Remaining: ${:.4}", remaining)?;
            }
            _ => writeln!(f, "Limit: unlimited")?,
        }
        writeln!(f, "Spent: ${:.4} ({:.1}%)", self.spent, self.percent_used)?;
        writeln!(f, "Reserved: ${:.4}", self.reserved)?;
        writeln!(f, "Outstanding reservations: {}", self.outstanding_reservations)?;
        writeln!(f, "Over-budget events: {}", self.over_budget_events)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct PeriodLedger {
    limit: Option<i64>,
    reserved: i64,
    spent: i64,
    over_budget_events: u64,
}

impl PeriodLedger {
    fn new(limit: Option<i64>) -> Self {
        Self {
            limit,
            reserved: 0,
            spent: 0,
            over_budget_events: 0,
        }
    }

    fn available(&self) -> Option<i64> {
        self.limit.map(|limit| limit - self.reserved - self.spent)
    }
}

#[derive(Debug)]
struct Outstanding {
    period_id: String,
    amount: i64,
    reserved_at: Instant,
}

#[derive(Debug)]
struct LedgerState {
    default_limit: Option<i64>,
    periods: HashMap<String, PeriodLedger>,
    outstanding: HashMap<u64, Outstanding>,
    /// Reservations reclaimed by TTL whose holder may still settle them
    reclaimed: HashMap<u64, String>,
    next_id: u64,
}

impl LedgerState {
    fn period_mut(&mut self, period_id: &str) -> &mut PeriodLedger {
        let default_limit = self.default_limit;
        self.periods
            .entry(period_id.to_string())
            .or_insert_with(|| PeriodLedger::new(default_limit))
    }

    fn reclaim_older_than(&mut self, ttl: Duration) -> usize {
        let stale: Vec<u64> = self
            .outstanding
            .iter()
            .filter(|(_, r)| r.reserved_at.elapsed() > ttl)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            if let Some(reservation) = self.outstanding.remove(id) {
                let ledger = self.period_mut(&reservation.period_id);
                ledger.reserved = (ledger.reserved - reservation.amount).max(0);
                warn!(
                    "Reclaimed stale reservation {} (${:.4}) in {}",
                    id,
                    to_usd(reservation.amount),
                    reservation.period_id
                );
                self.reclaimed.insert(*id, reservation.period_id);
            }
        }
        stale.len()
    }
}

/// On-disk form of one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PeriodRecord {
    period_id: String,
    limit: Option<f64>,
    spent: f64,
    #[serde(default)]
    over_budget_events: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    saved_at: DateTime<Utc>,
    periods: Vec<PeriodRecord>,
}

/// Enforces a per-period spend ceiling under concurrent callers
#[derive(Debug)]
pub struct BudgetEnforcer {
    period: BudgetPeriod,
    reservation_ttl: Option<Duration>,
    state: Mutex<LedgerState>,
}

impl BudgetEnforcer {
    /// `limit` of `None` means unlimited spend
    pub fn new(period: BudgetPeriod, limit: Option<f64>) -> Self {
        Self {
            period,
            reservation_ttl: None,
            state: Mutex::new(LedgerState {
                default_limit: limit.map(to_micros),
                periods: HashMap::new(),
                outstanding: HashMap::new(),
                reclaimed: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    pub fn from_settings(settings: &BudgetSettings) -> Self {
        let mut enforcer = Self::new(settings.period, settings.limit_per_period);
        enforcer.reservation_ttl = settings.reservation_ttl_secs.map(Duration::from_secs);
        enforcer
    }

    /// Reservations older than `ttl` become reclaimable
    pub fn with_reservation_ttl(mut self, ttl: Duration) -> Self {
        self.reservation_ttl = Some(ttl);
        self
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Budget ledger lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn period(&self) -> BudgetPeriod {
        self.period
    }

    pub fn current_period_id(&self) -> String {
        self.period.period_id(Utc::now())
    }

    /// Atomically reserve `amount` against the period's limit.
    ///
    /// Stale reservations are reclaimed first when a reservation TTL is set.
    pub fn reserve(&self, period_id: &str, amount: f64) -> Result<ReservationToken, BudgetError> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(BudgetError::InvalidAmount(amount));
        }
        let micros = to_micros(amount);

        let mut state = self.lock();
        if let Some(ttl) = self.reservation_ttl {
            state.reclaim_older_than(ttl);
        }
        let ledger = state.period_mut(period_id);

        if let Some(available) = ledger.available() {
            if micros > available {
                debug!(
                    "Rejected reservation of ${:.4} in {} (${:.4} available)",
                    amount,
                    period_id,
                    to_usd(available.max(0))
                );
                return Err(BudgetError::Exceeded {
                    period_id: period_id.to_string(),
                    requested: amount,
                    available: to_usd(available.max(0)),
                });
            }
        }
        ledger.reserved += micros;

        let id = state.next_id;
        state.next_id += 1;
        state.outstanding.insert(
            id,
            Outstanding {
                period_id: period_id.to_string(),
                amount: micros,
                reserved_at: Instant::now(),
            },
        );

        Ok(ReservationToken {
            id,
            period_id: period_id.to_string(),
            amount: to_usd(micros),
        })
    }

    /// Reserve against the current period
    pub fn reserve_current(&self, amount: f64) -> Result<ReservationToken, BudgetError> {
        self.reserve(&self.current_period_id(), amount)
    }

    /// Move a reservation into spend, recording the actual amount in full.
    ///
    /// If `actual` is not a valid amount the reservation is released and
    /// nothing is spent. A reservation already reclaimed by TTL still
    /// records its spend; only its hold on the budget is gone.
    pub fn commit(
        &self,
        token: ReservationToken,
        actual: f64,
    ) -> Result<CommitOutcome, BudgetError> {
        if !actual.is_finite() || actual < 0.0 {
            self.release(token)?;
            return Err(BudgetError::InvalidAmount(actual));
        }
        let actual_micros = to_micros(actual);

        let mut state = self.lock();
        let reservation = match state.outstanding.remove(&token.id) {
            Some(reservation) => reservation,
            None => {
                let period_id = state
                    .reclaimed
                    .remove(&token.id)
                    .ok_or(BudgetError::UnknownReservation(token.id))?;
                warn!(
                    "Committing reclaimed reservation {} in {}",
                    token.id, period_id
                );
                // Its hold was already returned to the period
                Outstanding {
                    period_id,
                    amount: 0,
                    reserved_at: Instant::now(),
                }
            }
        };

        let ledger = state.period_mut(&reservation.period_id);
        ledger.reserved = (ledger.reserved - reservation.amount).max(0);
        ledger.spent += actual_micros;

        let over_budget_by = ledger
            .limit
            .map(|limit| ledger.spent + ledger.reserved - limit)
            .filter(|over| *over > 0)
            .map(to_usd);

        if let Some(over) = over_budget_by {
            ledger.over_budget_events += 1;
            warn!(
                "Period {} over budget by ${:.4} (reserved ${:.4}, actual ${:.4})",
                reservation.period_id,
                over,
                token.amount,
                actual
            );
        }

        Ok(CommitOutcome {
            period_id: reservation.period_id,
            reserved: token.amount,
            actual,
            over_budget_by,
        })
    }

    /// Return a reservation to the available budget without spending
    pub fn release(&self, token: ReservationToken) -> Result<(), BudgetError> {
        let mut state = self.lock();
        let Some(reservation) = state.outstanding.remove(&token.id) else {
            return match state.reclaimed.remove(&token.id) {
                Some(_) => Ok(()),
                None => Err(BudgetError::UnknownReservation(token.id)),
            };
        };

        let ledger = state.period_mut(&reservation.period_id);
        ledger.reserved = (ledger.reserved - reservation.amount).max(0);
        debug!(
            "Released ${:.4} in {}",
            to_usd(reservation.amount),
            reservation.period_id
        );
        Ok(())
    }

    /// Release reservations held longer than the reservation TTL
    pub fn reclaim_stale_reservations(&self) -> usize {
        let Some(ttl) = self.reservation_ttl else {
            return 0;
        };

        self.lock().reclaim_older_than(ttl)
    }

    /// Whether `amount` could be reserved right now
    pub fn check_available(&self, period_id: &str, amount: f64) -> bool {
        let state = self.lock();
        let available = match state.periods.get(period_id) {
            Some(ledger) => ledger.available(),
            None => state.default_limit,
        };
        available.map_or(true, |available| to_micros(amount) <= available)
    }

    /// Change the limit for new periods and every tracked period
    pub fn set_limit(&self, limit: Option<f64>) {
        let micros = limit.map(to_micros);
        let mut state = self.lock();
        state.default_limit = micros;
        for ledger in state.periods.values_mut() {
            ledger.limit = micros;
        }
        info!("Budget limit set to {:?}", limit);
    }

    pub fn budget(&self, period_id: &str) -> Budget {
        let state = self.lock();
        match state.periods.get(period_id) {
            Some(ledger) => Budget {
                period_id: period_id.to_string(),
                limit: ledger.limit.map(to_usd),
                reserved: to_usd(ledger.reserved),
                spent: to_usd(ledger.spent),
            },
            None => Budget {
                period_id: period_id.to_string(),
                limit: state.default_limit.map(to_usd),
                reserved: 0.0,
                spent: 0.0,
            },
        }
    }

    pub fn status(&self, period_id: &str) -> BudgetStatus {
        let state = self.lock();
        let ledger = state
            .periods
            .get(period_id)
            .cloned()
            .unwrap_or_else(|| PeriodLedger::new(state.default_limit));
        let outstanding = state
            .outstanding
            .values()
            .filter(|r| r.period_id == period_id)
            .count();

        let percent_used = match ledger.limit {
            Some(limit) if limit > 0 => ledger.spent as f64 / limit as f64 * 100.0,
            _ => 0.0,
        };

        BudgetStatus {
            period_id: period_id.to_string(),
            limit: ledger.limit.map(to_usd),
            reserved: to_usd(ledger.reserved),
            spent: to_usd(ledger.spent),
            remaining: ledger.available().map(|a| to_usd(a.max(0))),
            percent_used,
            outstanding_reservations: outstanding,
            over_budget_events: ledger.over_budget_events,
        }
    }

    /// All tracked periods, oldest id first
    pub fn snapshot(&self) -> Vec<Budget> {
        let state = self.lock();
        let mut budgets: Vec<Budget> = state
            .periods
            .iter()
            .map(|(period_id, ledger)| Budget {
                period_id: period_id.clone(),
                limit: ledger.limit.map(to_usd),
                reserved: to_usd(ledger.reserved),
                spent: to_usd(ledger.spent),
            })
            .collect();
        budgets.sort_by(|a, b| a.period_id.cmp(&b.period_id));
        budgets
    }

    /// Write every period's limit and spend to `path`.
    ///
    /// Outstanding reservations are not persisted.
    pub fn save_to(&self, path: &Path) -> Result<(), LedgerError> {
        let mut periods: Vec<PeriodRecord> = {
            let state = self.lock();
            state
                .periods
                .iter()
                .map(|(period_id, ledger)| PeriodRecord {
                    period_id: period_id.clone(),
                    limit: ledger.limit.map(to_usd),
                    spent: to_usd(ledger.spent),
                    over_budget_events: ledger.over_budget_events,
                })
                .collect()
        };
        periods.sort_by(|a, b| a.period_id.cmp(&b.period_id));

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = LedgerFile {
            version: LEDGER_VERSION,
            saved_at: Utc::now(),
            periods,
        };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
        debug!("Saved budget ledger to {}", path.display());
        Ok(())
    }

    /// Restore periods written by [`save_to`](Self::save_to).
    ///
    /// Restored spend replaces any in-memory spend for the same period.
    /// Returns the number of periods restored.
    pub fn load_from(&self, path: &Path) -> Result<usize, LedgerError> {
        let content = std::fs::read_to_string(path)?;
        let file: LedgerFile = serde_json::from_str(&content)?;
        if file.version != LEDGER_VERSION {
            return Err(LedgerError::UnsupportedVersion(file.version));
        }

        let mut state = self.lock();
        let mut restored = 0;
        for record in file.periods {
            if !record.spent.is_finite() || record.spent < 0.0 {
                warn!(
                    "Skipping period {} with invalid spend {}",
                    record.period_id, record.spent
                );
                continue;
            }
            let ledger = state.period_mut(&record.period_id);
            ledger.limit = record.limit.map(to_micros);
            ledger.spent = to_micros(record.spent);
            ledger.over_budget_events = record.over_budget_events;
            restored += 1;
        }
        info!("Restored {} budget periods from {}", restored, path.display());
        Ok(restored)
    }
}
