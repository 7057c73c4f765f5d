//! Abort budgets
//!
//! The build loop is "never done until done", so termination comes from
//! here: wall clock, cost, generation calls, satisfaction rounds and driver
//! steps are all capped.

use crate::config::BudgetConfig;
use crate::error::{BudgetKind, ForgeError, ForgeResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Tracks spend against [`BudgetConfig`]
#[derive(Debug)]
pub struct BudgetTracker {
    config: BudgetConfig,
    started: Instant,
    cost_usd: Mutex<f64>,
    generation_calls: AtomicU64,
    satisfaction_rounds: AtomicU32,
    driver_steps: AtomicU32,
}

impl BudgetTracker {
    /// Start the clock
    #[must_use]
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            started: Instant::now(),
            cost_usd: Mutex::new(0.0),
            generation_calls: AtomicU64::new(0),
            satisfaction_rounds: AtomicU32::new(0),
            driver_steps: AtomicU32::new(0),
        }
    }

    /// Count one generation call and its cost
    pub fn record_generation(&self, cost_usd: f64) {
        self.generation_calls.fetch_add(1, Ordering::Relaxed);
        *self.cost_usd.lock() += cost_usd.max(0.0);
    }

    /// Check the budgets that can run out mid-phase
    ///
    /// # Errors
    /// [`ForgeError::BudgetExhausted`] naming the first exhausted budget
    pub fn check(&self) -> ForgeResult<()> {
        if let Some(limit) = self.config.max_session_secs {
            if self.started.elapsed() >= Duration::from_secs(limit) {
                return Err(ForgeError::BudgetExhausted(BudgetKind::Time));
            }
        }
        if let Some(limit) = self.config.max_cost_usd {
            if *self.cost_usd.lock() >= limit {
                return Err(ForgeError::BudgetExhausted(BudgetKind::Cost));
            }
        }
        if let Some(limit) = self.config.max_generation_calls {
            if self.generation_calls.load(Ordering::Relaxed) >= limit {
                return Err(ForgeError::BudgetExhausted(BudgetKind::GenerationCalls));
            }
        }
        Ok(())
    }

    /// Count a satisfaction gate failure
    ///
    /// # Errors
    /// [`BudgetKind::SatisfactionRounds`] once the ceiling is passed
    pub fn note_satisfaction_round(&self) -> ForgeResult<u32> {
        let rounds = self.satisfaction_rounds.fetch_add(1, Ordering::Relaxed) + 1;
        if rounds > self.config.max_satisfaction_rounds {
            return Err(ForgeError::BudgetExhausted(BudgetKind::SatisfactionRounds));
        }
        Ok(rounds)
    }

    /// Count a driver iteration
    ///
    /// # Errors
    /// [`BudgetKind::DriverSteps`] once the ceiling is passed
    pub fn note_step(&self) -> ForgeResult<()> {
        let steps = self.driver_steps.fetch_add(1, Ordering::Relaxed) + 1;
        if steps > self.config.max_driver_steps {
            return Err(ForgeError::BudgetExhausted(BudgetKind::DriverSteps));
        }
        Ok(())
    }

    /// Cumulative cost
    #[must_use]
    pub fn cost_usd(&self) -> f64 {
        *self.cost_usd.lock()
    }

    /// Generation calls made
    #[must_use]
    pub fn generation_calls(&self) -> u64 {
        self.generation_calls.load(Ordering::Relaxed)
    }

    /// Satisfaction rounds used
    #[must_use]
    pub fn satisfaction_rounds(&self) -> u32 {
        self.satisfaction_rounds.load(Ordering::Relaxed)
    }

    /// Time since start
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
