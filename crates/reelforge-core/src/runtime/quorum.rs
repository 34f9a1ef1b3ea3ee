//! Partial-success waiting over a fan-out of sibling tasks.
//!
//! The decision logic lives in [`QuorumTracker`], a pure state machine fed
//! one observation per cycle, so the grace-window arithmetic can be tested
//! without timers. [`QuorumWaiter`] drives it: one tick checks every open
//! sibling concurrently, then asks the tracker whether to keep waiting.

use std::time::Duration;

use futures::future::join_all;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::runtime::cancel::CancelToken;
use crate::runtime::poller::poll_once;
use crate::runtime::provider::ProviderClient;
use crate::runtime::state::SessionState;
use crate::runtime::types::{RuntimeError, TaskKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumConfig {
    pub interval: Duration,
    /// Cycles to keep waiting for stragglers after the first success.
    pub min_wait_cycles: u32,
    /// Global cycle budget for the whole fan-out.
    pub max_cycles: u32,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            min_wait_cycles: 12,
            max_cycles: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumDecision {
    Continue,
    /// Enough siblings succeeded; downstream gets the completed subset.
    Proceed,
    /// Nothing succeeded and nothing else can.
    NoQuorum,
}

/// Grace-window bookkeeping for one fan-out.
#[derive(Debug, Clone)]
pub struct QuorumTracker {
    config: QuorumConfig,
    siblings: usize,
    first_success: Option<u32>,
}

impl QuorumTracker {
    pub fn new(config: QuorumConfig, siblings: usize) -> Self {
        Self {
            config,
            siblings,
            first_success: None,
        }
    }

    /// Cycle at which the first sibling was seen completed.
    pub fn first_success(&self) -> Option<u32> {
        self.first_success
    }

    /// Feed the counts observed after `cycle` checks.
    pub fn observe(&mut self, cycle: u32, completed: usize, terminal: usize) -> QuorumDecision {
        if self.siblings == 0 {
            return QuorumDecision::NoQuorum;
        }
        if completed > 0 && self.first_success.is_none() {
            self.first_success = Some(cycle);
        }

        let settle = |completed: usize| {
            if completed > 0 {
                QuorumDecision::Proceed
            } else {
                QuorumDecision::NoQuorum
            }
        };

        if terminal >= self.siblings {
            return settle(completed);
        }
        if let Some(first) = self.first_success {
            if cycle.saturating_sub(first) >= self.config.min_wait_cycles {
                return QuorumDecision::Proceed;
            }
        }
        if cycle >= self.config.max_cycles {
            return settle(completed);
        }
        QuorumDecision::Continue
    }
}

/// Final tally of a quorum wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumOutcome {
    pub decision: QuorumDecision,
    pub completed: Vec<TaskKey>,
    /// Failed siblings, including timed-out stragglers.
    pub failed: Vec<TaskKey>,
    /// Siblings still open when the wait ended; they are failed with a
    /// timeout before the outcome is returned.
    pub stragglers: Vec<TaskKey>,
    pub cycles: u32,
}

#[derive(Debug, Clone)]
pub struct QuorumWaiter {
    state: SessionState,
    config: QuorumConfig,
}

impl QuorumWaiter {
    pub fn new(state: SessionState, config: QuorumConfig) -> Self {
        Self { state, config }
    }

    /// Poll `siblings` until the tracker settles.
    ///
    /// Every sibling must already be accepted by the provider. Returns
    /// [`RuntimeError::Cancelled`] if `cancel` trips between ticks.
    pub async fn wait(
        &self,
        client: &dyn ProviderClient,
        siblings: &[TaskKey],
        cancel: &CancelToken,
    ) -> Result<QuorumOutcome, RuntimeError> {
        let mut tracker = QuorumTracker::new(self.config, siblings.len());
        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycle = 0u32;

        let decision = loop {
            let statuses = self.state.statuses(siblings).await;
            let completed = statuses.iter().filter(|(_, s)| s.is_succeeded()).count();
            let terminal = statuses.iter().filter(|(_, s)| s.is_terminal()).count()
                + (siblings.len() - statuses.len());

            let decision = tracker.observe(cycle, completed, terminal);
            debug!(
                cycle,
                completed,
                terminal,
                siblings = siblings.len(),
                ?decision,
                "quorum check"
            );
            if decision != QuorumDecision::Continue {
                break decision;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                _ = ticker.tick() => {}
            }
            cycle += 1;

            let open: Vec<TaskKey> = statuses
                .iter()
                .filter(|(_, s)| s.is_open())
                .map(|(k, _)| *k)
                .collect();
            let checks = open.iter().map(|key| poll_once(&self.state, client, *key));
            for (key, res) in open.iter().zip(join_all(checks).await) {
                if let Err(e) = res {
                    warn!(task = %key, error = %e, "sibling cannot be polled");
                    self.state.fail(*key, e.to_task_error()).await?;
                }
            }
        };

        let mut outcome = QuorumOutcome {
            decision,
            completed: Vec::new(),
            failed: Vec::new(),
            stragglers: Vec::new(),
            cycles: cycle,
        };
        let statuses = self.state.statuses(siblings).await;
        for (key, status) in statuses {
            if status.is_succeeded() {
                outcome.completed.push(key);
            } else if status.is_open() {
                outcome.stragglers.push(key);
            } else {
                outcome.failed.push(key);
            }
        }
        for key in &outcome.stragglers {
            self.state.time_out(*key).await?;
            outcome.failed.push(*key);
        }

        info!(
            cycles = cycle,
            first_success = ?tracker.first_success(),
            completed = outcome.completed.len(),
            failed = outcome.failed.len(),
            stragglers = outcome.stragglers.len(),
            ?decision,
            "quorum settled"
        );
        Ok(outcome)
    }
}
