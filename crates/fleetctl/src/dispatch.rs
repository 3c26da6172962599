//! Concurrent fan-out of per-unit work with a join barrier.
//!
//! A broadcast spawns one worker per unit onto a [`JoinSet`] and returns only
//! once every worker has finished. Workers never touch shared state: each one
//! returns its unit's result, and the caller merges them after the join.
//!
//! Every attempt is bounded by a timeout so a stalled unit cannot hold the
//! fleet hostage, and transient failures can be retried with exponential
//! backoff.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::backend::{UnitError, UnitResult};
use crate::unit::UnitAddress;

/// Timeout and retry settings applied to every unit in a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    /// Upper bound on a single attempt.
    pub timeout: Duration,
    /// Total attempts per unit, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub backoff: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_attempts: 1,
            backoff: Duration::from_millis(100),
        }
    }
}

impl DispatchPolicy {
    /// Same policy with a different per-attempt timeout.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    /// Delay to wait after `attempt` failed.
    #[must_use]
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1 << exponent)
    }
}

/// Per-unit arguments for a keyed broadcast.
#[derive(Debug, Clone)]
pub enum Args<A> {
    /// A distinct argument for each unit.
    PerUnit(BTreeMap<UnitAddress, A>),
    /// The same argument for every unit.
    Shared(A),
}

impl<A: Clone> Args<A> {
    /// The argument destined for `unit`, if one exists.
    #[must_use]
    pub fn for_unit(&self, unit: &UnitAddress) -> Option<A> {
        match self {
            Self::PerUnit(map) => map.get(unit).cloned(),
            Self::Shared(arg) => Some(arg.clone()),
        }
    }
}

/// Why a unit failed during a broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitFailureKind {
    /// The unit reported an error.
    Rejected(UnitError),
    /// The last attempt did not finish in time.
    TimedOut(Duration),
    /// A keyed broadcast had no argument for this unit.
    MissingArgument,
    /// The worker died before producing a result.
    Aborted(String),
}

impl fmt::Display for UnitFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(err) => write!(f, "{err}"),
            Self::TimedOut(after) => write!(f, "timed out after {}ms", after.as_millis()),
            Self::MissingArgument => write!(f, "no argument supplied"),
            Self::Aborted(reason) => write!(f, "worker aborted: {reason}"),
        }
    }
}

/// A single unit's failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    /// The failed unit.
    pub unit: UnitAddress,
    /// Attempts made before giving up.
    pub attempts: u32,
    /// What went wrong on the last attempt.
    pub kind: UnitFailureKind,
}

impl fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.unit, self.kind)?;
        if self.attempts > 1 {
            write!(f, " (after {} attempts)", self.attempts)?;
        }
        Ok(())
    }
}

/// A broadcast in which at least one unit failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed on {} of {total} units: {}", .failures.len(), summary(.failures))]
pub struct DispatchFailure {
    /// Name of the broadcast operation.
    pub operation: &'static str,
    /// Number of units targeted.
    pub total: usize,
    /// Units that completed successfully, in address order.
    pub completed: Vec<UnitAddress>,
    /// One entry per failed unit, in address order.
    pub failures: Vec<UnitFailure>,
}

fn summary(failures: &[UnitFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl DispatchFailure {
    /// The failure recorded for `unit`, if it failed.
    #[must_use]
    pub fn failure_for(&self, unit: &UnitAddress) -> Option<&UnitFailure> {
        self.failures.iter().find(|f| &f.unit == unit)
    }

    /// Check if any unit timed out.
    #[must_use]
    pub fn has_timeouts(&self) -> bool {
        self.failures
            .iter()
            .any(|f| matches!(f.kind, UnitFailureKind::TimedOut(_)))
    }
}

/// Runs broadcasts under a [`DispatchPolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Dispatcher {
    policy: DispatchPolicy,
}

impl Dispatcher {
    /// Create a dispatcher with the given policy.
    #[must_use]
    pub fn new(policy: DispatchPolicy) -> Self {
        Self { policy }
    }

    /// Same dispatcher with a different per-attempt timeout.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self::new(self.policy.with_timeout(timeout))
    }

    /// Invoke `op` once per target and wait for all of them.
    ///
    /// # Errors
    ///
    /// Returns a [`DispatchFailure`] listing every unit that failed. Units
    /// that succeeded are listed in [`DispatchFailure::completed`].
    pub async fn broadcast_uniform<L, T, F, Fut>(
        &self,
        operation: &'static str,
        targets: BTreeMap<UnitAddress, L>,
        op: F,
    ) -> Result<BTreeMap<UnitAddress, T>, DispatchFailure>
    where
        L: Clone + Send + 'static,
        T: Send + 'static,
        F: Fn(L) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = UnitResult<T>> + Send + 'static,
    {
        let inputs = targets
            .into_iter()
            .map(|(unit, target)| (unit, Some(target)))
            .collect();
        self.run(operation, inputs, op).await
    }

    /// Invoke `op` once per target with that unit's argument and wait for all
    /// of them.
    ///
    /// A target with no matching entry in `args` is reported as
    /// [`UnitFailureKind::MissingArgument`] and never invoked.
    ///
    /// # Errors
    ///
    /// Returns a [`DispatchFailure`] listing every unit that failed.
    pub async fn broadcast_keyed<L, A, T, F, Fut>(
        &self,
        operation: &'static str,
        targets: BTreeMap<UnitAddress, L>,
        args: Args<A>,
        op: F,
    ) -> Result<BTreeMap<UnitAddress, T>, DispatchFailure>
    where
        L: Clone + Send + 'static,
        A: Clone + Send + 'static,
        T: Send + 'static,
        F: Fn(L, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = UnitResult<T>> + Send + 'static,
    {
        let inputs = targets
            .into_iter()
            .map(|(unit, target)| {
                let input = args.for_unit(&unit).map(|arg| (target, arg));
                (unit, input)
            })
            .collect();
        self.run(operation, inputs, move |(target, arg)| op(target, arg))
            .await
    }

    async fn run<I, T, F, Fut>(
        &self,
        operation: &'static str,
        inputs: Vec<(UnitAddress, Option<I>)>,
        op: F,
    ) -> Result<BTreeMap<UnitAddress, T>, DispatchFailure>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = UnitResult<T>> + Send + 'static,
    {
        let started = Instant::now();
        let op = Arc::new(op);
        let policy = self.policy;

        let mut pending = BTreeSet::new();
        let mut failures = Vec::new();
        let mut workers = JoinSet::new();

        for (unit, input) in inputs {
            let Some(input) = input else {
                failures.push(UnitFailure {
                    unit,
                    attempts: 0,
                    kind: UnitFailureKind::MissingArgument,
                });
                continue;
            };

            pending.insert(unit.clone());
            let op = Arc::clone(&op);
            workers.spawn(async move {
                let outcome = attempt_unit(operation, &unit, policy, input, op.as_ref()).await;
                (unit, outcome)
            });
        }

        let total = pending.len() + failures.len();
        let mut completed = BTreeMap::new();

        // Join every worker before looking at the outcome
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((unit, Ok(value))) => {
                    pending.remove(&unit);
                    completed.insert(unit, value);
                }
                Ok((unit, Err(failure))) => {
                    pending.remove(&unit);
                    failures.push(failure);
                }
                Err(join_err) => {
                    warn!(operation, error = %join_err, "Dispatch worker aborted");
                }
            }
        }

        // Whatever is still pending belongs to a worker that never reported
        for unit in pending {
            failures.push(UnitFailure {
                unit,
                attempts: 0,
                kind: UnitFailureKind::Aborted("worker panicked or was cancelled".to_string()),
            });
        }

        debug!(
            operation,
            units = total,
            failed = failures.len(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Broadcast joined"
        );

        if failures.is_empty() {
            return Ok(completed);
        }

        failures.sort_by(|a, b| a.unit.cmp(&b.unit));
        Err(DispatchFailure {
            operation,
            total,
            completed: completed.into_keys().collect(),
            failures,
        })
    }
}

async fn attempt_unit<I, T, F, Fut>(
    operation: &'static str,
    unit: &UnitAddress,
    policy: DispatchPolicy,
    input: I,
    op: &F,
) -> Result<T, UnitFailure>
where
    I: Clone,
    F: Fn(I) -> Fut,
    Fut: Future<Output = UnitResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let outcome = tokio::time::timeout(policy.timeout, op(input.clone())).await;
        let (kind, retryable) = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => {
                let retryable = err.is_transient();
                (UnitFailureKind::Rejected(err), retryable)
            }
            Err(_) => (UnitFailureKind::TimedOut(policy.timeout), true),
        };

        warn!(
            operation,
            unit = %unit,
            attempt,
            max_attempts,
            error = %kind,
            "Unit command failed"
        );

        if !retryable || attempt >= max_attempts {
            return Err(UnitFailure {
                unit: unit.clone(),
                attempts: attempt,
                kind,
            });
        }

        tokio::time::sleep(policy.backoff_after(attempt)).await;
        attempt += 1;
    }
}
