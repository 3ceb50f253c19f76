//! Speculative execution: while the current target is slow to answer an
//! idempotent request, fire the same request at the next host in the plan
//! and take whichever response lands first.

use futures::{
    future::FutureExt,
    stream::{FuturesUnordered, StreamExt},
};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{trace_span, Instrument};

use crate::errors::RequestAttemptError;

/// Decides whether and when to launch speculative attempts for an
/// idempotent request.
pub trait SpeculativeExecutionPolicy: std::fmt::Debug + Send + Sync {
    /// The maximum number of speculative executions launched for a single
    /// request, not counting the initial attempt. Zero disables speculation.
    fn max_speculative_executions(&self) -> usize;

    /// The delay between consecutive execution launches.
    fn delay(&self) -> Duration;
}

/// Launches up to a fixed number of speculative executions, separated by a
/// constant delay.
#[derive(Debug, Clone)]
pub struct SimpleSpeculativeExecutionPolicy {
    pub max_speculative_executions: usize,
    pub delay: Duration,
}

impl SpeculativeExecutionPolicy for SimpleSpeculativeExecutionPolicy {
    fn max_speculative_executions(&self) -> usize {
        self.max_speculative_executions
    }

    fn delay(&self) -> Duration {
        self.delay
    }
}

/// The terminal state of one execution fiber walking the shared query plan.
#[derive(Debug)]
pub(crate) enum AttemptOutcome<ResT> {
    /// A response was received; the request is done.
    Completed(ResT),
    /// An attempt failed and the retry policy refused to continue.
    Terminal(SocketAddr, RequestAttemptError),
    /// The fiber ran out of hosts; carries the last error seen per host.
    Exhausted(Vec<(SocketAddr, RequestAttemptError)>),
}

impl<ResT> AttemptOutcome<ResT> {
    /// Whether a sibling fiber running against a different host could still
    /// produce a better outcome than this one.
    fn can_be_ignored(&self) -> bool {
        match self {
            AttemptOutcome::Completed(_) => false,
            AttemptOutcome::Terminal(_, error) => error.can_speculative_retry(),
            // The plan is shared, so a sibling will exhaust it too; still,
            // already-running siblings may yet succeed.
            AttemptOutcome::Exhausted(_) => true,
        }
    }
}

/// Runs the initial fiber immediately and launches one speculative sibling
/// per policy tick until either a non-ignorable outcome arrives or
/// everything failed. The first completed response wins; later ones are
/// discarded together with their fibers.
pub(crate) async fn execute<ResT, QueryFut>(
    policy: &dyn SpeculativeExecutionPolicy,
    mut fiber_generator: impl FnMut(bool) -> QueryFut,
) -> AttemptOutcome<ResT>
where
    QueryFut: Future<Output = AttemptOutcome<ResT>>,
{
    let mut remaining = policy.max_speculative_executions();
    let delay = policy.delay();

    let mut async_tasks = FuturesUnordered::new();
    async_tasks.push(
        fiber_generator(false)
            .instrument(trace_span!("Speculative execution: original request"))
            .fuse(),
    );

    let sleep = tokio::time::sleep(delay).fuse();
    tokio::pin!(sleep);

    let mut last_terminal: Option<AttemptOutcome<ResT>> = None;
    let mut exhausted_errors: Vec<(SocketAddr, RequestAttemptError)> = Vec::new();
    let mut saw_exhausted = false;

    loop {
        futures::select! {
            _ = &mut sleep => {
                if remaining > 0 {
                    async_tasks.push(
                        fiber_generator(true)
                            .instrument(trace_span!("Speculative execution", remaining = remaining))
                            .fuse(),
                    );
                    remaining -= 1;
                    sleep.set(tokio::time::sleep(delay).fuse());
                }
            }
            outcome = async_tasks.select_next_some() => {
                if !outcome.can_be_ignored() {
                    return outcome;
                }
                match outcome {
                    AttemptOutcome::Exhausted(errors) => {
                        exhausted_errors.extend(errors);
                        saw_exhausted = true;
                        // The plan is dry; starting more fibers is pointless,
                        // but the ones already running may still win.
                        remaining = 0;
                    }
                    other => last_terminal = Some(other),
                }
                if async_tasks.is_empty() && remaining == 0 {
                    return if saw_exhausted {
                        AttemptOutcome::Exhausted(exhausted_errors)
                    } else {
                        last_terminal.expect("at least one fiber must have completed")
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // These tests run with a paused clock on a current-thread runtime, so
    // sleeps advance virtual time deterministically.

    use super::*;
    use crate::errors::RequestAttemptError;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[derive(Debug)]
    struct NeverSettled;

    fn ignorable_outcome() -> AttemptOutcome<NeverSettled> {
        AttemptOutcome::Terminal(
            "127.0.0.1:9042".parse().unwrap(),
            RequestAttemptError::UnableToAllocStreamId,
        )
    }

    fn policy(max: usize, delay_secs: u64) -> SimpleSpeculativeExecutionPolicy {
        SimpleSpeculativeExecutionPolicy {
            max_speculative_executions: max,
            delay: Duration::from_secs(delay_secs),
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn all_fibers_ignorable_returns_last_error() {
        let policy = policy(3, 1);
        let generator = |_is_speculative: bool| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            ignorable_outcome()
        };

        let now = tokio::time::Instant::now();
        let outcome = execute(&policy, generator).await;
        assert_matches!(
            outcome,
            AttemptOutcome::Terminal(_, RequestAttemptError::UnableToAllocStreamId)
        );
        // Fibers start at t, t+1, t+2, t+3; each sleeps 5s; the last one
        // finishes at t+8.
        assert_eq!(
            tokio::time::Instant::now(),
            now.checked_add(Duration::from_secs(8)).unwrap()
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn exhausted_plan_stops_spawning() {
        let policy = policy(5, 1);
        let mut counter = 0;
        let generator = move |_is_speculative: bool| {
            let fiber_idx = counter;
            counter += 1;
            async move {
                match fiber_idx {
                    // First fiber hangs for a while, then fails ignorably.
                    0 => {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        ignorable_outcome()
                    }
                    // Second fiber finds the plan empty immediately.
                    1 => AttemptOutcome::Exhausted(Vec::new()),
                    _ => panic!("no further fibers should be started"),
                }
            }
        };

        let outcome = execute(&policy, generator).await;
        // The exhausted plan wins over the later ignorable error.
        assert_matches!(outcome, AttemptOutcome::Exhausted(_));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn first_success_wins() {
        let policy = policy(1, 1);
        let mut counter = 0;
        let generator = move |_is_speculative: bool| {
            let fiber_idx = counter;
            counter += 1;
            async move {
                match fiber_idx {
                    0 => {
                        // Slow primary attempt.
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        AttemptOutcome::Completed(0_u32)
                    }
                    _ => {
                        // Speculative sibling answers quickly.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        AttemptOutcome::Completed(1_u32)
                    }
                }
            }
        };

        let now = tokio::time::Instant::now();
        let outcome = execute(&policy, generator).await;
        assert_matches!(outcome, AttemptOutcome::Completed(1));
        // Sibling started at t+1s and answered 100ms later.
        assert_eq!(
            tokio::time::Instant::now(),
            now.checked_add(Duration::from_millis(1100)).unwrap()
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn terminal_error_short_circuits() {
        let policy = policy(3, 1);
        let generator = |_is_speculative: bool| async {
            AttemptOutcome::<NeverSettled>::Terminal(
                "127.0.0.1:9042".parse().unwrap(),
                RequestAttemptError::DbError(
                    corvus_cql::DbError::SyntaxError,
                    "syntax".to_owned(),
                ),
            )
        };

        let outcome = execute(&policy, generator).await;
        assert_matches!(
            outcome,
            AttemptOutcome::Terminal(_, RequestAttemptError::DbError(corvus_cql::DbError::SyntaxError, _))
        );
    }
}
