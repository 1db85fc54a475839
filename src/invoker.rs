use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::clock::sleep_unless_cancelled;
use crate::config::OnUnknownFailure;
use crate::errors::ProcessError;
use crate::types::{ProcessResult, ProcessUnit, Record};

/// The user override point: an asynchronous record handler.
///
/// Implementations may fan work out internally; the driver awaits the
/// returned future and only then moves to the next unit.
#[async_trait]
pub trait Processor<K, V>: Send + Sync {
    async fn process(
        &self,
        records: Vec<Record<K, V>>,
    ) -> Result<ProcessResult<K, V>, ProcessError>;
}

/// What the driver should do with a finished invocation.
#[derive(Debug)]
pub(crate) enum Outcome<K, V> {
    /// Commit the unit; the result is surfaced to hooks only.
    Success(ProcessResult<K, V>),
    /// Pause consumption and abandon the remainder of the batch.
    Pause {
        reason: String,
        backoff: Option<Duration>,
    },
    /// Stop the runner.
    Fatal(anyhow::Error),
    /// Shutdown observed mid-flight; discard without committing.
    Shutdown,
}

/// Calls the processor for one unit, bounds the wait, and classifies the
/// outcome so the driver can decide policy from data.
pub(crate) struct ProcessInvoker<K, V> {
    processor: Arc<dyn Processor<K, V>>,
    invoke_timeout: Duration,
    delay_single_record: Duration,
    on_unknown: OnUnknownFailure,
}

impl<K, V> ProcessInvoker<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    pub fn new(
        processor: Arc<dyn Processor<K, V>>,
        invoke_timeout: Duration,
        delay_single_record: Duration,
        on_unknown: OnUnknownFailure,
    ) -> Self {
        Self {
            processor,
            invoke_timeout,
            delay_single_record,
            on_unknown,
        }
    }

    pub async fn invoke(
        &self,
        unit: &mut ProcessUnit<K, V>,
        shutdown: &CancellationToken,
    ) -> Outcome<K, V> {
        let records = unit.take_records();
        let expected = records.len();

        if !self.delay_single_record.is_zero() {
            for _ in 0..expected {
                if !sleep_unless_cancelled(self.delay_single_record, shutdown).await {
                    return Outcome::Shutdown;
                }
            }
        }

        let completed = tokio::select! {
            _ = shutdown.cancelled() => return Outcome::Shutdown,
            result = timeout(self.invoke_timeout, self.processor.process(records)) => result,
        };

        match completed {
            Ok(Ok(result)) => {
                if result.records().len() != expected {
                    // the user result is advisory; the unit's own offsets
                    // drive the commit
                    warn!(
                        unit = unit.index(),
                        expected,
                        returned = result.records().len(),
                        "processor returned a different record count"
                    );
                }
                Outcome::Success(result)
            }
            Ok(Err(ProcessError::NeedForPause { reason, backoff })) => {
                Outcome::Pause { reason, backoff }
            }
            Ok(Err(ProcessError::Fatal(cause))) => Outcome::Fatal(cause),
            Ok(Err(ProcessError::Other(cause))) => self.unknown_failure(cause),
            Err(_elapsed) => self.unknown_failure(anyhow!(
                "processor did not complete within {:?}",
                self.invoke_timeout
            )),
        }
    }

    fn unknown_failure(&self, cause: anyhow::Error) -> Outcome<K, V> {
        match self.on_unknown {
            OnUnknownFailure::PauseDefault => {
                warn!("treating handler failure as pause request: {cause:#}");
                Outcome::Pause {
                    reason: cause.to_string(),
                    backoff: None,
                }
            }
            OnUnknownFailure::Fatal => Outcome::Fatal(cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Partition;
    use std::collections::{BTreeSet, HashMap};

    struct Scripted {
        reply: fn(Vec<Record<String, String>>) -> Result<ProcessResult<String, String>, ProcessError>,
    }

    #[async_trait]
    impl Processor<String, String> for Scripted {
        async fn process(
            &self,
            records: Vec<Record<String, String>>,
        ) -> Result<ProcessResult<String, String>, ProcessError> {
            (self.reply)(records)
        }
    }

    struct Stuck;

    #[async_trait]
    impl Processor<String, String> for Stuck {
        async fn process(
            &self,
            _records: Vec<Record<String, String>>,
        ) -> Result<ProcessResult<String, String>, ProcessError> {
            futures::future::pending().await
        }
    }

    fn unit_with(count: usize) -> ProcessUnit<String, String> {
        let partition = Partition::new("events", 0);
        let records = (0..count)
            .map(|offset| {
                Record::new(
                    partition.clone(),
                    offset as i64,
                    None,
                    format!("v{offset}"),
                    0,
                    HashMap::new(),
                )
            })
            .collect();
        ProcessUnit::new(
            0,
            partition.clone(),
            BTreeSet::from([partition.clone()]),
            records,
            HashMap::from([(partition, count as i64)]),
        )
    }

    fn invoker(
        processor: Arc<dyn Processor<String, String>>,
        on_unknown: OnUnknownFailure,
    ) -> ProcessInvoker<String, String> {
        ProcessInvoker::new(
            processor,
            Duration::from_millis(100),
            Duration::ZERO,
            on_unknown,
        )
    }

    #[tokio::test]
    async fn success_passes_the_result_through() {
        let invoker = invoker(
            Arc::new(Scripted {
                reply: |records| Ok(ProcessResult::new(records)),
            }),
            OnUnknownFailure::PauseDefault,
        );
        let mut unit = unit_with(3);
        match invoker.invoke(&mut unit, &CancellationToken::new()).await {
            Outcome::Success(result) => assert_eq!(result.records().len(), 3),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn pause_requests_carry_reason_and_hint() {
        let invoker = invoker(
            Arc::new(Scripted {
                reply: |_| Err(ProcessError::pause_for("downstream stalled", Duration::from_secs(1))),
            }),
            OnUnknownFailure::PauseDefault,
        );
        let mut unit = unit_with(1);
        match invoker.invoke(&mut unit, &CancellationToken::new()).await {
            Outcome::Pause { reason, backoff } => {
                assert_eq!(reason, "downstream stalled");
                assert_eq!(backoff, Some(Duration::from_secs(1)));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_failure_follows_the_configured_policy() {
        let mut unit = unit_with(1);
        let invoker_pause = invoker(
            Arc::new(Scripted {
                reply: |_| Err(ProcessError::Other(anyhow!("boom"))),
            }),
            OnUnknownFailure::PauseDefault,
        );
        assert!(matches!(
            invoker_pause.invoke(&mut unit, &CancellationToken::new()).await,
            Outcome::Pause { .. }
        ));

        let mut unit = unit_with(1);
        let invoker_fatal = invoker(
            Arc::new(Scripted {
                reply: |_| Err(ProcessError::Other(anyhow!("boom"))),
            }),
            OnUnknownFailure::Fatal,
        );
        assert!(matches!(
            invoker_fatal.invoke(&mut unit, &CancellationToken::new()).await,
            Outcome::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn explicit_fatal_is_always_fatal() {
        let invoker = invoker(
            Arc::new(Scripted {
                reply: |_| Err(ProcessError::Fatal(anyhow!("corrupt state"))),
            }),
            OnUnknownFailure::PauseDefault,
        );
        let mut unit = unit_with(1);
        assert!(matches!(
            invoker.invoke(&mut unit, &CancellationToken::new()).await,
            Outcome::Fatal(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_processor_times_out_into_the_unknown_policy() {
        let invoker = invoker(Arc::new(Stuck), OnUnknownFailure::PauseDefault);
        let mut unit = unit_with(1);
        assert!(matches!(
            invoker.invoke(&mut unit, &CancellationToken::new()).await,
            Outcome::Pause { .. }
        ));
    }

    #[tokio::test]
    async fn shutdown_mid_invocation_discards_the_result() {
        let invoker = invoker(Arc::new(Stuck), OnUnknownFailure::PauseDefault);
        let mut unit = unit_with(1);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert!(matches!(
            invoker.invoke(&mut unit, &shutdown).await,
            Outcome::Shutdown
        ));
    }

    #[tokio::test]
    async fn advisory_result_length_mismatch_still_succeeds() {
        let invoker = invoker(
            Arc::new(Scripted {
                reply: |_| Ok(ProcessResult::new(Vec::new())),
            }),
            OnUnknownFailure::PauseDefault,
        );
        let mut unit = unit_with(2);
        match invoker.invoke(&mut unit, &CancellationToken::new()).await {
            Outcome::Success(result) => assert!(result.records().is_empty()),
            other => panic!("unexpected outcome: {other:?}"),
        }
        // commit still uses the unit's own offsets
        assert_eq!(unit.next_offsets()[&Partition::new("events", 0)], 2);
    }
}
