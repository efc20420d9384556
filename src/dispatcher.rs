use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use indicatif::ProgressBar;
use serde::{Serialize, Serializer};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ScrapeError;
use crate::retry::RetryController;
use crate::session::{Session, SessionProvider};
use crate::sink::OutputSink;
use crate::target::Target;

const CANCELLED: &str = "cancelled";

/// Result for one dispatched target.
#[derive(Debug, Clone)]
pub struct TargetOutcome {
    pub target: Target,
    pub success: bool,
    pub attempts: u32,
    pub error: Option<String>,
}

impl TargetOutcome {
    fn failed(target: Target, attempts: u32, reason: impl Into<String>) -> Self {
        TargetOutcome {
            target,
            success: false,
            attempts,
            error: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub address: String,
    pub destination: PathBuf,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Targets dispatched (skipped ones excluded).
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(rename = "elapsed_secs", serialize_with = "secs")]
    pub elapsed: Duration,
    #[serde(rename = "average_secs", serialize_with = "secs")]
    pub average: Duration,
    pub failures: Vec<Failure>,
}

fn secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl RunSummary {
    pub fn from_outcomes(outcomes: &[TargetOutcome], skipped: usize, elapsed: Duration) -> Self {
        let total = outcomes.len();
        let succeeded = outcomes.iter().filter(|o| o.success).count();
        let failures = outcomes
            .iter()
            .filter(|o| !o.success)
            .map(|o| Failure {
                address: o.target.address.clone(),
                destination: o.target.destination.clone(),
                attempts: o.attempts,
                reason: o.error.clone().unwrap_or_default(),
            })
            .collect();
        let average = if total == 0 {
            Duration::ZERO
        } else {
            elapsed / total as u32
        };

        RunSummary {
            total,
            succeeded,
            failed: total - succeeded,
            skipped,
            elapsed,
            average,
            failures,
        }
    }

    pub fn log(&self) {
        info!(
            "Done: {} targets, {} succeeded, {} failed ({} skipped)",
            self.total, self.succeeded, self.failed, self.skipped
        );
        info!(
            "Elapsed {:.2}s, {:.2}s per target on average",
            self.elapsed.as_secs_f64(),
            self.average.as_secs_f64()
        );
    }
}

/// Splits targets across a fixed pool of workers, one session per worker.
pub struct Dispatcher<P> {
    provider: Arc<P>,
    controller: Arc<RetryController>,
    sink: OutputSink,
    workers: usize,
    session_timeout: Duration,
    progress: ProgressBar,
}

impl<P: SessionProvider + 'static> Dispatcher<P> {
    pub fn new(
        provider: P,
        controller: RetryController,
        sink: OutputSink,
        workers: usize,
        session_timeout: Duration,
    ) -> Self {
        Dispatcher {
            provider: Arc::new(provider),
            controller: Arc::new(controller),
            sink,
            workers: workers.max(1),
            session_timeout,
            progress: ProgressBar::hidden(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Process every target without existing output and summarise the run.
    ///
    /// Never fails: per-target problems end up in the summary's failure list.
    pub async fn run(&self, targets: Vec<Target>, cancel: CancellationToken) -> RunSummary {
        let (pending, skipped) = self.sink.partition(targets);
        let queues = partition(pending, self.workers);
        let total: usize = queues.iter().map(Vec::len).sum();
        info!("Dispatching {} targets to {} workers", total, queues.len());

        self.progress.set_length(total as u64);
        let started = Instant::now();

        let mut handles = Vec::with_capacity(queues.len());
        for (id, queue) in queues.into_iter().enumerate() {
            let worker = Worker {
                id,
                provider: Arc::clone(&self.provider),
                controller: Arc::clone(&self.controller),
                sink: self.sink,
                session_timeout: self.session_timeout,
                progress: self.progress.clone(),
                cancel: cancel.clone(),
            };
            let assigned = queue.clone();
            handles.push((assigned, tokio::spawn(worker.run(queue))));
        }

        let mut outcomes = Vec::with_capacity(total);
        for (assigned, handle) in handles {
            match handle.await {
                Ok(results) => outcomes.extend(results),
                Err(e) => {
                    error!("Worker crashed: {}", e);
                    let reason = format!("worker crashed: {}", e);
                    outcomes.extend(
                        assigned
                            .into_iter()
                            .map(|t| TargetOutcome::failed(t, 0, reason.clone())),
                    );
                }
            }
        }

        self.progress.finish_and_clear();
        RunSummary::from_outcomes(&outcomes, skipped.len(), started.elapsed())
    }
}

/// Round-robin targets into at most `workers` non-empty queues.
pub fn partition(targets: Vec<Target>, workers: usize) -> Vec<Vec<Target>> {
    let n = workers.max(1).min(targets.len());
    let mut queues: Vec<Vec<Target>> = (0..n).map(|_| Vec::new()).collect();
    for (i, target) in targets.into_iter().enumerate() {
        queues[i % n].push(target);
    }
    queues
}

struct Worker<P> {
    id: usize,
    provider: Arc<P>,
    controller: Arc<RetryController>,
    sink: OutputSink,
    session_timeout: Duration,
    progress: ProgressBar,
    cancel: CancellationToken,
}

impl<P: SessionProvider> Worker<P> {
    async fn run(self, queue: Vec<Target>) -> Vec<TargetOutcome> {
        if self.cancel.is_cancelled() {
            return self.fail_all(queue, CANCELLED);
        }

        let mut session = match self.open_session().await {
            Ok(session) => session,
            Err(e) => {
                error!(worker = self.id, "{}; failing {} targets", e, queue.len());
                return self.fail_all(queue, e.to_string());
            }
        };

        let mut outcomes = Vec::with_capacity(queue.len());
        let mut remaining = queue.into_iter();
        while let Some(target) = remaining.next() {
            let (outcome, session_lost) = if self.cancel.is_cancelled() {
                (TargetOutcome::failed(target, 0, CANCELLED), false)
            } else {
                self.process(session.as_mut(), target).await
            };
            self.progress.inc(1);

            if session_lost {
                let reason = outcome.error.clone().unwrap_or_default();
                outcomes.push(outcome);
                let rest: Vec<Target> = remaining.collect();
                error!(
                    worker = self.id,
                    "Session lost; failing {} remaining targets",
                    rest.len()
                );
                outcomes.extend(self.fail_all(rest, reason));
                break;
            }
            outcomes.push(outcome);
        }

        session.close().await;
        info!(worker = self.id, "Worker finished {} targets", outcomes.len());
        outcomes
    }

    async fn open_session(&self) -> Result<Box<dyn Session>, ScrapeError> {
        match timeout(self.session_timeout, self.provider.create_session()).await {
            Ok(result) => result,
            Err(_) => Err(ScrapeError::SessionUnavailable(format!(
                "session not ready after {:?}",
                self.session_timeout
            ))),
        }
    }

    /// Returns the outcome and whether the session died on this target.
    async fn process(&self, session: &mut dyn Session, target: Target) -> (TargetOutcome, bool) {
        let extraction = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            extraction = self.controller.extract_with_retry(session, &target) => Some(extraction),
        };
        let Some(extraction) = extraction else {
            warn!(worker = self.id, "Cancelled while processing {}", target.address);
            return (TargetOutcome::failed(target, 0, CANCELLED), false);
        };
        let attempts = extraction.attempts.len() as u32;

        if !extraction.success {
            let reason = extraction.failure_reason().unwrap_or_default();
            return (
                TargetOutcome::failed(target, attempts, reason),
                extraction.session_lost,
            );
        }

        let outcome = match self.sink.write(&target, &extraction.record) {
            Ok(()) => {
                info!(
                    worker = self.id,
                    attempts,
                    "Extracted {} groups in {:.1}s: {}",
                    extraction.record.len(),
                    extraction.busy_time().as_secs_f64(),
                    target.address
                );
                TargetOutcome {
                    target,
                    success: true,
                    attempts,
                    error: None,
                }
            }
            Err(e) => {
                error!(worker = self.id, "{}", e);
                TargetOutcome::failed(target, attempts, e.to_string())
            }
        };
        (outcome, false)
    }

    fn fail_all(&self, queue: Vec<Target>, reason: impl Into<String>) -> Vec<TargetOutcome> {
        let reason = reason.into();
        self.progress.inc(queue.len() as u64);
        queue
            .into_iter()
            .map(|t| TargetOutcome::failed(t, 0, reason.clone()))
            .collect()
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, OutputFormat};
    use crate::retry::tests::{controller, fast_config, Script, ScriptedSession, BLANK, DETAILS};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Hands out scripted sessions and records how many pages each one loaded.
    struct TestProvider {
        script: Vec<Script>,
        work: Duration,
        fail_first: bool,
        created: AtomicUsize,
        loads: Arc<Mutex<Vec<usize>>>,
    }

    impl TestProvider {
        fn new(script: Vec<Script>) -> Self {
            TestProvider {
                script,
                work: Duration::ZERO,
                fail_first: false,
                created: AtomicUsize::new(0),
                loads: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    struct CountingSession {
        inner: ScriptedSession,
        loads: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl Session for CountingSession {
        async fn navigate(&mut self, address: &str) -> Result<u16, ScrapeError> {
            self.inner.navigate(address).await
        }
        async fn wait_for_idle(&mut self) -> Result<(), ScrapeError> {
            self.inner.wait_for_idle().await
        }
        async fn has_element(&mut self, selector: &str) -> bool {
            self.inner.has_element(selector).await
        }
        async fn content(&mut self) -> Result<String, ScrapeError> {
            self.inner.content().await
        }
        async fn close(self: Box<Self>) {
            self.loads.lock().unwrap().push(self.inner.navigations);
        }
    }

    #[async_trait]
    impl SessionProvider for TestProvider {
        async fn create_session(&self) -> Result<Box<dyn Session>, ScrapeError> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(ScrapeError::SessionUnavailable("no cookies".into()));
            }
            let mut inner = ScriptedSession::new(self.script.clone());
            inner.work = self.work;
            Ok(Box::new(CountingSession {
                inner,
                loads: Arc::clone(&self.loads),
            }))
        }
    }

    fn targets(dir: &TempDir, n: usize) -> Vec<Target> {
        (0..n)
            .map(|i| {
                Target::new(
                    format!("https://portal/items/{i}"),
                    dir.path().join(format!("{i}.json")),
                )
            })
            .collect()
    }

    fn dispatcher(
        provider: TestProvider,
        config: &Config,
        workers: usize,
    ) -> Dispatcher<TestProvider> {
        Dispatcher::new(
            provider,
            controller(config),
            OutputSink::new(OutputFormat::Json),
            workers,
            config.session_timeout,
        )
    }

    #[test]
    fn round_robin_partition() {
        let dir = TempDir::new().unwrap();
        let queues = partition(targets(&dir, 5), 2);
        assert_eq!(queues.len(), 2);
        assert_eq!(queues[0].len(), 3);
        assert_eq!(queues[1].len(), 2);
        assert_eq!(queues[1][0].address, "https://portal/items/1");

        assert_eq!(partition(targets(&dir, 2), 4).len(), 2);
        assert!(partition(Vec::new(), 4).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn existing_outputs_are_not_dispatched() {
        let dir = TempDir::new().unwrap();
        let list = targets(&dir, 5);
        std::fs::write(&list[0].destination, "{}").unwrap();
        std::fs::write(&list[4].destination, "{}").unwrap();

        let provider = TestProvider::new(vec![Script::Page(DETAILS)]);
        let loads = Arc::clone(&provider.loads);
        let config = fast_config();
        let summary = dispatcher(provider, &config, 2)
            .run(list, CancellationToken::new())
            .await;

        assert_eq!(summary.total, 3);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(loads.lock().unwrap().iter().sum::<usize>(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rerun_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let config = fast_config();

        let first = dispatcher(TestProvider::new(vec![Script::Page(DETAILS)]), &config, 2)
            .run(targets(&dir, 4), CancellationToken::new())
            .await;
        assert_eq!(first.succeeded, 4);

        let provider = TestProvider::new(vec![Script::Page(DETAILS)]);
        let second = dispatcher(provider, &config, 2)
            .run(targets(&dir, 4), CancellationToken::new())
            .await;
        assert_eq!(second.total, 0);
        assert_eq!(second.skipped, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn workers_run_in_parallel() {
        let dir = TempDir::new().unwrap();
        let mut provider = TestProvider::new(vec![Script::Page(DETAILS)]);
        provider.work = Duration::from_secs(1);
        let loads = Arc::clone(&provider.loads);
        let config = fast_config();

        let summary = dispatcher(provider, &config, 2)
            .run(targets(&dir, 4), CancellationToken::new())
            .await;

        assert_eq!(summary.succeeded, 4);
        assert_eq!(*loads.lock().unwrap(), vec![2, 2]);
        // Two workers, two one-second targets each.
        assert!(summary.elapsed >= Duration::from_secs(2));
        assert!(summary.elapsed < Duration::from_secs(3));
        assert_eq!(summary.average, summary.elapsed / 4);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_session_only_sinks_its_own_worker() {
        let dir = TempDir::new().unwrap();
        let mut provider = TestProvider::new(vec![Script::Page(DETAILS)]);
        provider.fail_first = true;
        let config = fast_config();

        let summary = dispatcher(provider, &config, 2)
            .run(targets(&dir, 4), CancellationToken::new())
            .await;

        assert_eq!(summary.total, 4);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 2);
        assert!(summary
            .failures
            .iter()
            .all(|f| f.reason.contains("session unavailable")));
        assert!(summary.failures.iter().all(|f| !f.destination.exists()));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_session_fails_rest_of_queue_without_navigating() {
        let dir = TempDir::new().unwrap();
        let provider = TestProvider::new(vec![Script::Revoked]);
        let loads = Arc::clone(&provider.loads);
        let config = fast_config();

        let summary = dispatcher(provider, &config, 1)
            .run(targets(&dir, 3), CancellationToken::new())
            .await;

        assert_eq!(summary.failed, 3);
        assert_eq!(*loads.lock().unwrap(), vec![1]);
        assert!(summary
            .failures
            .iter()
            .all(|f| f.reason.contains("cookies revoked")));
        assert_eq!(summary.failures[0].attempts, 1);
        assert!(summary.failures[1..].iter().all(|f| f.attempts == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_targets_leave_no_file() {
        let dir = TempDir::new().unwrap();
        let config = fast_config();
        let summary = dispatcher(TestProvider::new(vec![Script::Page(BLANK)]), &config, 1)
            .run(targets(&dir, 2), CancellationToken::new())
            .await;

        assert_eq!(summary.failed, 2);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_remaining_targets() {
        let dir = TempDir::new().unwrap();
        let mut provider = TestProvider::new(vec![Script::Page(DETAILS)]);
        provider.work = Duration::from_secs(10);
        let config = fast_config();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            trigger.cancel();
        });

        let summary = dispatcher(provider, &config, 1)
            .run(targets(&dir, 3), cancel)
            .await;

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 2);
        assert!(summary.failures.iter().all(|f| f.reason == CANCELLED));
        let written = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(written, 1);
    }

    #[test]
    fn summary_serializes_seconds() {
        let summary = RunSummary::from_outcomes(&[], 3, Duration::from_millis(1500));
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["elapsed_secs"], 1.5);
        assert_eq!(json["average_secs"], 0.0);
        assert_eq!(json["skipped"], 3);
    }
}
