use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::ScrapeError;
use crate::extractor::{FieldExtractor, Record};
use crate::fetcher::PageFetcher;
use crate::session::Session;
use crate::target::Target;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

impl From<&Config> for RetryPolicy {
    fn from(config: &Config) -> Self {
        RetryPolicy {
            max_retries: config.retries,
            delay: config.retry_delay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success { groups: usize },
    Empty,
    Error(String),
}

/// One fetch + extract cycle.
#[derive(Debug, Clone)]
pub struct ExtractionAttempt {
    /// 0-based.
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub elapsed: Duration,
}

/// Final result for one target. `record` is empty whenever `success` is false.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub record: Record,
    pub success: bool,
    /// The session itself failed; nothing else should be fetched with it.
    pub session_lost: bool,
    pub attempts: Vec<ExtractionAttempt>,
}

impl Extraction {
    /// Reason for the last failed attempt, if any.
    pub fn failure_reason(&self) -> Option<String> {
        if self.success {
            return None;
        }
        self.attempts.last().map(|a| match &a.outcome {
            AttemptOutcome::Error(e) => e.clone(),
            AttemptOutcome::Empty => "no extractable content".to_string(),
            AttemptOutcome::Success { .. } => format!("attempt {} lost its record", a.attempt),
        })
    }

    /// Time spent fetching and extracting, backoff excluded.
    pub fn busy_time(&self) -> Duration {
        self.attempts.iter().map(|a| a.elapsed).sum()
    }
}

/// What a single attempt means for the retry loop.
enum Step {
    Done(Record),
    RetryEmpty,
    RetryError(ScrapeError),
    GiveUp(ScrapeError),
}

/// Fetcher + extractor wrapped in a bounded retry loop.
pub struct RetryController {
    fetcher: PageFetcher,
    extractor: FieldExtractor,
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(fetcher: PageFetcher, extractor: FieldExtractor, policy: RetryPolicy) -> Self {
        RetryController {
            fetcher,
            extractor,
            policy,
        }
    }

    /// Run attempts until one yields a non-empty record or the budget is spent.
    pub async fn extract_with_retry(
        &self,
        session: &mut dyn Session,
        target: &Target,
    ) -> Extraction {
        let address = target.address.as_str();
        let mut attempts = Vec::new();
        let mut session_lost = false;

        for attempt in 0..self.policy.max_attempts() {
            if attempt > 0 {
                info!(
                    "Retry ({}/{}) in {:.1}s: {}",
                    attempt,
                    self.policy.max_retries,
                    self.policy.delay.as_secs_f64(),
                    address
                );
                sleep(self.policy.delay).await;
            }

            let started = Instant::now();
            let step = self.attempt(session, target).await;
            let elapsed = started.elapsed();

            let outcome = match &step {
                Step::Done(record) => AttemptOutcome::Success {
                    groups: record.len(),
                },
                Step::RetryEmpty => AttemptOutcome::Empty,
                Step::RetryError(e) | Step::GiveUp(e) => AttemptOutcome::Error(e.to_string()),
            };
            attempts.push(ExtractionAttempt {
                attempt,
                outcome,
                elapsed,
            });

            match step {
                Step::Done(record) => {
                    return Extraction {
                        record,
                        success: true,
                        session_lost: false,
                        attempts,
                    }
                }
                Step::RetryEmpty => {
                    warn!(address, attempt, "{}", ScrapeError::EmptyExtraction(address.to_string()))
                }
                Step::RetryError(e) => warn!(address, attempt, "{}", e),
                Step::GiveUp(e) => {
                    error!(address, attempt, "Not retrying: {}", e);
                    session_lost = matches!(e, ScrapeError::SessionUnavailable(_));
                    break;
                }
            }
        }

        error!(
            "Giving up on {} after {} attempts",
            address,
            attempts.len()
        );
        Extraction {
            record: Record::default(),
            success: false,
            session_lost,
            attempts,
        }
    }

    async fn attempt(&self, session: &mut dyn Session, target: &Target) -> Step {
        match self.fetcher.fetch(session, target).await {
            Ok(document) => {
                let record = self.extractor.extract(&document);
                if record.is_empty() {
                    Step::RetryEmpty
                } else {
                    Step::Done(record)
                }
            }
            Err(e) if e.is_retryable() => Step::RetryError(e),
            Err(e) => Step::GiveUp(e),
        }
    }
}

// ── Tests ──
