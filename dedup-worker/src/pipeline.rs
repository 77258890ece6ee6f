//! Processing of one customer event, from candidate lookup to announcing duplicates.
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dedup_common::event::CustomerEvent;
use dedup_common::suspicion::{PendingSuspicions, SuspicionStore};
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, PublishError};
use crate::publisher::{duplicate_event_for, DuplicatePublisher};
use crate::search::CandidateSource;
use crate::similarity::SimilarityEvaluator;

/// What processing an event amounted to. Both variants mean the message can be acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The event did not identify a customer, so nothing was looked up.
    InvalidIdentity,
    Analyzed { candidates: usize, suspicions: usize },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::InvalidIdentity => "invalid_identity",
            Outcome::Analyzed { suspicions: 0, .. } => "no_duplicates",
            Outcome::Analyzed { .. } => "duplicates_found",
        }
    }
}

/// Something the consumer hands decoded events to.
#[async_trait]
pub trait EventHandler {
    async fn handle(&self, event: &CustomerEvent) -> Result<Outcome, PipelineError>;
}

/// Looks for existing customers resembling the one in an event, records the convincing ones
/// and announces each of them.
pub struct DuplicateAnalyzer<C, S, P> {
    candidates: Arc<C>,
    store: Arc<S>,
    publisher: Arc<P>,
    evaluator: SimilarityEvaluator,
    duplicate_event_type: String,
}

impl<C, S, P> DuplicateAnalyzer<C, S, P>
where
    C: CandidateSource + Send + Sync,
    S: SuspicionStore + Send + Sync,
    P: DuplicatePublisher + Send + Sync,
{
    pub fn new(
        candidates: Arc<C>,
        store: Arc<S>,
        publisher: Arc<P>,
        evaluator: SimilarityEvaluator,
        duplicate_event_type: &str,
    ) -> Self {
        Self {
            candidates,
            store,
            publisher,
            evaluator,
            duplicate_event_type: duplicate_event_type.to_owned(),
        }
    }

    /// Analyze one event.
    ///
    /// Suspicions are committed together once every hit has been evaluated, and only then
    /// announced. Every announcement is attempted even if an earlier one failed, unless the
    /// broker connection is gone for good.
    #[tracing::instrument(
        skip_all,
        fields(event_id = %event.event_id, customer_id = %event.data.customer_id)
    )]
    pub async fn analyze(&self, event: &CustomerEvent) -> Result<Outcome, PipelineError> {
        let start = Instant::now();

        let result = self.run(event).await;

        let outcome = match &result {
            Ok(outcome) => outcome.label(),
            Err(e) => e.kind(),
        };
        metrics::counter!("dedup_events_total", &[("outcome", outcome)]).increment(1);
        metrics::histogram!("dedup_event_processing_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        result
    }

    async fn run(&self, event: &CustomerEvent) -> Result<Outcome, PipelineError> {
        let record = &event.data;

        if !record.has_identity() {
            warn!("event does not identify a customer, skipping analysis");
            return Ok(Outcome::InvalidIdentity);
        }

        let hits = self.candidates.find_candidates(record).await?;
        metrics::counter!("dedup_candidates_total").increment(hits.len() as u64);
        debug!(candidates = hits.len(), "retrieved candidates");

        let mut pending = PendingSuspicions::new();
        let mut announcements = Vec::new();

        for hit in &hits {
            if let Some(suspicion) = self.evaluator.evaluate(event.event_id, record, hit) {
                announcements.push(duplicate_event_for(
                    hit,
                    suspicion.id,
                    &self.duplicate_event_type,
                ));
                pending.stage(suspicion);
            }
        }

        let suspicions = pending.len();
        let inserted = pending.commit_all(self.store.as_ref()).await?;
        metrics::counter!("dedup_suspicions_total").increment(inserted);
        if suspicions > 0 {
            info!(suspicions, inserted, "recorded suspected duplicates");
        }

        let mut failed = 0;
        for announcement in &announcements {
            match self.publisher.publish(announcement).await {
                Ok(()) => {
                    metrics::counter!("dedup_duplicate_events_published_total").increment(1);
                }
                Err(e) if e.is_fatal() => {
                    error!(
                        candidate_id = %announcement.data.customer_id,
                        "broker unreachable, abandoning the remaining duplicate events: {}",
                        e
                    );
                    return Err(e.into());
                }
                Err(e) => {
                    error!(
                        candidate_id = %announcement.data.customer_id,
                        "failed to publish duplicate event: {}",
                        e
                    );
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(PublishError::Incomplete {
                failed,
                attempted: announcements.len(),
            }
            .into());
        }

        Ok(Outcome::Analyzed {
            candidates: hits.len(),
            suspicions,
        })
    }
}

#[async_trait]
impl<C, S, P> EventHandler for DuplicateAnalyzer<C, S, P>
where
    C: CandidateSource + Send + Sync,
    S: SuspicionStore + Send + Sync,
    P: DuplicatePublisher + Send + Sync,
{
    async fn handle(&self, event: &CustomerEvent) -> Result<Outcome, PipelineError> {
        self.analyze(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(Outcome::InvalidIdentity.label(), "invalid_identity");
        assert_eq!(
            Outcome::Analyzed {
                candidates: 3,
                suspicions: 0
            }
            .label(),
            "no_duplicates"
        );
        assert_eq!(
            Outcome::Analyzed {
                candidates: 3,
                suspicions: 1
            }
            .label(),
            "duplicates_found"
        );
    }
}
