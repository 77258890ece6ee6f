//! Announcing suspected duplicates on the outbound queue.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dedup_common::broker::ConnectionManager;
use dedup_common::event::{CustomerEvent, CustomerRecord, CustomerType};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::PublishError;
use crate::search::CandidateHit;

pub const DEFAULT_DUPLICATE_EVENT_TYPE: &str = "DuplicataSuspeita";

/// Build the event announcing `hit` as a suspected duplicate.
///
/// The event id is derived from the suspicion id, so announcing the same suspicion twice
/// produces the same event id. Name and document number are only carried for known customer
/// types.
pub fn duplicate_event_for(
    hit: &CandidateHit,
    suspicion_id: Uuid,
    event_type: &str,
) -> CustomerEvent {
    let mut data = CustomerRecord {
        customer_id: hit.candidate_id,
        customer_type: hit.customer_type,
        phone: hit.phone.clone(),
        email: hit.email.clone(),
        ..Default::default()
    };

    match hit.customer_type {
        CustomerType::Individual | CustomerType::Organization => {
            data.full_name = hit.full_name.clone();
            data.document_number = hit.document_number.clone();
        }
        CustomerType::Unknown => {
            warn!(
                candidate_id = %hit.candidate_id,
                "candidate has no known customer type, announcing without name and document"
            );
        }
    }

    CustomerEvent {
        event_id: Uuid::new_v5(&suspicion_id, event_type.as_bytes()),
        event_type: event_type.to_owned(),
        timestamp: Utc::now(),
        data,
    }
}

#[async_trait]
pub trait DuplicatePublisher {
    async fn publish(&self, event: &CustomerEvent) -> Result<(), PublishError>;
}

/// Publishes duplicate events to a durable queue through the shared broker connection.
pub struct AmqpDuplicatePublisher {
    manager: Arc<ConnectionManager>,
    queue: String,
}

impl AmqpDuplicatePublisher {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        let queue = manager.topology().outbound.clone();
        Self { manager, queue }
    }
}

#[async_trait]
impl DuplicatePublisher for AmqpDuplicatePublisher {
    async fn publish(&self, event: &CustomerEvent) -> Result<(), PublishError> {
        let payload = event.to_vec()?;

        self.manager.publish(&self.queue, &payload).await?;

        debug!(
            event_id = %event.event_id,
            candidate_id = %event.data.customer_id,
            queue = %self.queue,
            "published duplicate event"
        );

        Ok(())
    }
}
