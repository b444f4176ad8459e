use serde::{Deserialize, Serialize};
use uuid::Uuid;

use forgelist_core::ProductId;

/// Stream metadata around a published event.
///
/// `event_id` is stable across redeliveries, so consumers use it as their
/// idempotency key. `sequence_number` is the 1-based position in the product's
/// stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    product_id: ProductId,
    sequence_number: u64,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(event_id: Uuid, product_id: ProductId, sequence_number: u64, payload: E) -> Self {
        Self {
            event_id,
            product_id,
            sequence_number,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
