use common::{MessageId, SagaId};

/// Source of saga and message identifiers.
pub trait IdGenerator: Send + Sync {
    fn next_saga_id(&self) -> SagaId;
    fn next_message_id(&self) -> MessageId;
}

/// Random v4 UUID identifiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_saga_id(&self) -> SagaId {
        SagaId::new()
    }

    fn next_message_id(&self) -> MessageId {
        MessageId::new()
    }
}
