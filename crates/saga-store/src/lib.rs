//! Step status state machine and persistence contract for saga steps.
//!
//! Every handler execution is tracked as a step keyed by
//! `(saga, step type, handler type, message id)`. Stores validate each
//! status write against the step state machine, which gives at-most-one
//! logical execution per key under redelivery.

pub mod error;
pub mod memory;
pub mod saga_data;
pub mod status;
pub mod step;
pub mod store;

pub use common::{MessageId, SagaId};
pub use error::{Result, StoreError};
pub use memory::InMemorySagaStore;
pub use saga_data::SagaData;
pub use status::{StepStatus, is_valid_transition};
pub use step::{FailureInfo, SagaStepMetadata, StepKey, StepRecordBuilder};
pub use store::{LogOutcome, SagaStore, SagaStoreExt};
