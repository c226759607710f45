//! Handler capabilities a saga participant can implement.
//!
//! Handlers are shared (`Send + Sync`) and stateless with respect to a
//! single message: the saga context for the message being handled is
//! passed to every call instead of being stored on the handler.

use std::fmt;

use async_trait::async_trait;
use common::{Message, Response};

use crate::context::SagaContext;
use crate::error::SagaError;

/// Result of a handler call.
pub type HandlerResult = Result<(), SagaError>;

/// Begins a saga. Invoked for a message that may carry no saga id yet.
#[async_trait]
pub trait StartHandler<M: Message>: Send + Sync {
    async fn handle_start(&self, ctx: &SagaContext, message: M) -> HandlerResult;
}

/// Handles a message within an existing saga.
#[async_trait]
pub trait StepHandler<M: Message>: Send + Sync {
    async fn handle(&self, ctx: &SagaContext, message: M) -> HandlerResult;
}

/// Handles the response to a request previously sent by this participant.
#[async_trait]
pub trait ResponseHandler<R: Response>: Send + Sync {
    async fn handle_success_response(&self, ctx: &SagaContext, response: R) -> HandlerResult;

    async fn handle_fail_response(&self, ctx: &SagaContext, response: R) -> HandlerResult;
}

/// Undoes the effect of a completed step driven by `M`.
#[async_trait]
pub trait CompensationHandler<M: Message>: Send + Sync {
    async fn compensate(&self, ctx: &SagaContext, message: M) -> HandlerResult;
}

/// Which capability a registered handler implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerRole {
    Start,
    Step,
    Response,
    Compensation,
}

impl HandlerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerRole::Start => "start",
            HandlerRole::Step => "step",
            HandlerRole::Response => "response",
            HandlerRole::Compensation => "compensation",
        }
    }
}

impl fmt::Display for HandlerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
