//! Effect interpreter traits.
//!
//! These traits define how effects are executed. The embedding application
//! implements them against its build system and source-control layer; tests
//! implement them with recording fakes.
//!
//! The engine treats interpreter calls as bounded by the implementation's
//! own timeout/retry policy and never holds a car-level lock across one.

use std::future::Future;

use super::{PipelineEffect, PipelineResponse, RefEffect, RefResponse};

/// Interprets pipeline effects against the external build system.
///
/// # Example (mock for testing)
///
/// ```ignore
/// #[derive(Clone)]
/// struct ScriptedPipelines {
///     statuses: HashMap<PipelineId, PipelineStatus>,
/// }
///
/// impl PipelineInterpreter for ScriptedPipelines {
///     type Error = Infallible;
///
///     async fn interpret(&self, effect: PipelineEffect) -> Result<PipelineResponse, Self::Error> {
///         match effect {
///             PipelineEffect::GetStatus { pipeline } => {
///                 Ok(PipelineResponse::Status(self.statuses[&pipeline].clone()))
///             }
///             PipelineEffect::Request { .. } => { /* allocate an id */ }
///         }
///     }
/// }
/// ```
pub trait PipelineInterpreter {
    /// The error type returned by this interpreter.
    type Error;

    /// Execute a pipeline effect and return its response.
    fn interpret(
        &self,
        effect: PipelineEffect,
    ) -> impl Future<Output = Result<PipelineResponse, Self::Error>> + Send;
}

/// Interprets ref effects against the source-control ref management layer.
///
/// `CreateTrainRef` is expected to compute the merge of the car's changes on
/// top of the given base and return the resulting SHA; the engine only
/// chains the SHAs, it never computes commits itself.
pub trait RefInterpreter {
    /// The error type returned by this interpreter.
    type Error;

    /// Execute a ref effect and return its response.
    fn interpret(
        &self,
        effect: RefEffect,
    ) -> impl Future<Output = Result<RefResponse, Self::Error>> + Send;
}
