//! Execution interceptors: caller hooks around each pipeline stage.

use std::sync::Arc;

use tracing::warn;

use crate::context::ExecutionContext;
use crate::error::{BoxError, Error};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InterceptorStage {
    BeforeExecution,
    ModifyInput,
    BeforeMarshalling,
    AfterMarshalling,
    ModifyHttpRequest,
    BeforeTransmission,
    AfterTransmission,
    ModifyHttpResponse,
    BeforeUnmarshalling,
    AfterUnmarshalling,
    AfterExecution,
    OnExecutionFailure,
}

impl InterceptorStage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BeforeExecution => "before_execution",
            Self::ModifyInput => "modify_input",
            Self::BeforeMarshalling => "before_marshalling",
            Self::AfterMarshalling => "after_marshalling",
            Self::ModifyHttpRequest => "modify_http_request",
            Self::BeforeTransmission => "before_transmission",
            Self::AfterTransmission => "after_transmission",
            Self::ModifyHttpResponse => "modify_http_response",
            Self::BeforeUnmarshalling => "before_unmarshalling",
            Self::AfterUnmarshalling => "after_unmarshalling",
            Self::AfterExecution => "after_execution",
            Self::OnExecutionFailure => "on_execution_failure",
        }
    }

    /// Response-side stages unwind the chain last-registered first.
    pub const fn runs_in_reverse(self) -> bool {
        matches!(
            self,
            Self::AfterTransmission
                | Self::ModifyHttpResponse
                | Self::BeforeUnmarshalling
                | Self::AfterUnmarshalling
                | Self::AfterExecution
                | Self::OnExecutionFailure
        )
    }
}

impl std::fmt::Display for InterceptorStage {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// One hook per stage, all no-ops by default. `modify_*` hooks may change the
/// input, request or response; the others observe.
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str {
        "anonymous"
    }

    fn before_execution(&self, _context: &ExecutionContext) -> Result<(), BoxError> {
        Ok(())
    }

    fn modify_input(&self, _context: &mut ExecutionContext) -> Result<(), BoxError> {
        Ok(())
    }

    fn before_marshalling(&self, _context: &ExecutionContext) -> Result<(), BoxError> {
        Ok(())
    }

    fn after_marshalling(&self, _context: &ExecutionContext) -> Result<(), BoxError> {
        Ok(())
    }

    fn modify_http_request(&self, _context: &mut ExecutionContext) -> Result<(), BoxError> {
        Ok(())
    }

    fn before_transmission(&self, _context: &ExecutionContext) -> Result<(), BoxError> {
        Ok(())
    }

    fn after_transmission(&self, _context: &ExecutionContext) -> Result<(), BoxError> {
        Ok(())
    }

    fn modify_http_response(&self, _context: &mut ExecutionContext) -> Result<(), BoxError> {
        Ok(())
    }

    fn before_unmarshalling(&self, _context: &ExecutionContext) -> Result<(), BoxError> {
        Ok(())
    }

    fn after_unmarshalling(&self, _context: &ExecutionContext) -> Result<(), BoxError> {
        Ok(())
    }

    fn after_execution(&self, _context: &ExecutionContext) -> Result<(), BoxError> {
        Ok(())
    }

    /// Errors returned here are logged; they never replace the call's error.
    fn on_execution_failure(
        &self,
        _context: &ExecutionContext,
        _error: &Error,
    ) -> Result<(), BoxError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors
            .iter()
            .map(|interceptor| interceptor.name())
            .collect()
    }

    fn ordered(&self, stage: InterceptorStage) -> Box<dyn Iterator<Item = &Arc<dyn Interceptor>> + '_> {
        if stage.runs_in_reverse() {
            Box::new(self.interceptors.iter().rev())
        } else {
            Box::new(self.interceptors.iter())
        }
    }

    /// Runs `stage` across the chain; the first failing hook stops it.
    pub(crate) fn run(
        &self,
        stage: InterceptorStage,
        context: &mut ExecutionContext,
    ) -> Result<(), Error> {
        for interceptor in self.ordered(stage) {
            let outcome = match stage {
                InterceptorStage::BeforeExecution => interceptor.before_execution(context),
                InterceptorStage::ModifyInput => interceptor.modify_input(context),
                InterceptorStage::BeforeMarshalling => interceptor.before_marshalling(context),
                InterceptorStage::AfterMarshalling => interceptor.after_marshalling(context),
                InterceptorStage::ModifyHttpRequest => interceptor.modify_http_request(context),
                InterceptorStage::BeforeTransmission => interceptor.before_transmission(context),
                InterceptorStage::AfterTransmission => interceptor.after_transmission(context),
                InterceptorStage::ModifyHttpResponse => interceptor.modify_http_response(context),
                InterceptorStage::BeforeUnmarshalling => {
                    interceptor.before_unmarshalling(context)
                }
                InterceptorStage::AfterUnmarshalling => interceptor.after_unmarshalling(context),
                InterceptorStage::AfterExecution => interceptor.after_execution(context),
                InterceptorStage::OnExecutionFailure => Ok(()),
            };
            outcome.map_err(|source| Error::Interceptor {
                stage,
                interceptor: interceptor.name(),
                source,
            })?;
        }
        Ok(())
    }

    pub(crate) fn run_failure(&self, context: &ExecutionContext, error: &Error) {
        for interceptor in self.ordered(InterceptorStage::OnExecutionFailure) {
            if let Err(hook_error) = interceptor.on_execution_failure(context, error) {
                warn!(
                    interceptor = interceptor.name(),
                    error = %hook_error,
                    "on_execution_failure hook failed"
                );
            }
        }
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_list().entries(self.names()).finish()
    }
}
