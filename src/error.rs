//! Error taxonomy for step execution.

use thiserror::Error;

/// Failure of one pipeline stage.
///
/// A failed dependency gate is not represented here: it is a normal
/// `false` gate result that turns the step into
/// [`StepStatus::Skipped`](crate::model::StepStatus::Skipped).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    /// An HTTP or database action could not be carried out.
    #[error("{0}")]
    Action(String),
    /// A post-action assertion did not hold.
    #[error("{0}")]
    Assertion(String),
    /// A placeholder or loop expression could not be resolved.
    #[error("{0}")]
    Resolution(String),
    /// Missing connection, missing base URL, invalid condition name.
    #[error("{0}")]
    Configuration(String),
    /// The overall HTTP call deadline elapsed.
    #[error("Request send takes so long, which is more than {0}s.")]
    Timeout(u64),
    #[error("Execution was cancelled")]
    Cancelled,
}

impl StepError {
    pub fn action(message: impl Into<String>) -> Self {
        StepError::Action(message.into())
    }

    pub fn resolution(message: impl Into<String>) -> Self {
        StepError::Resolution(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        StepError::Configuration(message.into())
    }
}

pub type Result<T, E = StepError> = std::result::Result<T, E>;
