//! Transformation script hosting.

use crate::dci::ItemValue;
use crate::node::NodeContextView;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("compilation failed: {0}")]
    Compile(String),
    #[error("execution failed: {0}")]
    Runtime(String),
    #[error("scripting is not available")]
    Unavailable,
}

/// Source of a DCI's transformation script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformScript {
    source: String,
}

impl TransformScript {
    /// `None` for blank source, which means no transformation.
    pub fn new(source: impl Into<String>) -> Option<Self> {
        let source = source.into();
        if source.trim().is_empty() {
            None
        } else {
            Some(Self { source })
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Runs transformation scripts.
///
/// `Ok(None)` leaves the value unchanged. Errors are reported to the caller,
/// which keeps the untransformed value.
pub trait ScriptHost: Send + Sync {
    fn transform(
        &self,
        script: &TransformScript,
        node: &dyn NodeContextView,
        value: &ItemValue,
    ) -> Result<Option<String>, ScriptError>;
}

/// Host used when no script engine is configured. Every attached script
/// fails with [`ScriptError::Unavailable`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledScriptHost;

impl ScriptHost for DisabledScriptHost {
    fn transform(
        &self,
        _script: &TransformScript,
        _node: &dyn NodeContextView,
        _value: &ItemValue,
    ) -> Result<Option<String>, ScriptError> {
        Err(ScriptError::Unavailable)
    }
}
