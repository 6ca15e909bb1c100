/// Failure classes the workflow reports to operators and to `events.jsonl`.
///
/// Variants carry the human-facing reason; `kind()` is the stable token
/// event payloads and session transcripts key on.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("style catalog unavailable: {reason}")]
    CatalogUnavailable { reason: String },

    #[error("style image unavailable for '{name}': {reason}")]
    StyleImageUnavailable { name: String, reason: String },

    #[error("no sketch attached")]
    NoSketchSelected,

    #[error("no style selected")]
    NoStyleSelected,

    #[error("style upload failed: {reason}")]
    UploadFailed { reason: String },

    #[error("prompt augmentation failed: {reason}")]
    PromptAugmentFailed { reason: String },

    #[error("render {slot} failed: {reason}")]
    GenerationStepFailed { slot: usize, reason: String },

    #[error("{operation} request failed: {reason}")]
    NetworkFailure { operation: String, reason: String },
}

impl WorkflowError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CatalogUnavailable { .. } => "catalog_unavailable",
            Self::StyleImageUnavailable { .. } => "style_image_unavailable",
            Self::NoSketchSelected => "no_sketch_selected",
            Self::NoStyleSelected => "no_style_selected",
            Self::UploadFailed { .. } => "upload_failed",
            Self::PromptAugmentFailed { .. } => "prompt_augment_failed",
            Self::GenerationStepFailed { .. } => "generation_step_failed",
            Self::NetworkFailure { .. } => "network_failure",
        }
    }

    /// True when retrying the same operation without changing local state
    /// could succeed. Precondition failures stay false until the operator
    /// attaches a sketch or picks a style.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NoSketchSelected | Self::NoStyleSelected)
    }
}

/// Returns the kind token of the outermost `WorkflowError` in an anyhow
/// chain, whether it sits at the root or was attached with `context`. The
/// outermost kind names the operation as the operator saw it fail; deeper
/// causes stay in the chain.
pub fn workflow_kind(err: &anyhow::Error) -> Option<&'static str> {
    // Values attached with `.context(...)` live in a wrapper that `chain()`
    // only exposes as `dyn Error`; anyhow's own downcast searches them,
    // outermost first.
    err.downcast_ref::<WorkflowError>().map(WorkflowError::kind)
}

#[cfg(test)]
mod tests {
    use super::{workflow_kind, WorkflowError};

    #[test]
    fn display_carries_reason() {
        let err = WorkflowError::UploadFailed {
            reason: "413 Payload Too Large".to_string(),
        };
        assert_eq!(err.to_string(), "style upload failed: 413 Payload Too Large");

        let err = WorkflowError::GenerationStepFailed {
            slot: 1,
            reason: "timeout".to_string(),
        };
        assert_eq!(err.to_string(), "render 1 failed: timeout");
    }

    #[test]
    fn precondition_failures_are_not_retryable() {
        assert!(!WorkflowError::NoSketchSelected.is_retryable());
        assert!(!WorkflowError::NoStyleSelected.is_retryable());
        assert!(WorkflowError::CatalogUnavailable {
            reason: "connection refused".to_string(),
        }
        .is_retryable());
    }

    #[test]
    fn workflow_kind_survives_context_wrapping() {
        let err = anyhow::Error::new(WorkflowError::NetworkFailure {
            operation: "style list".to_string(),
            reason: "connection refused".to_string(),
        })
        .context("catalog load failed");

        assert_eq!(workflow_kind(&err), Some("network_failure"));
    }

    #[test]
    fn workflow_kind_sees_kinds_attached_as_context() {
        // The shape transport mappings produce: a plain root error with the
        // kind layered on as context.
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
        let err = anyhow::Error::new(io).context(WorkflowError::NetworkFailure {
            operation: "style list".to_string(),
            reason: "connection refused".to_string(),
        });

        assert_eq!(workflow_kind(&err), Some("network_failure"));
    }

    #[test]
    fn workflow_kind_reports_the_outermost_operation() {
        let inner = anyhow::Error::new(WorkflowError::NetworkFailure {
            operation: "generate".to_string(),
            reason: "socket closed".to_string(),
        });
        let outer = inner.context(WorkflowError::GenerationStepFailed {
            slot: 0,
            reason: "request failed".to_string(),
        });

        assert_eq!(workflow_kind(&outer), Some("generation_step_failed"));
    }

    #[test]
    fn workflow_kind_absent_for_plain_errors() {
        let err = anyhow::anyhow!("disk full");
        assert_eq!(workflow_kind(&err), None);
    }
}
