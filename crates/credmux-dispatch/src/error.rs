use credmux_classify::ErrorKind;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("model {0} has no eligible credentials")]
    ModelUnavailable(String),
    #[error("provider {0} is cooling down")]
    ProviderCooling(String),
    #[error("deadline exhausted, last failure kind={kind:?} cause={cause:?}")]
    Exhausted {
        kind: Option<ErrorKind>,
        cause: Option<String>,
    },
    #[error("request rejected without retry: {kind:?} ({cause})")]
    Rejected { kind: ErrorKind, cause: String },
}
