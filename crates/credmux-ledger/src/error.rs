#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("no credential available for this model before the deadline")]
    NoCredentialsAvailable,
}
