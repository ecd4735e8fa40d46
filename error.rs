use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SmtError {
    #[error("Lock Error: Panicked when trying to acquire a lock")]
    LockError,
    #[error("Unknown storage format tag: {0:#04x}")]
    InvalidFormat(u8),
    #[error("Storage record ends before all announced fields")]
    TruncatedInput,
    #[error("Trailing bytes after storage record")]
    TrailingInput,
}
