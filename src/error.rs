//! Error kinds surfaced by the storage engine.
//!
//! All fallible calls return `eyre::Result`; the variants below are attached
//! as the root cause whenever a caller needs to branch on the failure kind
//! (page-full triggers allocation, duplicate-key triggers rollback). Plain
//! I/O failures stay as wrapped `std::io::Error` values.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    #[error("corrupt page {page_id}: {reason}")]
    CorruptPage { page_id: u32, reason: String },

    #[error("corrupt WAL: {0}")]
    CorruptWal(String),

    #[error("page {0} is full")]
    PageFull(u32),

    #[error("duplicate key in unique index")]
    DuplicateKey,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database handle is degraded, reopen required")]
    Degraded,
}

/// Returns the `DbError` kind at the root of a report, if any.
pub fn kind_of(report: &eyre::Report) -> Option<&DbError> {
    report.downcast_ref::<DbError>()
}

pub fn is_page_full(report: &eyre::Report) -> bool {
    matches!(kind_of(report), Some(DbError::PageFull(_)))
}

pub fn is_duplicate_key(report: &eyre::Report) -> bool {
    matches!(kind_of(report), Some(DbError::DuplicateKey))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_survives_wrapping() {
        use eyre::WrapErr;

        let base: eyre::Result<()> = Err(DbError::PageFull(7).into());
        let wrapped = base.wrap_err("while inserting record").unwrap_err();

        assert!(is_page_full(&wrapped));
        assert_eq!(kind_of(&wrapped), Some(&DbError::PageFull(7)));
    }

    #[test]
    fn io_errors_have_no_kind() {
        let report = eyre::Report::new(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk on fire",
        ));

        assert!(kind_of(&report).is_none());
        assert!(!is_duplicate_key(&report));
    }
}
