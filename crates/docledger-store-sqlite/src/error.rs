use docledger_core::LedgerError;
use rusqlite::ErrorCode;

/// Attach context to a `rusqlite` result while classifying the failure.
pub(crate) trait SqlContext<T> {
    fn db(self, context: &str) -> Result<T, LedgerError>;
}

impl<T> SqlContext<T> for Result<T, rusqlite::Error> {
    fn db(self, context: &str) -> Result<T, LedgerError> {
        self.map_err(|err| classify(&err, context))
    }
}

/// Busy/locked maps to a retryable error, constraint failures to `Conflict`.
pub(crate) fn classify(err: &rusqlite::Error, context: &str) -> LedgerError {
    let message = format!("{context}: {err}");
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => LedgerError::Busy(message),
            ErrorCode::ConstraintViolation => LedgerError::Conflict(message),
            _ => LedgerError::Storage(message),
        },
        _ => LedgerError::Storage(message),
    }
}
