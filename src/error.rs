use std::error::Error as StdError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("transient write error: {0}")]
    TransientWrite(String),
    #[error("permanent write error: {0}")]
    PermanentWrite(String),
    #[error("transient read error: {0}")]
    TransientRead(String),
    #[error("permanent read error: {0}")]
    PermanentRead(String),
    #[error("reconciliation mismatch: expected {expected} record(s), found {found}")]
    ReconciliationMismatch { expected: usize, found: usize },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("run report error: {0}")]
    Report(String),
}

impl SyncError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::TransientWrite(_) | SyncError::TransientRead(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::SourceUnavailable(_) => "source_unavailable",
            SyncError::TransientWrite(_) => "transient_write",
            SyncError::PermanentWrite(_) => "permanent_write",
            SyncError::TransientRead(_) => "transient_read",
            SyncError::PermanentRead(_) => "permanent_read",
            SyncError::ReconciliationMismatch { .. } => "reconciliation_mismatch",
            SyncError::Config(_) => "config",
            SyncError::Report(_) => "report",
        }
    }

    /// Maps a Postgres error into the write taxonomy.
    pub fn from_postgres(err: tokio_postgres::Error) -> Self {
        if is_transient_postgres_error(&err) {
            SyncError::TransientWrite(err.to_string())
        } else {
            SyncError::PermanentWrite(describe_postgres_error(&err))
        }
    }

    /// Maps an HTTP error from a market-data read.
    ///
    /// Anything that went wrong on the wire is transient; only a rejected
    /// request (4xx other than 429) or an unusable payload is permanent.
    pub fn from_http(err: reqwest::Error) -> Self {
        if is_transient_http_error(&err) {
            SyncError::TransientRead(err.to_string())
        } else {
            SyncError::PermanentRead(err.to_string())
        }
    }
}

fn is_transient_http_error(err: &reqwest::Error) -> bool {
    if let Some(status) = err.status() {
        return is_transient_http_status(status.as_u16());
    }
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        return true;
    }
    err.is_decode() && has_io_source(err)
}

fn is_transient_http_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

fn has_io_source(err: &(dyn StdError + 'static)) -> bool {
    let mut source = err.source();
    while let Some(inner) = source {
        if inner.is::<std::io::Error>() {
            return true;
        }
        source = inner.source();
    }
    false
}

// SQLSTATE classes: 08 connection, 40 rollback/deadlock, 53 resources, 57 operator intervention.
const TRANSIENT_SQLSTATE_CLASSES: [&str; 4] = ["08", "40", "53", "57"];

fn is_transient_postgres_error(err: &tokio_postgres::Error) -> bool {
    if err.is_closed() {
        return true;
    }
    if let Some(db_error) = err.as_db_error() {
        return is_transient_sqlstate(db_error.code().code());
    }
    has_io_source(err)
}

fn is_transient_sqlstate(code: &str) -> bool {
    TRANSIENT_SQLSTATE_CLASSES
        .iter()
        .any(|class| code.starts_with(class))
}

fn describe_postgres_error(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db_error) => format!(
            "{} (SQLSTATE {})",
            db_error.message(),
            db_error.code().code()
        ),
        None => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_writes_are_retryable() {
        assert!(SyncError::TransientWrite("timeout".into()).is_transient());
        assert!(!SyncError::PermanentWrite("type mismatch".into()).is_transient());
        assert!(!SyncError::SourceUnavailable("missing".into()).is_transient());
    }

    #[test]
    fn sqlstate_classes_split_transient_from_permanent() {
        use tokio_postgres::error::SqlState;

        for transient in [
            SqlState::CONNECTION_FAILURE,
            SqlState::T_R_SERIALIZATION_FAILURE,
            SqlState::T_R_DEADLOCK_DETECTED,
            SqlState::TOO_MANY_CONNECTIONS,
            SqlState::ADMIN_SHUTDOWN,
        ] {
            assert!(is_transient_sqlstate(transient.code()), "{}", transient.code());
        }
        for permanent in [
            SqlState::STRING_DATA_RIGHT_TRUNCATION,
            SqlState::DIVISION_BY_ZERO,
            SqlState::UNIQUE_VIOLATION,
            SqlState::NOT_NULL_VIOLATION,
            SqlState::UNDEFINED_TABLE,
            SqlState::SYNTAX_ERROR,
        ] {
            assert!(!is_transient_sqlstate(permanent.code()), "{}", permanent.code());
        }
    }

    #[test]
    fn throttling_and_server_errors_are_transient_statuses() {
        for status in [429u16, 500, 502, 503, 504] {
            assert!(is_transient_http_status(status), "{}", status);
        }
        for status in [400u16, 401, 403, 404, 422] {
            assert!(!is_transient_http_status(status), "{}", status);
        }
    }

    #[test]
    fn read_errors_follow_the_same_retry_rule() {
        assert!(SyncError::TransientRead("reset".into()).is_transient());
        assert!(!SyncError::PermanentRead("bad payload".into()).is_transient());
        assert_eq!(SyncError::TransientRead(String::new()).kind(), "transient_read");
    }

    #[test]
    fn mismatch_message_names_both_counts() {
        let err = SyncError::ReconciliationMismatch {
            expected: 20,
            found: 18,
        };
        assert_eq!(
            err.to_string(),
            "reconciliation mismatch: expected 20 record(s), found 18"
        );
        assert_eq!(err.kind(), "reconciliation_mismatch");
    }
}
