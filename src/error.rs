use thiserror::Error;

/// Failure classification for the capture pipeline.
///
/// Only `Config` is fatal at startup (exit code 2). Everything else is
/// handled at the component boundary: transient errors retry with backoff,
/// validation failures drop the event, schema drift degrades to absent data,
/// write conflicts are swallowed as success, and poison events move to the
/// DLQ after the redelivery budget is spent.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration: {0}")]
    Config(String),

    #[error("transient I/O: {0}")]
    TransientIo(String),

    #[error("schema drift: {0}")]
    SchemaDrift(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("write conflict on event {0}")]
    WriteConflict(String),

    #[error("poison event after {deliveries} deliveries: {detail}")]
    Poison { deliveries: u64, detail: String },
}

impl PipelineError {
    /// Whether a retry can reasonably succeed without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::TransientIo(_))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::TransientIo(e.to_string())
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(ref code, _)
                if code.code == rusqlite::ErrorCode::DatabaseBusy
                    || code.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                PipelineError::TransientIo(e.to_string())
            }
            other => PipelineError::Validation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(PipelineError::TransientIo("disk".into()).is_transient());
        assert!(!PipelineError::Config("bad port".into()).is_transient());
        assert!(!PipelineError::Validation("no payload".into()).is_transient());
    }

    #[test]
    fn io_errors_map_to_transient() {
        let e: PipelineError =
            std::io::Error::new(std::io::ErrorKind::WouldBlock, "busy").into();
        assert!(e.is_transient());
    }
}
