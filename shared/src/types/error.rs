//! Error kinds shared by the scheduler, the machine pool and the result server

use thiserror::Error;

/// How far an error is allowed to travel before it is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The process cannot proceed; unwinds to startup and exits.
    Fatal,
    /// Recoverable and local to one scheduler tick or one analysis.
    Operational,
    /// Local to one result server connection.
    Protocol,
    /// Peer closed or cancellation requested. Not a failure.
    Disconnect,
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Critical error: {0}")]
    Critical(String),

    #[error("Startup error: {0}")]
    Startup(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Operational error: {0}")]
    Operational(String),

    #[error("Machine error: {0}")]
    Machine(String),

    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error("Guest error: {0}")]
    Guest(String),

    #[error("Result server error: {0}")]
    Result(String),

    #[error("Disconnected")]
    Disconnect,
}

impl DetectorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DetectorError::Critical(_) | DetectorError::Startup(_) | DetectorError::Database(_) => {
                ErrorClass::Fatal
            }
            DetectorError::Operational(_)
            | DetectorError::Machine(_)
            | DetectorError::Analysis(_)
            | DetectorError::Guest(_) => ErrorClass::Operational,
            DetectorError::Result(_) => ErrorClass::Protocol,
            DetectorError::Disconnect => ErrorClass::Disconnect,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, DetectorError::Disconnect)
    }
}

impl From<std::io::Error> for DetectorError {
    fn from(err: std::io::Error) -> Self {
        DetectorError::Operational(err.to_string())
    }
}

impl From<sqlx::Error> for DetectorError {
    fn from(err: sqlx::Error) -> Self {
        DetectorError::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(DetectorError::Critical("x".to_string()).class(), ErrorClass::Fatal);
        assert_eq!(DetectorError::Startup("x".to_string()).class(), ErrorClass::Fatal);
        assert_eq!(DetectorError::Machine("x".to_string()).class(), ErrorClass::Operational);
        assert_eq!(DetectorError::Result("x".to_string()).class(), ErrorClass::Protocol);
        assert_eq!(DetectorError::Disconnect.class(), ErrorClass::Disconnect);
    }

    #[test]
    fn test_only_fatal_class_is_fatal() {
        assert!(DetectorError::Database("x".to_string()).is_fatal());
        assert!(!DetectorError::Guest("x".to_string()).is_fatal());
        assert!(!DetectorError::Result("x".to_string()).is_fatal());
        assert!(!DetectorError::Disconnect.is_fatal());
    }

    #[test]
    fn test_io_error_is_operational() {
        let err: DetectorError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert_eq!(err.class(), ErrorClass::Operational);
    }
}
