use std::fmt;

/// Coarse error taxonomy shared by the API client, validator, and queue
/// drainer. The `kind` drives retry policy; `message`/`suggestions` are
/// surfaced to the shell as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    Auth,
    NameConflict,
    Network,
    FileAccess,
    SyncConflict,
    Validation,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct SyncError {
    pub kind: SyncErrorKind,
    pub message: String,
    pub suggestions: Vec<String>,
    pub status_code: Option<u16>,
}

impl SyncError {
    pub fn new(kind: SyncErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            suggestions: Vec::new(),
            status_code: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Auth, message)
    }

    pub fn name_conflict(message: impl Into<String>, suggestions: Vec<String>) -> Self {
        Self::new(SyncErrorKind::NameConflict, message).with_suggestions(suggestions)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Network, message)
    }

    pub fn file_access(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::FileAccess, message)
    }

    pub fn sync_conflict(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::SyncConflict, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Validation, message)
    }

    /// Maps an HTTP status code and parsed body into the taxonomy, per the
    /// error body shape `{msg|message|error|details}` the remote returns.
    pub fn from_status(status: u16, message: impl Into<String>, suggestions: Vec<String>) -> Self {
        let kind = match status {
            401 | 403 => SyncErrorKind::Auth,
            409 => SyncErrorKind::NameConflict,
            422 => SyncErrorKind::Validation,
            s if (500..600).contains(&s) => SyncErrorKind::Network,
            _ => SyncErrorKind::Unknown,
        };
        Self::new(kind, message)
            .with_status(status)
            .with_suggestions(suggestions)
    }

    /// Retry policy table from the error handling design: network failures
    /// are retryable with backoff, everything else surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, SyncErrorKind::Network)
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(code) = self.status_code {
            write!(f, " (status {code})")?;
        }
        Ok(())
    }
}

impl std::error::Error for SyncError {}

/// Pulls a `SyncError` out of an `anyhow::Error` chain, if one was attached
/// by the API client or validator, so callers can branch on `kind` without
/// re-parsing messages.
pub fn downcast(err: &anyhow::Error) -> Option<&SyncError> {
    err.downcast_ref::<SyncError>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_errors_are_retryable() {
        let err = SyncError::network("connection reset");
        assert!(err.is_retryable());
    }

    #[test]
    fn auth_and_conflict_errors_are_not_retryable() {
        assert!(!SyncError::auth("bad key").is_retryable());
        assert!(!SyncError::name_conflict("taken", vec![]).is_retryable());
        assert!(!SyncError::validation("bad name").is_retryable());
    }

    #[test]
    fn from_status_maps_known_codes() {
        assert_eq!(
            SyncError::from_status(401, "nope", vec![]).kind,
            SyncErrorKind::Auth
        );
        assert_eq!(
            SyncError::from_status(409, "taken", vec![]).kind,
            SyncErrorKind::NameConflict
        );
        assert_eq!(
            SyncError::from_status(503, "down", vec![]).kind,
            SyncErrorKind::Network
        );
        assert_eq!(
            SyncError::from_status(418, "teapot", vec![]).kind,
            SyncErrorKind::Unknown
        );
    }

    #[test]
    fn downcast_recovers_the_typed_error_from_anyhow() {
        let err: anyhow::Error = SyncError::auth("expired").into();
        let recovered = downcast(&err).expect("typed error");
        assert_eq!(recovered.kind, SyncErrorKind::Auth);
    }
}
