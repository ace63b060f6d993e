//! Structured errors returned by the cloud API

use thiserror::Error;

/// Reason attached to a 400 when a resource is still referenced by another one.
pub const REASON_IN_USE: &str = "resourceInUseByAnotherResource";

pub type Result<T> = std::result::Result<T, CloudError>;

/// Error returned by every cloud call. The code follows HTTP semantics so a
/// 404 can be told apart from everything else.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cloud error {code}: {message}")]
pub struct CloudError {
    /// HTTP-style status code
    pub code: u16,
    /// Machine readable reason, when the API provides one
    pub reason: Option<String>,
    /// Human readable message
    pub message: String,
}

impl CloudError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            reason: None,
            message: message.into(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(404, format!("{} not found", what.into()))
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(409, message)
    }

    /// A 400 flagged as "still referenced by another resource".
    pub fn in_use(what: impl Into<String>) -> Self {
        Self::new(400, format!("{} is in use by another resource", what.into()))
            .with_reason(REASON_IN_USE)
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(403, message).with_reason("quotaExceeded")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    pub fn is_http_code(&self, code: u16) -> bool {
        self.code == code
    }

    pub fn is_not_found(&self) -> bool {
        self.code == 404
    }

    pub fn is_bad_request(&self) -> bool {
        self.code == 400
    }

    pub fn is_conflict(&self) -> bool {
        self.code == 409
    }

    pub fn is_in_use(&self) -> bool {
        self.code == 400 && self.reason.as_deref() == Some(REASON_IN_USE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(CloudError::not_found("backend k8s-be-80").is_not_found());
        assert!(CloudError::conflict("exists").is_conflict());

        let in_use = CloudError::in_use("instance group k8s-ig");
        assert!(in_use.is_in_use());
        assert!(in_use.is_bad_request());
        assert!(!CloudError::bad_request("invalid mode").is_in_use());
    }

    #[test]
    fn test_display() {
        let err = CloudError::not_found("url map k8s-um-foo");
        assert_eq!(err.to_string(), "cloud error 404: url map k8s-um-foo not found");
    }
}
