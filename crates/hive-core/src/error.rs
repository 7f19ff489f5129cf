//! Client-facing error codes and the internal error type for
//! subscription handling.

use thiserror::Error;

/// Numeric result codes returned to clients in subscribe/unsubscribe
/// replies (and produced by notifier `validate` responses).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SubscribeCode {
    Ok = 0,
    /// Unparseable input, invalid values, missing required arguments.
    BadInput = 1,
    /// The requested notification service is not registered.
    ServiceNotAvailable = 2,
    /// The notifier backend did not respond in time.
    ServiceTimeout = 3,
    /// Signature failure, oversized fields, or another domain error.
    Error = 4,
    /// Something went wrong inside the relay itself.
    InternalError = 5,
}

impl SubscribeCode {
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            1 => Some(Self::BadInput),
            2 => Some(Self::ServiceNotAvailable),
            3 => Some(Self::ServiceTimeout),
            4 => Some(Self::Error),
            5 => Some(Self::InternalError),
            _ => None,
        }
    }
}

/// A subscribe/unsubscribe failure carrying the code reported to the
/// client and a human-readable message.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SubscribeError {
    pub code: SubscribeCode,
    pub message: String,
}

impl SubscribeError {
    pub fn new(code: SubscribeCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_input(message: impl Into<String>) -> Self {
        Self::new(SubscribeCode::BadInput, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(SubscribeCode::Error, message)
    }

    /// The JSON error body sent to the client.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "error": self.code as i32, "message": self.message })
    }
}

impl From<hive_crypto::SignatureError> for SubscribeError {
    fn from(err: hive_crypto::SignatureError) -> Self {
        Self::error(err.to_string())
    }
}

impl From<crate::store::StoreError> for SubscribeError {
    fn from(err: crate::store::StoreError) -> Self {
        Self::error(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trip() {
        for code in [
            SubscribeCode::Ok,
            SubscribeCode::BadInput,
            SubscribeCode::ServiceNotAvailable,
            SubscribeCode::ServiceTimeout,
            SubscribeCode::Error,
            SubscribeCode::InternalError,
        ] {
            assert_eq!(SubscribeCode::from_i32(code as i32), Some(code));
        }
        assert_eq!(SubscribeCode::from_i32(42), None);
    }

    #[test]
    fn json_body_shape() {
        let err = SubscribeError::bad_input("namespaces missing or empty");
        let body = err.to_json();
        assert_eq!(body["error"], 1);
        assert_eq!(body["message"], "namespaces missing or empty");
    }
}
