//! NATS message envelopes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generic request wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request<T> {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Authenticated caller, when the gateway resolved one.
    #[serde(default)]
    pub user_id: Option<Uuid>,
    /// Best-effort client address forwarded by the gateway.
    #[serde(default)]
    pub forwarded_for: Option<String>,
    #[serde(default)]
    pub real_ip: Option<String>,
    pub payload: T,
}

impl<T> Request<T> {
    pub fn new(payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            user_id: None,
            forwarded_for: None,
            real_ip: None,
            payload,
        }
    }

    pub fn with_user(user_id: Uuid, payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            user_id: Some(user_id),
            forwarded_for: None,
            real_ip: None,
            payload,
        }
    }
}

/// Generic success response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessResponse<T> {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: T,
}

impl<T> SuccessResponse<T> {
    pub fn new(request_id: Uuid, payload: T) -> Self {
        Self {
            id: request_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(request_id: Uuid, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: request_id,
            timestamp: Utc::now(),
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error.details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_constructors_set_identity() {
        let anon = Request::new("payload");
        assert!(anon.user_id.is_none());

        let user = Uuid::new_v4();
        let authed = Request::with_user(user, "payload");
        assert_eq!(authed.user_id, Some(user));
        assert_ne!(anon.id, authed.id);
    }

    #[test]
    fn test_error_response_serializes_details() {
        let error = ErrorResponse::new(Uuid::new_v4(), "RATE_LIMITED", "slow down")
            .with_details(serde_json::json!({ "retryAfterSecs": 30 }));

        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["error"]["code"], "RATE_LIMITED");
        assert_eq!(value["error"]["details"]["retryAfterSecs"], 30);
    }
}
