//! Ping handler for health checks

use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::services::rate_limit::{request_identity, RateLimitService, RouteClass};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PingRequest {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    forwarded_for: Option<String>,
    #[serde(default)]
    real_ip: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PongResponse {
    message: String,
    timestamp: String,
    rate_limit_remaining: u32,
}

/// Handle ping messages. Even health checks count against the (generous)
/// health-class quota so a runaway probe shows up in the logs.
pub async fn handle_ping(
    client: Client,
    mut subscriber: Subscriber,
    rate_limiter: Arc<RateLimitService>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        debug!("Received ping message");

        let reply = match msg.reply {
            Some(ref reply) => reply.clone(),
            None => {
                error!("Ping message without reply subject");
                continue;
            }
        };

        let request: PingRequest = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse ping request: {}", e);
                let error_response = serde_json::json!({
                    "error": {
                        "code": "INVALID_REQUEST",
                        "message": format!("Failed to parse request: {}", e)
                    }
                });
                let _ = client.publish(reply, error_response.to_string().into()).await;
                continue;
            }
        };

        let identity = request_identity(
            None,
            request.forwarded_for.as_deref(),
            request.real_ip.as_deref(),
        );
        let decision = rate_limiter.evaluate(&identity, RouteClass::Health);
        if !decision.allowed {
            let error_response = serde_json::json!({
                "error": {
                    "code": "RATE_LIMITED",
                    "message": decision.message.clone(),
                    "details": &decision,
                }
            });
            let _ = client.publish(reply, error_response.to_string().into()).await;
            continue;
        }

        let response = PongResponse {
            message: request
                .message
                .map(|m| format!("Pong: {}", m))
                .unwrap_or_else(|| "Pong".to_string()),
            timestamp: chrono::Utc::now().to_rfc3339(),
            rate_limit_remaining: decision.remaining,
        };

        let response_bytes = serde_json::to_vec(&response)?;
        client.publish(reply, response_bytes.into()).await?;

        debug!("Sent pong response");
    }

    Ok(())
}
