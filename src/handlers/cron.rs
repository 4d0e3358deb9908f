//! Cron trigger handler.
//!
//! `offmarket.cron.run` lets the gateway (or an operator) kick a sweep on
//! demand. Requests pass through the api-class rate limiter first; a denied
//! request gets a `RATE_LIMITED` error carrying the quota state the gateway
//! needs to build its 429.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::services::cron::{CronJob, CronRunner};
use crate::services::logger::BufferedLogger;
use crate::services::rate_limit::{request_identity, RateLimitService, RouteClass};
use crate::types::{ErrorResponse, LogContext, Request, SuccessResponse};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronRunPayload {
    pub job: String,
}

/// Handle offmarket.cron.run requests
pub async fn handle_run(
    client: Client,
    mut subscriber: Subscriber,
    runner: Arc<CronRunner>,
    rate_limiter: Arc<RateLimitService>,
    logger: Arc<BufferedLogger>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let request: Request<CronRunPayload> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse cron run request: {}", e);
                let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };

        let user_id = request.user_id.map(|u| u.to_string());
        let identity = request_identity(
            user_id.as_deref(),
            request.forwarded_for.as_deref(),
            request.real_ip.as_deref(),
        );

        let mut ctx = LogContext::for_request(request.id.to_string());
        if let Some(ref user) = user_id {
            ctx = ctx.with_user(user.clone());
        }
        let scoped = logger.scoped(ctx.with_component("cron_handler"));

        let decision = rate_limiter.evaluate(&identity, RouteClass::Api);
        if !decision.allowed {
            let message = decision
                .message
                .clone()
                .unwrap_or_else(|| "Rate limit exceeded".to_string());
            let details =
                serde_json::to_value(&decision).unwrap_or_else(|_| serde_json::json!({}));
            let error = ErrorResponse::new(request.id, "RATE_LIMITED", message)
                .with_details(details);
            let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
            continue;
        }

        let job = match CronJob::parse(&request.payload.job) {
            Some(job) => job,
            None => {
                let error = ErrorResponse::new(
                    request.id,
                    "UNKNOWN_JOB",
                    format!(
                        "Unknown job '{}', expected one of: enrichments, emails, maintenance, reports, all",
                        request.payload.job
                    ),
                );
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };

        let started = Instant::now();
        let outcome = runner.run_job(job).await;
        scoped.api(
            "RUN",
            &format!("cron/{}", job.as_str()),
            200,
            started.elapsed().as_millis() as u64,
            None,
        );

        let success = SuccessResponse::new(request.id, outcome);
        let _ = client.publish(reply, serde_json::to_vec(&success)?.into()).await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cron_run_payload_parses_camel_case() {
        let raw = serde_json::json!({
            "id": Uuid::new_v4(),
            "timestamp": chrono::Utc::now(),
            "forwardedFor": "203.0.113.9, 10.0.0.1",
            "payload": { "job": "reports" }
        });
        let request: Request<CronRunPayload> = serde_json::from_value(raw).unwrap();
        assert_eq!(request.payload.job, "reports");
        assert_eq!(request.forwarded_for.as_deref(), Some("203.0.113.9, 10.0.0.1"));
        assert!(request.user_id.is_none());
    }
}
