//! Webhook signature verification and event handling.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{PlatformError, WebhookError};
use crate::model::{IngestJob, IngestTrigger};
use crate::priority_queue::Priority;

type HmacSha256 = Hmac<Sha256>;

/// What an inbound webhook delivery resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAction {
    /// A `workflow_run` reached `completed`; ingest its artifacts.
    Ingest(IngestJob),
    /// The event was verified but isn't one FlakeGuard acts on.
    Ignored,
}

#[derive(Debug, Deserialize)]
struct WorkflowRunEnvelope {
    action: String,
    workflow_run: WorkflowRunBody,
    repository: RepositoryBody,
}

#[derive(Debug, Deserialize)]
struct WorkflowRunBody {
    id: i64,
    status: String,
}

#[derive(Debug, Deserialize)]
struct RepositoryBody {
    name: String,
    full_name: String,
    owner: OwnerBody,
}

#[derive(Debug, Deserialize)]
struct OwnerBody {
    login: String,
}

/// Verifies and decodes one webhook delivery, returning the
/// [`WebhookAction`] it implies.
///
/// Only a `workflow_run` event whose `action` and nested run `status`
/// are both `"completed"` yields [`WebhookAction::Ingest`]; every other
/// well-formed event is acknowledged as [`WebhookAction::Ignored`] so
/// the caller can still respond 200 without an ingestion side effect.
///
/// # Errors
/// Returns [`WebhookError::Verification`] if the signature doesn't
/// match, or [`WebhookError::MalformedPayload`] if the body isn't valid
/// JSON in the expected `workflow_run` event shape.
pub fn handle(body: &[u8], signature_header: &str, secret: &[u8]) -> Result<WebhookAction, WebhookError> {
    verify_signature(secret, body, signature_header)?;

    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| WebhookError::malformed_payload(e.to_string()))?;

    if value.get("workflow_run").is_none() {
        return Ok(WebhookAction::Ignored);
    }

    let envelope: WorkflowRunEnvelope =
        serde_json::from_value(value).map_err(|e| WebhookError::malformed_payload(e.to_string()))?;

    if envelope.action != "completed" || envelope.workflow_run.status != "completed" {
        return Ok(WebhookAction::Ignored);
    }

    let correlation_id = format!("webhook-{}-{}", envelope.repository.full_name, envelope.workflow_run.id);
    Ok(WebhookAction::Ingest(IngestJob {
        provider: "github".to_string(),
        owner: envelope.repository.owner.login,
        name: envelope.repository.name,
        workflow_run_external_id: envelope.workflow_run.id.to_string(),
        priority: Priority::Normal,
        correlation_id,
        trigger: IngestTrigger::Webhook,
    }))
}

/// Verifies a `sha256=<hex>`-formatted webhook signature against `body`
/// using `secret`, comparing in constant time.
///
/// # Errors
/// Returns [`PlatformError::WebhookVerificationFailed`] if the header is
/// malformed, the hex digest doesn't decode, or the digest doesn't match.
pub fn verify_signature(secret: &[u8], body: &[u8], signature_header: &str) -> Result<(), PlatformError> {
    let hex_digest = signature_header
        .strip_prefix("sha256=")
        .ok_or(PlatformError::WebhookVerificationFailed)?;

    let expected = hex::decode(hex_digest).map_err(|_| PlatformError::WebhookVerificationFailed)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| PlatformError::WebhookVerificationFailed)?;
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    // Length check first: ct_eq on mismatched lengths panics for some
    // implementations and always fails regardless, so short-circuit.
    if computed.len() != expected.len() {
        return Err(PlatformError::WebhookVerificationFailed);
    }
    if computed.as_slice().ct_eq(&expected).into() {
        Ok(())
    } else {
        Err(PlatformError::WebhookVerificationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &[u8], body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_verifies() {
        let secret = b"webhook-secret";
        let body = b"{\"action\":\"completed\"}";
        let header = sign(secret, body);
        assert!(verify_signature(secret, body, &header).is_ok());
    }

    #[test]
    fn tampered_body_fails() {
        let secret = b"webhook-secret";
        let header = sign(secret, b"original");
        let result = verify_signature(secret, b"tampered", &header);
        assert!(matches!(result, Err(PlatformError::WebhookVerificationFailed)));
    }

    #[test]
    fn missing_prefix_fails() {
        let result = verify_signature(b"secret", b"body", "not-a-valid-header");
        assert!(result.is_err());
    }

    #[test]
    fn wrong_secret_fails() {
        let header = sign(b"correct-secret", b"body");
        let result = verify_signature(b"wrong-secret", b"body", &header);
        assert!(result.is_err());
    }

    const SECRET: &[u8] = b"webhook-secret";

    fn completed_run_body() -> Vec<u8> {
        serde_json::json!({
            "action": "completed",
            "workflow_run": {"id": 42, "status": "completed"},
            "repository": {"name": "widgets", "full_name": "acme/widgets", "owner": {"login": "acme"}},
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn completed_workflow_run_yields_ingest_job() {
        let body = completed_run_body();
        let header = sign(SECRET, &body);
        let action = handle(&body, &header, SECRET).unwrap();
        match action {
            WebhookAction::Ingest(job) => {
                assert_eq!(job.owner, "acme");
                assert_eq!(job.name, "widgets");
                assert_eq!(job.workflow_run_external_id, "42");
                assert_eq!(job.trigger, IngestTrigger::Webhook);
            }
            WebhookAction::Ignored => panic!("expected an ingest job"),
        }
    }

    #[test]
    fn in_progress_workflow_run_is_ignored() {
        let body = serde_json::json!({
            "action": "in_progress",
            "workflow_run": {"id": 42, "status": "in_progress"},
            "repository": {"name": "widgets", "full_name": "acme/widgets", "owner": {"login": "acme"}},
        })
        .to_string()
        .into_bytes();
        let header = sign(SECRET, &body);
        assert_eq!(handle(&body, &header, SECRET).unwrap(), WebhookAction::Ignored);
    }

    #[test]
    fn non_workflow_run_event_is_ignored() {
        let body = serde_json::json!({"zen": "keep it logically awesome"}).to_string().into_bytes();
        let header = sign(SECRET, &body);
        assert_eq!(handle(&body, &header, SECRET).unwrap(), WebhookAction::Ignored);
    }

    #[test]
    fn bad_signature_is_rejected_before_parsing() {
        let body = completed_run_body();
        let result = handle(&body, "sha256=deadbeef", SECRET);
        assert!(matches!(result, Err(WebhookError::Verification(_))));
    }

    #[test]
    fn malformed_workflow_run_payload_is_rejected() {
        let body = serde_json::json!({"action": "completed", "workflow_run": {"status": "completed"}})
            .to_string()
            .into_bytes();
        let header = sign(SECRET, &body);
        assert!(matches!(handle(&body, &header, SECRET), Err(WebhookError::MalformedPayload { .. })));
    }
}
