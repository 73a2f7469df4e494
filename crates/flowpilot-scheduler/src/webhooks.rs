// Webhook registry and authentication
//
// Maps URL paths to workflows with optional shared secrets. Secrets declared
// as `${VAR}` are resolved from the process environment at registration
// time. Authentication accepts either an exact `X-Webhook-Secret` value or a
// GitHub-style `X-Hub-Signature-256` HMAC; both comparisons are constant
// time.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use flowpilot_core::trigger::normalize_webhook_path;

type HmacSha256 = Hmac<Sha256>;

/// One registered webhook target.
#[derive(Debug, Clone)]
pub struct WebhookEntry {
    pub workflow_name: String,
    pub workflow_path: String,
    secret: Option<String>,
}

/// Listing view of a webhook (never exposes the secret).
#[derive(Debug, Clone, Serialize)]
pub struct WebhookInfo {
    pub path: String,
    pub workflow_name: String,
    pub has_secret: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookAuthError {
    #[error("webhook not found")]
    NotFound,

    #[error("invalid secret")]
    InvalidSecret,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("authentication required")]
    MissingAuth,
}

/// Resolve `${VAR}` secrets from the environment; anything else passes
/// through literally. An unset variable resolves to no secret.
fn resolve_secret(secret: Option<&str>) -> Option<String> {
    let secret = secret?;
    if let Some(var) = secret.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        return std::env::var(var).ok();
    }
    Some(secret.to_string())
}

/// Verify a GitHub-style `sha256=<hex>` HMAC signature over the raw body.
pub fn verify_signature(body: &[u8], secret: &str, signature: &str) -> bool {
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Path-keyed webhook registry.
#[derive(Debug, Default)]
pub struct WebhookRegistry {
    hooks: RwLock<HashMap<String, WebhookEntry>>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a webhook path for a workflow. Replaces any previous
    /// registration at the same path.
    pub fn register(
        &self,
        path: &str,
        workflow_name: &str,
        workflow_path: &str,
        secret: Option<&str>,
    ) -> String {
        let path = normalize_webhook_path(path);
        let resolved = resolve_secret(secret);
        tracing::info!(
            workflow = workflow_name,
            path = %path,
            auth = if resolved.is_some() { "enabled" } else { "disabled" },
            "registered webhook"
        );
        self.hooks.write().insert(
            path.clone(),
            WebhookEntry {
                workflow_name: workflow_name.to_string(),
                workflow_path: workflow_path.to_string(),
                secret: resolved,
            },
        );
        format!("webhook:{workflow_name}:{path}")
    }

    /// Remove every webhook registered for a workflow.
    pub fn unregister(&self, workflow_name: &str) -> bool {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|_, entry| entry.workflow_name != workflow_name);
        before != hooks.len()
    }

    /// Authenticate an incoming request and return the target workflow.
    pub fn authorize(
        &self,
        path: &str,
        secret_header: Option<&str>,
        signature_header: Option<&str>,
        body: &[u8],
    ) -> Result<WebhookEntry, WebhookAuthError> {
        let path = normalize_webhook_path(path);
        let entry = self
            .hooks
            .read()
            .get(&path)
            .cloned()
            .ok_or(WebhookAuthError::NotFound)?;

        let Some(secret) = &entry.secret else {
            return Ok(entry);
        };

        if let Some(provided) = secret_header {
            let matches: bool = provided
                .as_bytes()
                .ct_eq(secret.as_bytes())
                .into();
            if matches {
                return Ok(entry);
            }
            tracing::warn!(path = %path, "webhook secret mismatch");
            return Err(WebhookAuthError::InvalidSecret);
        }

        if let Some(signature) = signature_header {
            if verify_signature(body, secret, signature) {
                return Ok(entry);
            }
            tracing::warn!(path = %path, "webhook signature mismatch");
            return Err(WebhookAuthError::InvalidSignature);
        }

        tracing::warn!(path = %path, "webhook request missing authentication");
        Err(WebhookAuthError::MissingAuth)
    }

    pub fn get(&self, workflow_name: &str) -> Option<WebhookInfo> {
        self.hooks
            .read()
            .iter()
            .find(|(_, entry)| entry.workflow_name == workflow_name)
            .map(|(path, entry)| WebhookInfo {
                path: path.clone(),
                workflow_name: entry.workflow_name.clone(),
                has_secret: entry.secret.is_some(),
            })
    }

    pub fn list(&self) -> Vec<WebhookInfo> {
        let mut infos: Vec<WebhookInfo> = self
            .hooks
            .read()
            .iter()
            .map(|(path, entry)| WebhookInfo {
                path: path.clone(),
                workflow_name: entry.workflow_name.clone(),
                has_secret: entry.secret.is_some(),
            })
            .collect();
        infos.sort_by(|a, b| a.path.cmp(&b.path));
        infos
    }
}
