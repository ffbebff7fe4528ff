//! Transport to the heartbeat service.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use lockguard_types::EventKind;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::debug;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};

/// Longest error body kept in an error.
const MAX_ERROR_BODY: usize = 512;

/// Delivers a recorded event payload and returns the raw response body.
#[async_trait]
pub trait HeartbeatTransport: Send + Sync {
    async fn send(&self, kind: EventKind, payload: &str) -> Result<String>;
}

/// HTTP transport.
pub struct HttpHeartbeatTransport {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    api_key_header: String,
    heartbeat_path: String,
    tamper_signal_path: String,
}

impl HttpHeartbeatTransport {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(SyncError::Config("sync endpoint is empty".into()));
        }
        let client = Client::builder().timeout(config.request_timeout()).build()?;

        Ok(Self {
            client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_key_header: config.api_key_header.clone(),
            heartbeat_path: config.heartbeat_path.clone(),
            tamper_signal_path: config.tamper_signal_path.clone(),
        })
    }

    fn url(&self, kind: EventKind) -> String {
        let path = match kind {
            EventKind::Heartbeat => &self.heartbeat_path,
            EventKind::TamperSignal => &self.tamper_signal_path,
        };
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl HeartbeatTransport for HttpHeartbeatTransport {
    async fn send(&self, kind: EventKind, payload: &str) -> Result<String> {
        let url = self.url(kind);
        let mut request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(payload.to_string());
        if let Some(key) = &self.api_key {
            request = request.header(self.api_key_header.as_str(), key.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(url = %url, status = status.as_u16(), "Heartbeat service responded");

        if status.is_success() {
            Ok(body)
        } else {
            let mut body = body;
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            Err(SyncError::Http {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Scripted reply for [`ScriptedTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    /// Successful response with this body.
    Body(String),
    /// Connection failure.
    Unreachable,
    /// Non-success HTTP status.
    Status(u16),
    /// Never responds.
    Hang,
}

/// Transport that replays scripted replies and records every request.
///
/// Once the script is exhausted every request gets the fallback reply.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<ScriptedReply>>,
    fallback: Mutex<ScriptedReply>,
    sent: Mutex<Vec<(EventKind, String)>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    /// Transport that acknowledges everything with an empty body.
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(ScriptedReply::Body(String::new())),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, reply: ScriptedReply) {
        lock(&self.script).push_back(reply);
    }

    pub fn set_fallback(&self, reply: ScriptedReply) {
        *lock(&self.fallback) = reply;
    }

    /// Requests that reached the transport, in order.
    pub fn sent(&self) -> Vec<(EventKind, String)> {
        lock(&self.sent).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl HeartbeatTransport for ScriptedTransport {
    async fn send(&self, kind: EventKind, payload: &str) -> Result<String> {
        let reply = {
            let next = lock(&self.script).pop_front();
            next.unwrap_or_else(|| lock(&self.fallback).clone())
        };
        lock(&self.sent).push((kind, payload.to_string()));

        match reply {
            ScriptedReply::Body(body) => Ok(body),
            ScriptedReply::Unreachable => Err(SyncError::Transport("network unreachable".into())),
            ScriptedReply::Status(status) => Err(SyncError::Http {
                status,
                body: String::new(),
            }),
            ScriptedReply::Hang => {
                std::future::pending::<()>().await;
                Err(SyncError::Transport("unreachable".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_transport_normalizes_endpoint() {
        let config = SyncConfig {
            endpoint: "https://lender.example/".to_string(),
            ..SyncConfig::default()
        };
        let transport = HttpHeartbeatTransport::new(&config).unwrap();
        assert_eq!(
            transport.url(EventKind::Heartbeat),
            "https://lender.example/api/devices/heartbeat/"
        );
        assert_eq!(
            transport.url(EventKind::TamperSignal),
            "https://lender.example/api/devices/tamper-signal/"
        );
    }

    #[test]
    fn test_http_transport_rejects_empty_endpoint() {
        let config = SyncConfig {
            endpoint: "  ".to_string(),
            ..SyncConfig::default()
        };
        assert!(matches!(
            HttpHeartbeatTransport::new(&config),
            Err(SyncError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_scripted_transport_replays_in_order() {
        let transport = ScriptedTransport::new();
        transport.push(ScriptedReply::Unreachable);
        transport.push(ScriptedReply::Body("{\"isLocked\":false}".into()));

        assert!(transport.send(EventKind::Heartbeat, "a").await.is_err());
        assert_eq!(
            transport.send(EventKind::Heartbeat, "b").await.unwrap(),
            "{\"isLocked\":false}"
        );
        assert_eq!(transport.send(EventKind::Heartbeat, "c").await.unwrap(), "");
        assert_eq!(transport.sent().len(), 3);
    }
}
