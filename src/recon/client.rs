//! HTTP client for the recon service REST API

use super::{Endpoint, ReconApi, ReconEvent, SessionInfo};
use crate::{WatchError, WatchResult};
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{json, Value};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Basic-auth REST client bound to one service instance
pub struct HttpReconClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpReconClient {
    pub fn new(base_url: &str, username: &str, password: &str) -> WatchResult<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| WatchError::ToolUnknown(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> WatchResult<Value> {
        let response = request
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        decode(response).await
    }
}

async fn decode(response: Response) -> WatchResult<Value> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(WatchError::ToolProtocol {
            status: status.as_u16(),
            body: crate::error::truncate_message(&body, 500),
        });
    }

    if body.trim().is_empty() {
        return Ok(Value::Null);
    }

    serde_json::from_str(&body).map_err(|e| WatchError::ToolUnknown(format!("Invalid JSON from recon service: {}", e)))
}

#[async_trait]
impl ReconApi for HttpReconClient {
    async fn run_command(&self, cmd: &str) -> WatchResult<Value> {
        debug!("recon command @ {}: {}", self.base_url, cmd);
        self.send(self.http.post(self.url("/api/session")).json(&json!({ "cmd": cmd })))
            .await
    }

    async fn lan_hosts(&self) -> WatchResult<Vec<Endpoint>> {
        let value = self.send(self.http.get(self.url("/api/session/lan"))).await?;
        let hosts = value.get("hosts").cloned().unwrap_or(Value::Array(Vec::new()));
        Ok(serde_json::from_value(hosts)?)
    }

    async fn events(&self, limit: usize) -> WatchResult<Vec<ReconEvent>> {
        let value = self
            .send(self.http.get(self.url("/api/events")).query(&[("n", limit)]))
            .await?;
        match value {
            Value::Array(_) => Ok(serde_json::from_value(value)?),
            _ => Ok(Vec::new()),
        }
    }

    async fn session(&self) -> WatchResult<SessionInfo> {
        let value = self.send(self.http.get(self.url("/api/session"))).await?;
        Ok(SessionInfo::from_value(&value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalized() {
        let client = HttpReconClient::new("http://127.0.0.1:8081/", "user", "pass").unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:8081");
        assert_eq!(client.url("/api/session"), "http://127.0.0.1:8081/api/session");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_connection_error() {
        // port 9 on loopback: nothing listens, connect is refused immediately
        let client = HttpReconClient::new("http://127.0.0.1:9", "u", "p").unwrap();
        let err = client.run_command("net.probe on").await.unwrap_err();
        assert!(err.is_tool_error());
    }
}
