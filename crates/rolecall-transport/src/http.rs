//! HTTP request/response transport.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use rolecall_core::config::Config;
use rolecall_core::error::{Result, RoleCallError};
use rolecall_core::protocol::{
    role_path, ChatTextReply, ChatTextRequest, HealthStatus, CHAT_TEXT_PATH, HEALTH_PATH,
    ROLES_PATH,
};
use rolecall_core::types::Role;

use crate::ChatBackend;

pub struct HttpTransport {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.server().base_url, config.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Bound a request future by the configured timeout.
    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RoleCallError::Timeout(self.timeout)),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        debug!(%url, "GET");
        let resp = self.client.get(&url).send().await.map_err(network_error)?;
        decode(resp).await
    }

    /// `GET /api/roles/{id}`.
    pub async fn get_role(&self, role_id: &str) -> Result<Role> {
        self.bounded(self.get_json(&role_path(role_id))).await
    }

    /// `GET /health`.
    pub async fn health(&self) -> Result<HealthStatus> {
        self.bounded(self.get_json(HEALTH_PATH)).await
    }
}

fn network_error(e: reqwest::Error) -> RoleCallError {
    RoleCallError::Network(e.to_string())
}

/// Check the status, then decode the JSON body.
async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        warn!(%status, "Request failed");
        return Err(RoleCallError::Network(format!("HTTP {status}: {body}")));
    }
    resp.json::<T>()
        .await
        .map_err(|e| RoleCallError::Decode(e.to_string()))
}

#[async_trait]
impl ChatBackend for HttpTransport {
    async fn list_roles(&self) -> Result<Vec<Role>> {
        let roles: Vec<Role> = self.bounded(self.get_json(ROLES_PATH)).await?;
        debug!(count = roles.len(), "Fetched roles");
        Ok(roles)
    }

    async fn request_reply(&self, role_id: &str, message: &str) -> Result<String> {
        let url = self.url(CHAT_TEXT_PATH);
        let body = ChatTextRequest {
            role_id: role_id.to_string(),
            message: message.to_string(),
        };
        debug!(%url, role_id, len = message.len(), "POST chat text");

        self.bounded(async {
            let resp = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(network_error)?;
            let reply: ChatTextReply = decode(resp).await?;
            Ok(reply.reply)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash() {
        let transport = HttpTransport::new("http://localhost:8000/", Duration::from_secs(15));
        assert_eq!(transport.base_url(), "http://localhost:8000");
        assert_eq!(transport.url(ROLES_PATH), "http://localhost:8000/api/roles/");
    }

    #[test]
    fn test_from_config_uses_timeout() {
        let transport = HttpTransport::from_config(&Config::default());
        assert_eq!(transport.timeout, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let transport =
            HttpTransport::new(&format!("http://127.0.0.1:{port}"), Duration::from_secs(2));
        let err = transport.list_roles().await.unwrap_err();
        assert_eq!(err.kind(), "network");
    }
}
