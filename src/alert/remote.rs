//! Alert forwarding to a peer watchdog instance.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::health::Status;
use crate::config::RemoteSettings;

pub const PEER_IDENTITY_HEADER: &str = "x-peer-identity";
pub const SERVER_KEY_HEADER: &str = "x-server-key";

/// Failure to reach or talk to the remote peer.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("remote peer timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote peer unreachable: {0}")]
    Unreachable(String),
    #[error("remote peer rejected request with status {status}")]
    Rejected { status: u16 },
}

impl ConnectError {
    fn from_reqwest(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            ConnectError::Timeout(timeout)
        } else {
            ConnectError::Unreachable(e.to_string())
        }
    }
}

/// Body of a forwarded alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteAlert {
    pub alert_key: String,
    pub status: Status,
}

/// Entry point for establishing a [`RemoteConnection`].
pub struct RemotePeer;

impl RemotePeer {
    /// Connect to the peer and verify it answers its health endpoint.
    pub async fn connect(
        settings: &RemoteSettings,
        identity: &str,
        timeout: Duration,
    ) -> Result<RemoteConnection, ConnectError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;

        let base_url = settings.vip_address.trim_end_matches('/').to_string();
        let response = client
            .get(format!("{}/api/health", base_url))
            .send()
            .await
            .map_err(|e| ConnectError::from_reqwest(e, timeout))?;

        if !response.status().is_success() {
            return Err(ConnectError::Rejected {
                status: response.status().as_u16(),
            });
        }

        tracing::info!("Connected to remote peer {} at {}", settings.identity, base_url);

        Ok(RemoteConnection {
            client,
            base_url,
            identity: identity.to_string(),
            serverkey: settings.serverkey.clone(),
            timeout,
        })
    }
}

/// A verified connection to the peer.
pub struct RemoteConnection {
    client: reqwest::Client,
    base_url: String,
    identity: String,
    serverkey: String,
    timeout: Duration,
}

impl RemoteConnection {
    pub async fn send_alert(&self, alert_key: &str, status: &Status) -> Result<(), ConnectError> {
        let body = RemoteAlert {
            alert_key: alert_key.to_string(),
            status: status.clone(),
        };

        let response = self
            .client
            .post(format!("{}/api/health/alert", self.base_url))
            .header(PEER_IDENTITY_HEADER, &self.identity)
            .header(SERVER_KEY_HEADER, &self.serverkey)
            .json(&body)
            .send()
            .await
            .map_err(|e| ConnectError::from_reqwest(e, self.timeout))?;

        if !response.status().is_success() {
            return Err(ConnectError::Rejected {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let settings = RemoteSettings {
            identity: "peer".to_string(),
            serverkey: "key".to_string(),
            vip_address: "http://127.0.0.1:1".to_string(),
        };
        let result = RemotePeer::connect(&settings, "me", Duration::from_millis(500)).await;
        assert!(result.is_err());
    }
}
