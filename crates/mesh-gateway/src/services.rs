//! Internet-side gateway services over HTTP and TCP

use anyhow::Context;
use async_trait::async_trait;
use mesh_core::{GatewayServices, MeshError, MeshResult};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::GatewayConfig;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct CashuRedeemRequest<'a> {
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct CashuRedeemResponse {
    #[serde(alias = "id", alias = "receipt")]
    reference: String,
}

/// [`GatewayServices`] backed by a mempool API, a Cashu relay and an MQTT broker
pub struct HttpGatewayServices {
    client: Client,
    mempool_url: String,
    cashu_relay_url: Option<String>,
    mqtt_broker: Option<String>,
    mqtt_timeout: Duration,
}

impl HttpGatewayServices {
    pub fn new(config: &GatewayConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            mempool_url: config.mempool_url.trim_end_matches('/').to_string(),
            cashu_relay_url: config.cashu_relay_url.clone(),
            mqtt_broker: config.mqtt_broker.clone(),
            mqtt_timeout: Duration::from_secs(config.mqtt_timeout_secs),
        })
    }
}

async fn error_body(response: reqwest::Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    format!("status {}: {}", status, text.trim())
}

#[async_trait]
impl GatewayServices for HttpGatewayServices {
    async fn test_mqtt_connection(&self) -> MeshResult<()> {
        let broker = self
            .mqtt_broker
            .as_deref()
            .ok_or_else(|| MeshError::ServiceUnavailable("no MQTT broker configured".into()))?;

        match tokio::time::timeout(self.mqtt_timeout, TcpStream::connect(broker)).await {
            Ok(Ok(_)) => {
                debug!(broker, "MQTT broker reachable");
                Ok(())
            }
            Ok(Err(e)) => Err(MeshError::TransportFailure(format!("{}: {}", broker, e))),
            Err(_) => Err(MeshError::TransportFailure(format!(
                "{}: no answer within {:?}",
                broker, self.mqtt_timeout
            ))),
        }
    }

    async fn broadcast_transaction(&self, tx_hex: &str) -> MeshResult<String> {
        let url = format!("{}/api/tx", self.mempool_url);

        let response = self
            .client
            .post(&url)
            .body(tx_hex.to_string())
            .send()
            .await
            .map_err(|e| MeshError::ServiceUnavailable(format!("Failed to reach mempool: {}", e)))?;

        if !response.status().is_success() {
            let detail = error_body(response).await;
            warn!(detail = %detail, "Mempool rejected transaction");
            return Err(MeshError::ServiceUnavailable(format!("mempool {}", detail)));
        }

        let txid = response
            .text()
            .await
            .map_err(|e| MeshError::ServiceUnavailable(format!("Failed to read mempool response: {}", e)))?
            .trim()
            .to_string();
        debug!(txid = %txid, "Transaction broadcast");
        Ok(txid)
    }

    async fn redeem_cashu_token(&self, token: &str) -> MeshResult<String> {
        let url = self
            .cashu_relay_url
            .as_deref()
            .ok_or_else(|| MeshError::ServiceUnavailable("no Cashu relay configured".into()))?;

        let response = self
            .client
            .post(url)
            .json(&CashuRedeemRequest { token })
            .send()
            .await
            .map_err(|e| MeshError::ServiceUnavailable(format!("Failed to reach Cashu relay: {}", e)))?;

        if !response.status().is_success() {
            let detail = error_body(response).await;
            warn!(detail = %detail, "Cashu relay rejected token");
            return Err(MeshError::ServiceUnavailable(format!("cashu relay {}", detail)));
        }

        let body: CashuRedeemResponse = response
            .json()
            .await
            .map_err(|e| MeshError::Serialization(format!("Failed to parse Cashu response: {}", e)))?;
        Ok(body.reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Accept one HTTP request, answer it, and hand back the request body
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    return String::new();
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + length {
                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{}",
                            status,
                            body.len(),
                            body
                        );
                        stream.write_all(response.as_bytes()).await.unwrap();
                        return text[header_end + 4..].to_string();
                    }
                }
            }
        });
        (url, handle)
    }

    fn config() -> GatewayConfig {
        GatewayConfig {
            mqtt_timeout_secs: 1,
            ..GatewayConfig::default()
        }
    }

    #[tokio::test]
    async fn test_broadcast_transaction_returns_txid() {
        let (url, server) = serve_once("200 OK", "abcd1234\n").await;
        let services = HttpGatewayServices::new(&GatewayConfig {
            mempool_url: format!("{}/", url),
            ..config()
        })
        .unwrap();

        let txid = services.broadcast_transaction("0200beef").await.unwrap();
        assert_eq!(txid, "abcd1234");
        assert_eq!(server.await.unwrap(), "0200beef");
    }

    #[tokio::test]
    async fn test_broadcast_rejection_surfaces_status() {
        let (url, _server) = serve_once("400 Bad Request", "bad-txns-inputs-missingorspent").await;
        let services = HttpGatewayServices::new(&GatewayConfig {
            mempool_url: url,
            ..config()
        })
        .unwrap();

        match services.broadcast_transaction("0200beef").await {
            Err(MeshError::ServiceUnavailable(detail)) => {
                assert!(detail.contains("400"));
                assert!(detail.contains("missingorspent"));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_redeem_cashu_token() {
        let (url, server) = serve_once("200 OK", r#"{"id":"receipt-42"}"#).await;
        let services = HttpGatewayServices::new(&GatewayConfig {
            cashu_relay_url: Some(url),
            ..config()
        })
        .unwrap();

        assert_eq!(services.redeem_cashu_token("cashuAbc").await.unwrap(), "receipt-42");
        let sent: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(sent["token"], "cashuAbc");
    }

    #[tokio::test]
    async fn test_unconfigured_services() {
        let services = HttpGatewayServices::new(&config()).unwrap();
        assert!(matches!(
            services.redeem_cashu_token("cashuAbc").await,
            Err(MeshError::ServiceUnavailable(_))
        ));
        assert!(matches!(
            services.test_mqtt_connection().await,
            Err(MeshError::ServiceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_mqtt_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker = listener.local_addr().unwrap().to_string();
        let services = HttpGatewayServices::new(&GatewayConfig {
            mqtt_broker: Some(broker),
            ..config()
        })
        .unwrap();
        services.test_mqtt_connection().await.unwrap();

        drop(listener);
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_addr = closed.local_addr().unwrap().to_string();
        drop(closed);
        let services = HttpGatewayServices::new(&GatewayConfig {
            mqtt_broker: Some(closed_addr),
            ..config()
        })
        .unwrap();
        assert!(matches!(
            services.test_mqtt_connection().await,
            Err(MeshError::TransportFailure(_))
        ));
    }
}
