use http_body_util::{BodyExt, Full};
use hyper::{
    body::Bytes,
    header::{AUTHORIZATION, CONTENT_TYPE},
    Request,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use serde_json::json;
use tracing::trace;

use super::RpcError;

/// HTTP client for the transaction submission relay.
///
/// The relay takes a signed transaction blob and forwards it to the network.
/// Any HTTP status is returned as a [`RelayResponse`]; only transport failures
/// are errors.
#[derive(Clone, Debug)]
pub struct RelayClient {
    client: Client<HttpConnector, Full<Bytes>>,
    url: hyper::Uri,
    api_key: Option<String>,
}

impl RelayClient {
    pub fn new(url: hyper::Uri, api_key: Option<String>) -> RelayClient {
        let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
        RelayClient {
            client,
            url,
            api_key,
        }
    }

    pub async fn submit(&self, blob: &str) -> Result<RelayResponse, RpcError> {
        let body = json!({ "xdr": blob }).to_string();
        let mut builder = Request::builder()
            .method("POST")
            .uri(self.url.clone())
            .header(CONTENT_TYPE, "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header(AUTHORIZATION, format!("Bearer {key}"));
        }
        let req = builder
            .body(Full::<Bytes>::from(body))
            .map_err(|e| RpcError::Http(e.to_string()))?;

        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| RpcError::Http(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| RpcError::Http(e.to_string()))?
            .to_bytes();
        trace!(status, "Relay responded");

        Ok(RelayResponse {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

/// Raw relay answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayResponse {
    pub status: u16,
    pub body: String,
}

impl RelayResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Transaction hash carried by a successful response body.
    ///
    /// Accepts `hash`, `transactionHash` or `txHash` keys, or a bare JSON string.
    pub fn tx_hash(&self) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(&self.body).ok()?;
        if let Some(hash) = value.as_str() {
            return Some(hash.to_string());
        }
        ["hash", "transactionHash", "txHash"]
            .iter()
            .find_map(|key| value.get(key).and_then(|v| v.as_str()))
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    async fn serve_once(status_line: &'static str, body: &'static str) -> hyper::Uri {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{addr}/submit").parse().unwrap()
    }

    #[test]
    fn extracts_hash_variants() {
        let ok = |body: &str| RelayResponse {
            status: 200,
            body: body.to_string(),
        };
        assert_eq!(ok(r#"{"hash":"ab"}"#).tx_hash().as_deref(), Some("ab"));
        assert_eq!(
            ok(r#"{"transactionHash":"cd"}"#).tx_hash().as_deref(),
            Some("cd")
        );
        assert_eq!(ok(r#""ef""#).tx_hash().as_deref(), Some("ef"));
        assert_eq!(ok("not json").tx_hash(), None);
    }

    #[tokio::test]
    async fn submit_returns_success_body() {
        let url = serve_once("200 OK", r#"{"hash":"deadbeef"}"#).await;
        let relay = RelayClient::new(url, Some("key".to_string()));
        let response = relay.submit("AAAA").await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.tx_hash().as_deref(), Some("deadbeef"));
    }

    #[tokio::test]
    async fn submit_keeps_error_body() {
        let url = serve_once("500 Internal Server Error", r#"{"error":"tx_bad_seq"}"#).await;
        let relay = RelayClient::new(url, None);
        let response = relay.submit("AAAA").await.unwrap();
        assert!(!response.is_success());
        assert_eq!(response.status, 500);
        assert!(response.body.contains("tx_bad_seq"));
    }
}
