use base64::Engine;
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
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
};
use tracing::trace;

use super::{BalanceResponse, ContractCall, SimulateResponse};

/// Minimal JSON-RPC client for the chain node.
#[derive(Clone, Debug)]
pub struct MiniRpcClient {
    client: Client<HttpConnector, Full<Bytes>>,
    url: hyper::Uri,
    auth: Option<Auth>,
    next_id: Arc<AtomicU64>,
}

impl MiniRpcClient {
    pub fn new(url: hyper::Uri, auth: Option<Auth>) -> MiniRpcClient {
        let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
        MiniRpcClient {
            client,
            url,
            auth,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Simulates a contract call. Contract-level failures come back inside
    /// [`SimulateResponse::error`], transport failures as `Err`.
    pub async fn simulate_transaction(
        &self,
        call: &ContractCall,
    ) -> Result<SimulateResponse, RpcError> {
        self.send_json_rpc_request("simulateTransaction", json!([call]))
            .await
    }

    /// Native and token balance of `account`, `token_contract` being the asset
    /// the farm stakes.
    pub async fn get_balance(
        &self,
        account: &str,
        token_contract: &str,
    ) -> Result<BalanceResponse, RpcError> {
        self.send_json_rpc_request("getBalance", json!([account, token_contract]))
            .await
    }

    /// Index of the block the farm contract is currently mining.
    pub async fn get_farm_index(&self, contract_id: &str) -> Result<u32, RpcError> {
        self.send_json_rpc_request("getFarmIndex", json!([contract_id]))
            .await
    }

    /// Checks the health of the RPC connection.
    pub async fn health(&self) -> Result<(), RpcError> {
        self.send_json_rpc_request::<serde_json::Value>("getHealth", json!([]))
            .await
            .map(|_| ())
    }

    async fn send_json_rpc_request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id,
        };

        let request_body =
            serde_json::to_string(&request).map_err(|e| RpcError::Serialization(e.to_string()))?;

        let mut builder = Request::builder()
            .method("POST")
            .uri(self.url.clone())
            .header(CONTENT_TYPE, "application/json");
        if let Some(auth) = &self.auth {
            builder = builder.header(AUTHORIZATION, auth.header_value());
        }
        let req = builder
            .body(Full::<Bytes>::from(request_body))
            .map_err(|e| RpcError::Http(e.to_string()))?;

        trace!(method, id, "Sending JSON-RPC request");
        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| RpcError::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| RpcError::Http(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            return match serde_json::from_slice::<JsonRpcResult<serde_json::Value>>(&body) {
                Ok(JsonRpcResult {
                    error: Some(error), ..
                }) => Err(RpcError::JsonRpc(error)),
                _ => Err(RpcError::Http(format!(
                    "status {}: {}",
                    status,
                    String::from_utf8_lossy(&body)
                ))),
            };
        }
        decode_result(id, &body)
    }
}

/// Extracts `result` from a JSON-RPC response body.
pub(crate) fn decode_result<T: DeserializeOwned>(id: u64, body: &[u8]) -> Result<T, RpcError> {
    let decoded: JsonRpcResult<T> =
        serde_json::from_slice(body).map_err(|e| RpcError::Deserialization(e.to_string()))?;
    if let Some(error) = decoded.error {
        return Err(RpcError::JsonRpc(error));
    }
    if decoded.id != id {
        return Err(RpcError::Other(format!(
            "response id {} does not match request id {}",
            decoded.id, id
        )));
    }
    decoded
        .result
        .ok_or_else(|| RpcError::Other("Result not found".to_string()))
}

#[derive(Clone, Debug)]
pub enum Auth {
    Basic { username: String, password: String },
    Bearer(String),
}

impl Auth {
    fn header_value(&self) -> String {
        match self {
            Auth::Basic { username, password } => format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"))
            ),
            Auth::Bearer(token) => format!("Bearer {token}"),
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    method: String,
    params: serde_json::Value,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResult<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
    #[serde(default)]
    id: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcError {
    JsonRpc(JsonRpcError),
    Deserialization(String),
    Serialization(String),
    Http(String),
    Other(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::JsonRpc(e) => write!(f, "JSON-RPC error {}: {}", e.code, e.message),
            RpcError::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            RpcError::Serialization(e) => write!(f, "Serialization error: {e}"),
            RpcError::Http(e) => write!(f, "Http error: {e}"),
            RpcError::Other(e) => write!(f, "RPC error: {e}"),
        }
    }
}

impl std::error::Error for RpcError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_result_field() {
        let body = br#"{"jsonrpc":"2.0","id":7,"result":1042}"#;
        let index: u32 = decode_result(7, body).unwrap();
        assert_eq!(index, 1042);
    }

    #[test]
    fn surfaces_json_rpc_error() {
        let body = br#"{"jsonrpc":"2.0","id":3,"error":{"code":-32600,"message":"bad request"}}"#;
        let err = decode_result::<u32>(3, body).unwrap_err();
        assert_eq!(
            err,
            RpcError::JsonRpc(JsonRpcError {
                code: -32600,
                message: "bad request".to_string()
            })
        );
    }

    #[test]
    fn rejects_mismatched_id() {
        let body = br#"{"jsonrpc":"2.0","id":9,"result":1}"#;
        assert!(matches!(
            decode_result::<u32>(8, body),
            Err(RpcError::Other(_))
        ));
    }

    #[test]
    fn simulation_error_is_a_successful_rpc_result() {
        let body = br#"{"jsonrpc":"2.0","id":1,"result":{"error":"HostError: Error(Contract, #8)"}}"#;
        let sim: SimulateResponse = decode_result(1, body).unwrap();
        assert_eq!(sim.error.as_deref(), Some("HostError: Error(Contract, #8)"));
        assert!(sim.auth.is_empty());
        assert!(sim.transaction.is_none());
    }

    #[test]
    fn bearer_and_basic_headers() {
        assert_eq!(Auth::Bearer("t0k".into()).header_value(), "Bearer t0k");
        let basic = Auth::Basic {
            username: "user".into(),
            password: "pass".into(),
        };
        assert_eq!(basic.header_value(), "Basic dXNlcjpwYXNz");
    }
}
