pub mod mini_rpc_client;
pub mod relay_client;

use serde::{Deserialize, Serialize};

pub use hyper::Uri;
pub use mini_rpc_client::{Auth, JsonRpcError, MiniRpcClient, RpcError};
pub use relay_client::{RelayClient, RelayResponse};

/// A single contract invocation, as sent to the node for simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractCall {
    pub contract_id: String,
    pub function: String,
    pub source_account: String,
    pub args: Vec<serde_json::Value>,
}

/// Result of `simulateTransaction`.
///
/// On success the node returns the assembled (unsigned) transaction, the
/// authorization entries the source account has to sign and the decoded return
/// value of the invoked function. On a contract-level failure only `error` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateResponse {
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub auth: Vec<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub latest_ledger: Option<u32>,
}

/// Result of `getBalance`. Amounts are decimal strings of atomic units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub native: String,
    pub token: String,
    pub account_exists: bool,
}
