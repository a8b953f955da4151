//! Seams towards the blockchain node and the fee-sponsoring relay.
//!
//! Everything above this module talks to [`ChainClient`] and [`Relay`] only, so
//! tests can script chain behaviour without a network.

use async_trait::async_trait;
use farm_rpc::{
    BalanceResponse, ContractCall, MiniRpcClient, RelayClient, RelayResponse, RpcError,
    SimulateResponse,
};

use crate::types::{parse_amount, Amount, BlockIndex};

/// On-chain balances of a custodial wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalletBalance {
    pub native: Amount,
    pub token: Amount,
    pub account_exists: bool,
}

impl WalletBalance {
    /// The wallet exists on chain and holds native currency to operate.
    pub fn is_funded(&self) -> bool {
        self.account_exists && self.native > 0
    }
}

impl TryFrom<BalanceResponse> for WalletBalance {
    type Error = RpcError;

    fn try_from(raw: BalanceResponse) -> Result<Self, Self::Error> {
        let native = parse_amount(&raw.native)
            .ok_or_else(|| RpcError::Other(format!("bad native balance `{}`", raw.native)))?;
        let token = parse_amount(&raw.token)
            .ok_or_else(|| RpcError::Other(format!("bad token balance `{}`", raw.token)))?;
        Ok(Self {
            native,
            token,
            account_exists: raw.account_exists,
        })
    }
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Simulates a contract call and returns the assembled transaction.
    async fn simulate(&self, call: &ContractCall) -> Result<SimulateResponse, RpcError>;

    async fn balance(&self, account: &str) -> Result<WalletBalance, RpcError>;

    /// Current block index of the farm contract.
    async fn farm_index(&self) -> Result<BlockIndex, RpcError>;
}

#[async_trait]
pub trait Relay: Send + Sync {
    /// Submits a signed transaction blob for fee-sponsored execution.
    async fn submit(&self, blob: &str) -> Result<RelayResponse, RpcError>;
}

/// [`ChainClient`] over the node's JSON-RPC endpoint.
pub struct NodeClient {
    rpc: MiniRpcClient,
    farm_contract: String,
    token_contract: String,
}

impl NodeClient {
    pub fn new(rpc: MiniRpcClient, farm_contract: String, token_contract: String) -> Self {
        Self {
            rpc,
            farm_contract,
            token_contract,
        }
    }
}

#[async_trait]
impl ChainClient for NodeClient {
    async fn simulate(&self, call: &ContractCall) -> Result<SimulateResponse, RpcError> {
        self.rpc.simulate_transaction(call).await
    }

    async fn balance(&self, account: &str) -> Result<WalletBalance, RpcError> {
        self.rpc
            .get_balance(account, &self.token_contract)
            .await?
            .try_into()
    }

    async fn farm_index(&self) -> Result<BlockIndex, RpcError> {
        self.rpc.get_farm_index(&self.farm_contract).await
    }
}

#[async_trait]
impl Relay for RelayClient {
    async fn submit(&self, blob: &str) -> Result<RelayResponse, RpcError> {
        RelayClient::submit(self, blob).await
    }
}
