//! ## Transaction Submission
//!
//! Turns one farm operation for one custodial account into a simulated,
//! signed and relayed transaction, and classifies what happened.
//!
//! Simulation failures reported by the contract are terminal here, except the
//! ones the farm treats as "not yet" (harvest preconditions) or "already done"
//! (a pail that already exists for the block). Transport failures and non-2xx
//! relay answers are retryable. Only `plant` retries on its own; every other
//! operation leaves retries to its caller.

mod contract_error;

pub use contract_error::ContractError;

use farm_rpc::ContractCall;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    backoff::Backoff,
    chain::{ChainClient, Relay},
    error::PoolResult,
    signer::{sign_transaction, CustodialKey},
    types::{parse_amount, Amount, BlockIndex, Farmer},
};

/// A custodial wallet the pool signs for.
#[derive(Debug)]
pub struct Account {
    pub address: String,
    pub key: CustodialKey,
}

impl Account {
    pub fn from_farmer(farmer: &Farmer) -> PoolResult<Self> {
        Ok(Self {
            address: farmer.custodial_public_key.clone(),
            key: CustodialKey::from_hex(&farmer.custodial_secret_key)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    /// Accepted by the relay.
    Confirmed {
        tx_hash: String,
        /// Return value of the invoked function, as reported by simulation.
        returned: Option<Value>,
    },
    /// The contract reports the operation as already applied.
    AlreadyDone { reason: String },
    /// On-chain preconditions are not met yet; check again later.
    NotYetEligible { reason: String },
    Retryable { error: String },
    Terminal { error: String },
}

impl SubmissionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            SubmissionOutcome::Confirmed { .. } | SubmissionOutcome::AlreadyDone { .. }
        )
    }

    pub fn tx_hash(&self) -> Option<&str> {
        match self {
            SubmissionOutcome::Confirmed { tx_hash, .. } => Some(tx_hash),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            SubmissionOutcome::Confirmed { .. } => None,
            SubmissionOutcome::AlreadyDone { reason }
            | SubmissionOutcome::NotYetEligible { reason } => Some(reason),
            SubmissionOutcome::Retryable { error } | SubmissionOutcome::Terminal { error } => {
                Some(error)
            }
        }
    }

    /// Amount returned by the contract, e.g. the reward of a harvest.
    pub fn returned_amount(&self) -> Option<Amount> {
        match self {
            SubmissionOutcome::Confirmed {
                returned: Some(value),
                ..
            } => value_to_amount(value),
            _ => None,
        }
    }
}

fn value_to_amount(value: &Value) -> Option<Amount> {
    match value {
        Value::String(s) => parse_amount(s),
        Value::Number(n) => n.as_i64().map(Amount::from),
        Value::Object(map) => map.get("i128").and_then(value_to_amount),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Plant,
    Work,
    Harvest,
    Transfer,
}

impl Operation {
    fn function(&self) -> &'static str {
        match self {
            Operation::Plant => "plant",
            Operation::Work => "work",
            Operation::Harvest => "harvest",
            Operation::Transfer => "transfer",
        }
    }

    fn classify(&self, simulation_error: String) -> SubmissionOutcome {
        let contract_error = ContractError::parse(&simulation_error);
        match (self, contract_error) {
            (Operation::Plant, Some(ContractError::PailExists)) => {
                SubmissionOutcome::AlreadyDone {
                    reason: simulation_error,
                }
            }
            (Operation::Harvest, Some(e)) if e.is_harvest_pending() => {
                SubmissionOutcome::NotYetEligible {
                    reason: e.to_string(),
                }
            }
            _ => SubmissionOutcome::Terminal {
                error: simulation_error,
            },
        }
    }
}

fn address(value: &str) -> Value {
    json!({ "address": value })
}

fn i128_arg(amount: Amount) -> Value {
    json!({ "i128": amount.to_string() })
}

pub struct TransactionSubmitter {
    chain: Arc<dyn ChainClient>,
    relay: Arc<dyn Relay>,
    farm_contract: String,
    token_contract: String,
    plant_backoff: Backoff,
    plant_max_attempts: u32,
}

impl TransactionSubmitter {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        relay: Arc<dyn Relay>,
        farm_contract: String,
        token_contract: String,
        plant_backoff: Backoff,
        plant_max_attempts: u32,
    ) -> Self {
        Self {
            chain,
            relay,
            farm_contract,
            token_contract,
            plant_backoff,
            plant_max_attempts: plant_max_attempts.max(1),
        }
    }

    /// Stakes `stake` for the current block, retrying retryable failures with
    /// capped exponential backoff.
    pub async fn plant(&self, account: &Account, stake: Amount) -> SubmissionOutcome {
        let call = self.farm_call(
            Operation::Plant,
            account,
            vec![address(&account.address), i128_arg(stake)],
        );
        let mut attempt = 1;
        loop {
            let outcome = self.submit(Operation::Plant, &call, account).await;
            match outcome {
                SubmissionOutcome::Retryable { ref error } if attempt < self.plant_max_attempts => {
                    let delay = self.plant_backoff.delay(attempt);
                    warn!(
                        account = %account.address,
                        attempt,
                        ?delay,
                        "Plant submission failed, retrying: {}",
                        error
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    pub async fn work(&self, account: &Account, hash: &str, nonce: u64) -> SubmissionOutcome {
        let call = self.farm_call(
            Operation::Work,
            account,
            vec![
                address(&account.address),
                json!({ "bytes": hash }),
                json!({ "u64": nonce }),
            ],
        );
        self.submit(Operation::Work, &call, account).await
    }

    pub async fn harvest(&self, account: &Account, block_index: BlockIndex) -> SubmissionOutcome {
        let call = self.farm_call(
            Operation::Harvest,
            account,
            vec![address(&account.address), json!({ "u32": block_index })],
        );
        self.submit(Operation::Harvest, &call, account).await
    }

    /// Moves `amount` of the farm token from the account to `to`.
    pub async fn transfer(&self, account: &Account, to: &str, amount: Amount) -> SubmissionOutcome {
        let call = ContractCall {
            contract_id: self.token_contract.clone(),
            function: Operation::Transfer.function().to_string(),
            source_account: account.address.clone(),
            args: vec![address(&account.address), address(to), i128_arg(amount)],
        };
        self.submit(Operation::Transfer, &call, account).await
    }

    fn farm_call(&self, operation: Operation, account: &Account, args: Vec<Value>) -> ContractCall {
        ContractCall {
            contract_id: self.farm_contract.clone(),
            function: operation.function().to_string(),
            source_account: account.address.clone(),
            args,
        }
    }

    async fn submit(
        &self,
        operation: Operation,
        call: &ContractCall,
        account: &Account,
    ) -> SubmissionOutcome {
        let simulation = match self.chain.simulate(call).await {
            Ok(simulation) => simulation,
            Err(e) => {
                return SubmissionOutcome::Retryable {
                    error: format!("simulation request failed: {e}"),
                }
            }
        };
        if let Some(error) = simulation.error.clone() {
            let outcome = operation.classify(error);
            debug!(
                account = %account.address,
                function = operation.function(),
                "Simulation rejected: {:?}",
                outcome
            );
            return outcome;
        }

        let signed = match sign_transaction(&account.key, &simulation) {
            Ok(signed) => signed,
            Err(e) => {
                return SubmissionOutcome::Terminal {
                    error: format!("signing failed: {e}"),
                }
            }
        };

        let response = match self.relay.submit(&signed.blob).await {
            Ok(response) => response,
            Err(e) => {
                return SubmissionOutcome::Retryable {
                    error: format!("relay unreachable: {e}"),
                }
            }
        };
        if !response.is_success() {
            return SubmissionOutcome::Retryable {
                error: format!("relay returned {}: {}", response.status, response.body),
            };
        }
        let tx_hash = response.tx_hash().unwrap_or(signed.local_hash);
        debug!(
            account = %account.address,
            function = operation.function(),
            tx_hash = %tx_hash,
            "Transaction relayed"
        );
        SubmissionOutcome::Confirmed {
            tx_hash,
            returned: simulation.result,
        }
    }
}
