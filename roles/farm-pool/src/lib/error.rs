use ext_config::ConfigError;
use farm_rpc::RpcError;
use std::fmt;

use crate::{
    ledger::LedgerError,
    types::{ExitId, FarmerId},
};

pub type PoolResult<T> = Result<T, FarmPoolError>;

/// Infrastructure and setup failures.
///
/// Expected business failures (a farmer whose submission failed, an exit leg
/// rejected by the relay) are reported as values in batch and payout results,
/// never through this type.
#[derive(Debug)]
pub enum FarmPoolError {
    /// Errors on bad CLI argument input.
    BadCliArgs,
    /// Errors on bad `config` TOML deserialize.
    BadConfigDeserialize(ConfigError),
    /// Configuration parsed but holds values the pool cannot run with.
    InvalidConfig(String),
    /// The ledger store could not be read or written.
    Ledger(LedgerError),
    /// The chain node or relay could not be reached.
    Rpc(RpcError),
    /// A custodial key could not be decoded.
    Key(String),
    FarmerNotFound(FarmerId),
    ExitNotFound(ExitId),
    /// A state transition was requested from the wrong state.
    InvalidState(String),
    /// Error when receiving a message from an asynchronous channel.
    ChannelRecv(async_channel::RecvError),
    Io(std::io::Error),
}

impl fmt::Display for FarmPoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use FarmPoolError::*;
        match self {
            BadCliArgs => write!(f, "Bad CLI arg input"),
            BadConfigDeserialize(ref e) => write!(f, "Bad `config` TOML deserialize: `{e:?}`"),
            InvalidConfig(ref e) => write!(f, "Invalid configuration: {e}"),
            Ledger(ref e) => write!(f, "Ledger error: {e}"),
            Rpc(ref e) => write!(f, "RPC error: {e}"),
            Key(ref e) => write!(f, "Custodial key error: {e}"),
            FarmerNotFound(id) => write!(f, "Farmer {id} not found"),
            ExitNotFound(id) => write!(f, "Exit record {id} not found"),
            InvalidState(ref e) => write!(f, "Invalid state: {e}"),
            ChannelRecv(ref e) => write!(f, "Channel recv failed: `{e:?}`"),
            Io(ref e) => write!(f, "I/O error: `{e:?}`"),
        }
    }
}

impl std::error::Error for FarmPoolError {}

impl From<ConfigError> for FarmPoolError {
    fn from(e: ConfigError) -> Self {
        FarmPoolError::BadConfigDeserialize(e)
    }
}

impl From<LedgerError> for FarmPoolError {
    fn from(e: LedgerError) -> Self {
        FarmPoolError::Ledger(e)
    }
}

impl From<RpcError> for FarmPoolError {
    fn from(e: RpcError) -> Self {
        FarmPoolError::Rpc(e)
    }
}

impl From<async_channel::RecvError> for FarmPoolError {
    fn from(e: async_channel::RecvError) -> Self {
        FarmPoolError::ChannelRecv(e)
    }
}

impl From<std::io::Error> for FarmPoolError {
    fn from(e: std::io::Error) -> Self {
        FarmPoolError::Io(e)
    }
}
