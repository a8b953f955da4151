use std::fmt;

/// Errors raised by the farm contract, by their on-chain code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContractError {
    HomesteadExists = 1,
    HomesteadMissing = 2,
    AssetAdminInvalid = 3,
    FarmPaused = 4,
    FarmNotPaused = 5,
    PlantAmountTooLow = 6,
    ZeroCountTooLow = 7,
    PailExists = 8,
    PailMissing = 9,
    WorkMissing = 10,
    BlockMissing = 11,
    HashInvalid = 12,
    HarvestNotReady = 13,
}

const ALL: [ContractError; 13] = [
    ContractError::HomesteadExists,
    ContractError::HomesteadMissing,
    ContractError::AssetAdminInvalid,
    ContractError::FarmPaused,
    ContractError::FarmNotPaused,
    ContractError::PlantAmountTooLow,
    ContractError::ZeroCountTooLow,
    ContractError::PailExists,
    ContractError::PailMissing,
    ContractError::WorkMissing,
    ContractError::BlockMissing,
    ContractError::HashInvalid,
    ContractError::HarvestNotReady,
];

impl ContractError {
    pub fn from_code(code: u32) -> Option<Self> {
        ALL.iter().copied().find(|e| *e as u32 == code)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ContractError::HomesteadExists => "HomesteadExists",
            ContractError::HomesteadMissing => "HomesteadMissing",
            ContractError::AssetAdminInvalid => "AssetAdminInvalid",
            ContractError::FarmPaused => "FarmPaused",
            ContractError::FarmNotPaused => "FarmNotPaused",
            ContractError::PlantAmountTooLow => "PlantAmountTooLow",
            ContractError::ZeroCountTooLow => "ZeroCountTooLow",
            ContractError::PailExists => "PailExists",
            ContractError::PailMissing => "PailMissing",
            ContractError::WorkMissing => "WorkMissing",
            ContractError::BlockMissing => "BlockMissing",
            ContractError::HashInvalid => "HashInvalid",
            ContractError::HarvestNotReady => "HarvestNotReady",
        }
    }

    /// Extracts the contract error from a simulation error message.
    ///
    /// Nodes report these as `Error(Contract, #9)`; some relays only echo the
    /// variant name, optionally spaced out ("pail missing").
    pub fn parse(message: &str) -> Option<Self> {
        if let Some(code) = contract_code(message) {
            return Self::from_code(code);
        }
        let squashed: String = message
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        ALL.iter()
            .copied()
            .find(|e| squashed.contains(&e.name().to_ascii_lowercase()))
    }

    /// The block's harvest preconditions are not met on chain yet.
    pub fn is_harvest_pending(&self) -> bool {
        matches!(
            self,
            ContractError::PailMissing
                | ContractError::WorkMissing
                | ContractError::BlockMissing
                | ContractError::HarvestNotReady
        )
    }
}

fn contract_code(message: &str) -> Option<u32> {
    let start = message.find("Error(Contract, #")? + "Error(Contract, #".len();
    let digits: String = message[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

impl fmt::Display for ContractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.name(), *self as u32)
    }
}
