// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::GuardianError;
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

pub const PUBKEY_LEN: usize = 48;
pub const BLS_SIGNATURE_LEN: usize = 96;

/// Reference to a specific block on the canonical chain. Tags every cached
/// artifact so reorgs are detectable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub hash: H256,
    pub timestamp: u64,
}

/// BLS12-381 validator public key as it appears in deposit contract logs
/// and the registry inventory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValidatorPubkey(pub [u8; PUBKEY_LEN]);

impl ValidatorPubkey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, GuardianError> {
        let arr: [u8; PUBKEY_LEN] = bytes.try_into().map_err(|_| {
            GuardianError::Inconsistent(format!(
                "validator pubkey must be {} bytes, got {}",
                PUBKEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }
}

impl Debug for ValidatorPubkey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "k#{}..", hex::encode(&self.0[..4]))
    }
}

impl Display for ValidatorPubkey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for ValidatorPubkey {
    type Err = GuardianError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped)
            .map_err(|e| GuardianError::Inconsistent(format!("invalid pubkey hex: {}", e)))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for ValidatorPubkey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ValidatorPubkey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// BLS deposit signature. Carried through the cache for completeness; the
/// daemon never verifies it (the deposit contract already accepted it).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlsSignature(pub [u8; BLS_SIGNATURE_LEN]);

impl BlsSignature {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, GuardianError> {
        let arr: [u8; BLS_SIGNATURE_LEN] = bytes.try_into().map_err(|_| {
            GuardianError::Inconsistent(format!(
                "BLS signature must be {} bytes, got {}",
                BLS_SIGNATURE_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }
}

impl Debug for BlsSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "sig#{}..", hex::encode(&self.0[..4]))
    }
}

impl Serialize for BlsSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

impl<'de> Deserialize<'de> for BlsSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let stripped = s.strip_prefix("0x").unwrap_or(&s);
        let bytes = hex::decode(stripped).map_err(serde::de::Error::custom)?;
        Self::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

/// One `DepositEvent` log of the deposit contract.
///
/// Content-addressable by `(block.hash, log_index)`: for a given identity the
/// event is unique and immutable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositEvent {
    pub pubkey: ValidatorPubkey,
    pub withdrawal_credentials: H256,
    pub amount_gwei: u64,
    pub signature: BlsSignature,
    pub block: BlockRef,
    pub log_index: u32,
    pub tx_hash: H256,
}

impl DepositEvent {
    /// Ordering key used everywhere events are returned: block first, then
    /// position within the block.
    pub fn sort_key(&self) -> (u64, u32) {
        (self.block.number, self.log_index)
    }
}

/// Full registry inventory at a single EL block.
#[derive(Clone, Debug)]
pub struct RegistryKeySnapshot {
    pub snapshot_block: BlockRef,
    pub used: std::collections::HashSet<ValidatorPubkey>,
    pub unused_by_module: std::collections::BTreeMap<u32, std::collections::HashSet<ValidatorPubkey>>,
}

impl RegistryKeySnapshot {
    pub fn unused_for_module(&self, module_id: u32) -> Option<&std::collections::HashSet<ValidatorPubkey>> {
        self.unused_by_module.get(&module_id)
    }
}

/// State of one staking module on the router at a given block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StakingModuleState {
    pub id: u32,
    pub is_active: bool,
    /// keysOpIndex: invalidates stale attestations when operators touch keys
    pub nonce: u64,
    pub last_deposit_block: u64,
}

/// The local wallet's standing in the on-chain guardian set at a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuardianIdentity {
    pub address: Address,
    /// Position in the guardian list, -1 when not a member
    pub index: i32,
}

impl GuardianIdentity {
    pub fn is_member(&self) -> bool {
        self.index >= 0
    }
}

/// Recoverable secp256k1 signature in the split form the DSM contract
/// consumes. `vs` is the EIP-2098 compact second word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuardianSignature {
    pub r: H256,
    pub s: H256,
    pub v: u8,
}

impl GuardianSignature {
    /// EIP-2098 compact representation: `s` with the recovery parity folded
    /// into the top bit.
    pub fn vs(&self) -> H256 {
        let parity = if self.v >= 27 { self.v - 27 } else { self.v };
        let mut out = self.s.0;
        if parity == 1 {
            out[0] |= 0x80;
        }
        H256(out)
    }
}

impl From<ethers::types::Signature> for GuardianSignature {
    fn from(sig: ethers::types::Signature) -> Self {
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        sig.r.to_big_endian(&mut r);
        sig.s.to_big_endian(&mut s);
        Self {
            r: H256(r),
            s: H256(s),
            v: sig.v as u8,
        }
    }
}

/// Signed authorization for the next deposit batch of one module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttestMessage {
    pub block_number: u64,
    pub block_hash: H256,
    pub deposit_root: H256,
    pub nonce: u64,
    pub staking_module_id: u32,
    pub guardian: GuardianIdentity,
    pub signature: GuardianSignature,
}

/// Signed demand to halt deposits on one module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PauseMessage {
    pub block_number: u64,
    pub block_hash: H256,
    pub staking_module_id: u32,
    pub guardian: GuardianIdentity,
    pub signature: GuardianSignature,
}

/// Why a module was skipped in one block's pipeline run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    StaleSnapshot,
    InconsistentSnapshot,
    NotGuardian,
    ModuleInactive,
    RpcError,
    PausePending,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::StaleSnapshot => "stale_snapshot",
            SkipReason::InconsistentSnapshot => "inconsistent_snapshot",
            SkipReason::NotGuardian => "not_guardian",
            SkipReason::ModuleInactive => "module_inactive",
            SkipReason::RpcError => "rpc_error",
            SkipReason::PausePending => "pause_pending",
        }
    }
}

/// Outcome of processing one (block, staking module) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Attest,
    Pause,
    Skip(SkipReason),
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Attest => "attest",
            Decision::Pause => "pause",
            Decision::Skip(_) => "skip",
        }
    }
}

/// Left-pad a u64 into a 32-byte EVM word (big-endian).
pub fn evm_word_u64(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    U256::from(value).to_big_endian(&mut word);
    word
}
