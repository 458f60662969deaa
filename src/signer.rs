// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Attest/pause message signing with the locally held guardian key.
//!
//! Digests follow EVM word packing: every scalar is big-endian, left-padded
//! to 32 bytes, so on-chain `abi.encode` of the same fields reproduces the
//! hash. The two message prefixes are contract constants, read once and
//! cached for the process lifetime.
//!
//! Signing is synchronous (RFC 6979, deterministic) and therefore atomic
//! with respect to shutdown.

use crate::abi::DepositSecurityModule;
use crate::config::WalletKey;
use crate::error::{GuardianError, GuardianResult};
use crate::types::{evm_word_u64, GuardianSignature};
use ethers::providers::Middleware;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, H256};
use ethers::utils::keccak256;
use tokio::sync::OnceCell;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessagePrefixes {
    pub attest: H256,
    pub pause: H256,
}

pub struct GuardianSigner {
    wallet: LocalWallet,
    prefixes: OnceCell<MessagePrefixes>,
}

impl GuardianSigner {
    pub fn new(key: &WalletKey) -> GuardianResult<Self> {
        let wallet: LocalWallet = key
            .expose()
            .parse()
            .map_err(|e| GuardianError::Fatal(format!("corrupt wallet private key: {}", e)))?;
        Ok(Self {
            wallet,
            prefixes: OnceCell::new(),
        })
    }

    /// The only identity the signer ever exposes.
    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Message prefixes from the DSM contract, fetched on first use and
    /// immutable afterwards.
    pub async fn prefixes<M: Middleware + 'static>(
        &self,
        dsm: &DepositSecurityModule<M>,
    ) -> GuardianResult<MessagePrefixes> {
        let prefixes = self
            .prefixes
            .get_or_try_init(|| async {
                let attest = dsm.attest_message_prefix().call().await.map_err(|e| {
                    GuardianError::Transient(format!("cannot read ATTEST_MESSAGE_PREFIX: {}", e))
                })?;
                let pause = dsm.pause_message_prefix().call().await.map_err(|e| {
                    GuardianError::Transient(format!("cannot read PAUSE_MESSAGE_PREFIX: {}", e))
                })?;
                Ok::<_, GuardianError>(MessagePrefixes {
                    attest: H256(attest),
                    pause: H256(pause),
                })
            })
            .await?;
        Ok(*prefixes)
    }

    pub fn sign_attest(
        &self,
        prefix: H256,
        deposit_root: H256,
        nonce: u64,
        block_number: u64,
        block_hash: H256,
        staking_module_id: u32,
    ) -> GuardianResult<GuardianSignature> {
        let digest = attest_digest(
            prefix,
            deposit_root,
            nonce,
            block_number,
            block_hash,
            staking_module_id,
        );
        self.sign_digest(digest)
    }

    pub fn sign_pause(
        &self,
        prefix: H256,
        block_number: u64,
        staking_module_id: u32,
    ) -> GuardianResult<GuardianSignature> {
        let digest = pause_digest(prefix, block_number, staking_module_id);
        self.sign_digest(digest)
    }

    fn sign_digest(&self, digest: H256) -> GuardianResult<GuardianSignature> {
        let signature = self
            .wallet
            .sign_hash(digest)
            .map_err(|e| GuardianError::Fatal(format!("signing failed: {}", e)))?;
        Ok(signature.into())
    }
}

/// `keccak256(prefix ‖ keccak256(depositRoot ‖ nonce ‖ blockNumber ‖
/// blockHash ‖ moduleId))`
pub fn attest_digest(
    prefix: H256,
    deposit_root: H256,
    nonce: u64,
    block_number: u64,
    block_hash: H256,
    staking_module_id: u32,
) -> H256 {
    let mut inner = Vec::with_capacity(5 * 32);
    inner.extend_from_slice(deposit_root.as_bytes());
    inner.extend_from_slice(&evm_word_u64(nonce));
    inner.extend_from_slice(&evm_word_u64(block_number));
    inner.extend_from_slice(block_hash.as_bytes());
    inner.extend_from_slice(&evm_word_u64(staking_module_id as u64));
    prefixed_hash(prefix, keccak256(&inner))
}

/// `keccak256(prefix ‖ keccak256(blockNumber ‖ moduleId))`
pub fn pause_digest(prefix: H256, block_number: u64, staking_module_id: u32) -> H256 {
    let mut inner = Vec::with_capacity(2 * 32);
    inner.extend_from_slice(&evm_word_u64(block_number));
    inner.extend_from_slice(&evm_word_u64(staking_module_id as u64));
    prefixed_hash(prefix, keccak256(&inner))
}

fn prefixed_hash(prefix: H256, inner: [u8; 32]) -> H256 {
    let mut outer = Vec::with_capacity(64);
    outer.extend_from_slice(prefix.as_bytes());
    outer.extend_from_slice(&inner);
    H256(keccak256(&outer))
}
