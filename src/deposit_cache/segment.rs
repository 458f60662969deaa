// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Binary codec for sealed segment files.
//!
//! A segment file is a sequence of length-prefixed records, one per deposit
//! event, fields in declaration order, little-endian scalars. The format is
//! self-contained and never leaves the local disk; it is not EVM-visible.

use crate::error::{GuardianError, GuardianResult};
use crate::types::{BlockRef, BlsSignature, DepositEvent, ValidatorPubkey, BLS_SIGNATURE_LEN, PUBKEY_LEN};
use ethers::types::H256;

/// pubkey + wc + amount + signature + block(number, hash, timestamp) +
/// log_index + tx_hash
const RECORD_LEN: usize = PUBKEY_LEN + 32 + 8 + BLS_SIGNATURE_LEN + (8 + 32 + 8) + 4 + 32;

/// One contiguous half-open block range `[from, to)` of the cache, with the
/// canonical reference of its last block for cheap reorg checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventSegment {
    pub from: u64,
    pub to: u64,
    pub terminal: BlockRef,
    pub events: Vec<DepositEvent>,
}

impl EventSegment {
    pub fn file_name(&self) -> String {
        segment_file_name(self.from, self.to)
    }

    pub fn contains_block(&self, number: u64) -> bool {
        number >= self.from && number < self.to
    }
}

pub fn segment_file_name(from: u64, to: u64) -> String {
    format!("events-{}-{}.bin", from, to)
}

pub fn encode_events(events: &[DepositEvent]) -> Vec<u8> {
    let mut out = Vec::with_capacity(events.len() * (4 + RECORD_LEN));
    for event in events {
        out.extend_from_slice(&(RECORD_LEN as u32).to_le_bytes());
        out.extend_from_slice(event.pubkey.as_bytes());
        out.extend_from_slice(event.withdrawal_credentials.as_bytes());
        out.extend_from_slice(&event.amount_gwei.to_le_bytes());
        out.extend_from_slice(&event.signature.0);
        out.extend_from_slice(&event.block.number.to_le_bytes());
        out.extend_from_slice(event.block.hash.as_bytes());
        out.extend_from_slice(&event.block.timestamp.to_le_bytes());
        out.extend_from_slice(&event.log_index.to_le_bytes());
        out.extend_from_slice(event.tx_hash.as_bytes());
    }
    out
}

pub fn decode_events(bytes: &[u8]) -> GuardianResult<Vec<DepositEvent>> {
    let mut events = Vec::new();
    let mut cursor = 0usize;
    while cursor < bytes.len() {
        if bytes.len() - cursor < 4 {
            return Err(truncated(cursor));
        }
        let len = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
        cursor += 4;
        if len != RECORD_LEN {
            return Err(GuardianError::Inconsistent(format!(
                "segment record at offset {} has length {}, expected {}",
                cursor, len, RECORD_LEN
            )));
        }
        if bytes.len() - cursor < len {
            return Err(truncated(cursor));
        }
        let record = &bytes[cursor..cursor + len];
        cursor += len;
        events.push(decode_record(record)?);
    }
    Ok(events)
}

fn decode_record(record: &[u8]) -> GuardianResult<DepositEvent> {
    // record length is validated by the caller
    let (pubkey_bytes, rest) = record.split_at(PUBKEY_LEN);
    let (wc_bytes, rest) = rest.split_at(32);
    let (amount_bytes, rest) = rest.split_at(8);
    let (signature_bytes, rest) = rest.split_at(BLS_SIGNATURE_LEN);
    let (number_bytes, rest) = rest.split_at(8);
    let (hash_bytes, rest) = rest.split_at(32);
    let (timestamp_bytes, rest) = rest.split_at(8);
    let (log_index_bytes, tx_hash_bytes) = rest.split_at(4);

    let pubkey = ValidatorPubkey::from_slice(pubkey_bytes)?;
    let withdrawal_credentials = H256::from_slice(wc_bytes);
    let amount_gwei = u64::from_le_bytes(amount_bytes.try_into().unwrap());
    let signature = BlsSignature::from_slice(signature_bytes)?;
    let number = u64::from_le_bytes(number_bytes.try_into().unwrap());
    let hash = H256::from_slice(hash_bytes);
    let timestamp = u64::from_le_bytes(timestamp_bytes.try_into().unwrap());
    let log_index = u32::from_le_bytes(log_index_bytes.try_into().unwrap());
    let tx_hash = H256::from_slice(tx_hash_bytes);
    Ok(DepositEvent {
        pubkey,
        withdrawal_credentials,
        amount_gwei,
        signature,
        block: BlockRef {
            number,
            hash,
            timestamp,
        },
        log_index,
        tx_hash,
    })
}

fn truncated(offset: usize) -> GuardianError {
    GuardianError::Inconsistent(format!("segment file truncated at offset {}", offset))
}
