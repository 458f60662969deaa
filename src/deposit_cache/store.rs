// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! On-disk layout of the deposit-event cache.
//!
//! `manifest.json` lists sealed segments with their terminal block refs and
//! pins the chain id; each sealed segment lives in its own
//! `events-<from>-<to>.bin`; `head.json` holds the unsealed tail. Everything
//! is rebuildable from the chain, but sealed data is trusted once written:
//! a corrupt sealed file or a foreign chain id is fatal, a corrupt head is
//! discarded and refetched.

use super::segment::{decode_events, encode_events, segment_file_name, EventSegment};
use crate::error::{GuardianError, GuardianResult};
use crate::types::{BlockRef, DepositEvent};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const HEAD_FILE: &str = "head.json";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentMeta {
    pub from: u64,
    pub to: u64,
    pub terminal: BlockRef,
    pub event_count: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub chain_id: u64,
    pub segments: Vec<SegmentMeta>,
}

/// Unsealed tail: everything newer than the last sealed segment.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct HeadState {
    pub watermark: u64,
    pub tail_refs: Vec<BlockRef>,
    pub events: Vec<DepositEvent>,
}

pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> GuardianResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            GuardianError::Fatal(format!("cannot create cache dir {:?}: {}", dir, e))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load everything from disk. Returns sealed segments (in order) and the
    /// unsealed head, if any.
    pub async fn load(
        &self,
        expected_chain_id: u64,
    ) -> GuardianResult<(Vec<EventSegment>, HeadState)> {
        let manifest_path = self.dir.join(MANIFEST_FILE);
        let manifest = match tokio::fs::read(&manifest_path).await {
            Ok(bytes) => serde_json::from_slice::<Manifest>(&bytes).map_err(|e| {
                GuardianError::Fatal(format!("corrupt cache manifest {:?}: {}", manifest_path, e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Manifest {
                chain_id: expected_chain_id,
                segments: Vec::new(),
            },
            Err(e) => {
                return Err(GuardianError::Fatal(format!(
                    "cannot read cache manifest {:?}: {}",
                    manifest_path, e
                )))
            }
        };

        if manifest.chain_id != expected_chain_id {
            return Err(GuardianError::Fatal(format!(
                "cache manifest belongs to chain {}, configured chain is {}; \
                 refusing to mix deposit histories",
                manifest.chain_id, expected_chain_id
            )));
        }

        let mut segments = Vec::with_capacity(manifest.segments.len());
        let mut expected_from = 0u64;
        for meta in &manifest.segments {
            if meta.from != expected_from || meta.to <= meta.from {
                return Err(GuardianError::Fatal(format!(
                    "cache manifest lists non-contiguous segment [{}, {})",
                    meta.from, meta.to
                )));
            }
            expected_from = meta.to;

            let path = self.dir.join(segment_file_name(meta.from, meta.to));
            let bytes = tokio::fs::read(&path).await.map_err(|e| {
                GuardianError::Fatal(format!("cannot read sealed segment {:?}: {}", path, e))
            })?;
            let events = decode_events(&bytes).map_err(|e| {
                GuardianError::Fatal(format!("corrupt sealed segment {:?}: {}", path, e))
            })?;
            if events.len() as u64 != meta.event_count {
                return Err(GuardianError::Fatal(format!(
                    "sealed segment {:?} holds {} events, manifest says {}",
                    path,
                    events.len(),
                    meta.event_count
                )));
            }
            segments.push(EventSegment {
                from: meta.from,
                to: meta.to,
                terminal: meta.terminal,
                events,
            });
        }

        let head_path = self.dir.join(HEAD_FILE);
        let head = match tokio::fs::read(&head_path).await {
            Ok(bytes) => match serde_json::from_slice::<HeadState>(&bytes) {
                Ok(head) => head,
                Err(e) => {
                    // The unsealed tail is rebuildable; a corrupt head is
                    // dropped and refetched rather than treated as fatal.
                    tracing::warn!(
                        "discarding corrupt cache head {:?} ({}); tail will be refetched",
                        head_path,
                        e
                    );
                    HeadState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HeadState::default(),
            Err(e) => {
                return Err(GuardianError::Fatal(format!(
                    "cannot read cache head {:?}: {}",
                    head_path, e
                )))
            }
        };

        Ok((segments, head))
    }

    pub async fn write_segment(&self, segment: &EventSegment) -> GuardianResult<()> {
        let bytes = encode_events(&segment.events);
        self.write_atomic(&segment.file_name(), &bytes).await
    }

    pub async fn save_manifest(&self, manifest: &Manifest) -> GuardianResult<()> {
        let bytes = serde_json::to_vec_pretty(manifest)
            .map_err(|e| GuardianError::Fatal(format!("cannot encode manifest: {}", e)))?;
        self.write_atomic(MANIFEST_FILE, &bytes).await
    }

    pub async fn save_head(&self, head: &HeadState) -> GuardianResult<()> {
        let bytes = serde_json::to_vec(head)
            .map_err(|e| GuardianError::Fatal(format!("cannot encode head state: {}", e)))?;
        self.write_atomic(HEAD_FILE, &bytes).await
    }

    // Write-then-rename so a crash mid-write never leaves a half-written
    // file under the real name.
    async fn write_atomic(&self, name: &str, bytes: &[u8]) -> GuardianResult<()> {
        let final_path = self.dir.join(name);
        let tmp_path = self.dir.join(format!("{}.tmp", name));
        tokio::fs::write(&tmp_path, bytes).await.map_err(|e| {
            GuardianError::Fatal(format!("cannot write cache file {:?}: {}", tmp_path, e))
        })?;
        tokio::fs::rename(&tmp_path, &final_path).await.map_err(|e| {
            GuardianError::Fatal(format!(
                "cannot move cache file into place {:?}: {}",
                final_path, e
            ))
        })
    }
}
