// SPDX-License-Identifier: BSD-3-Clause

//! Version dispatch and the shared per-block state both on-disk formats
//! converge to after `verify` (spec.md §4.2).
//!
//! The reference implementation this spec distills selects a C vtable by
//! exact 4-byte version-stamp match; every entry but `verify` is identical
//! between the two formats ("because the post-verify invariants — a dense
//! byte usage map plus prefix sums — are identical", spec.md §4.2). Rust
//! idiom replaces the vtable with a tagged enum ([`Version`]) used purely
//! for dispatch/logging, plus one shared [`VersionState`] whose methods
//! *are* the common seek/read/block-used logic — there is nothing
//! format-specific left to dispatch once `verify` has run.

pub mod v1;
pub mod v2;

use log::debug;

use crate::backend::{Backend, SeekWhence};
use crate::error::Result;
use crate::header::ResolvedHeader;
use crate::prefix::{precalculate_prefix_sums, walking_count_at};

/// Which on-disk format a successfully verified image was recognized as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V1,
    V2,
}

impl Version {
    pub fn stamp(self) -> &'static [u8; 4] {
        match self {
            Version::V1 => &crate::header::V1_VERSION,
            Version::V2 => &crate::header::V2_VERSION,
        }
    }

    /// Matches a 4-byte version stamp against the dispatch table
    /// (spec.md §4.2: "`verify` chooses the matching row by byte-exact
    /// comparison"). Returns `None` for an unrecognized stamp — the caller
    /// turns that into `Error::NotFound`.
    pub fn from_stamp(stamp: &[u8; 4]) -> Option<Self> {
        if *stamp == crate::header::V1_VERSION {
            Some(Version::V1)
        } else if *stamp == crate::header::V2_VERSION {
            Some(Version::V2)
        } else {
            None
        }
    }
}

/// Shared state allocated once `verify` has identified the format and
/// built a dense, byte-wide usage map (spec.md §3.1 "Version State").
pub struct VersionState {
    pub usage_map: Vec<u8>,
    prefix_valid_count: Vec<u64>,
    factor: u32,
    walking_valid_count: u64,
}

impl VersionState {
    pub fn new(usage_map: Vec<u8>, factor: u32) -> Self {
        let prefix_valid_count = precalculate_prefix_sums(&usage_map, factor);
        debug!(
            "prefix sums built: {} blocks, factor {}, {} stride entries",
            usage_map.len(),
            factor,
            prefix_valid_count.len()
        );
        VersionState {
            usage_map,
            prefix_valid_count,
            factor,
            walking_valid_count: 0,
        }
    }

    pub fn total_blocks(&self) -> u64 {
        self.usage_map.len() as u64
    }

    /// `usage_map[block] == 1`; any other value is "not used" (spec.md §9).
    pub fn is_used(&self, block: u64) -> bool {
        self.usage_map.get(block as usize).copied() == Some(1)
    }

    /// Resynchronizes `walking_valid_count` to the count of used blocks
    /// strictly before `block` (spec.md §4.7).
    pub fn seek(&mut self, block: u64) {
        self.walking_valid_count = if block == 0 {
            0
        } else {
            walking_count_at(&self.usage_map, &self.prefix_valid_count, self.factor, block)
        };
    }

    fn physical_offset(&self, header: &ResolvedHeader) -> u64 {
        let n = self.walking_valid_count;
        header.head_size
            + n * header.block_size as u64
            + (n / header.blocks_per_checksum as u64) * header.checksum_size as u64
    }

    /// Reads the block at `block` (which must equal the cursor most
    /// recently passed to [`Self::seek`]) into `buf`.
    ///
    /// Returns `Ok(true)` if the block was used and its stored bytes were
    /// read into `buf`; `Ok(false)` if the block is unused (the caller is
    /// responsible for zero-filling `buf`, per spec.md §4.7). This mirrors
    /// [`crate::changefile::ChangeFile::read_block`]'s hit/miss shape.
    ///
    /// Does not itself advance `walking_valid_count` — the caller must call
    /// [`Self::advance_past`] exactly once per block regardless of whether
    /// this method or the overlay served it, since the count tracks the
    /// *base* usage map and is independent of the overlay (see
    /// [`Self::advance_past`]).
    pub fn read_block<B: Backend>(
        &mut self,
        header: &ResolvedHeader,
        backend: &B,
        handle: &mut B::Handle,
        block: u64,
        buf: &mut [u8],
    ) -> Result<bool> {
        if !self.is_used(block) {
            return Ok(false);
        }
        let offset = self.physical_offset(header);
        backend.seek(handle, offset as i64, SeekWhence::Start)?;
        backend.read(handle, buf)?;
        Ok(true)
    }

    pub fn block_used(&self, block: u64) -> bool {
        self.is_used(block)
    }

    /// Advances `walking_valid_count` past `block`, incrementing iff the
    /// *base* usage map marks it used — independent of whether `block` was
    /// actually read from the base image or shadowed by the change-file
    /// overlay (spec.md §3.1: the count tracks used blocks strictly before
    /// `current_block` in the base image, not in what was actually served).
    /// Must be called exactly once per block processed by a read, whether or
    /// not [`Self::read_block`] itself was invoked for that block.
    pub fn advance_past(&mut self, block: u64) {
        if self.is_used(block) {
            self.walking_valid_count += 1;
        }
    }
}
