// SPDX-License-Identifier: BSD-3-Clause

//! Version-1 verify (spec.md §4.3): a byte-wide usage map, no configurable
//! per-block checksum region, trailed by a single magic marker.

use log::warn;

use crate::backend::{Backend, SeekWhence};
use crate::error::{Error, Result};
use crate::header::{self, ResolvedHeader};

use super::VersionState;

/// `checksum_size`/`blocks_per_checksum` V1 resolves to: the format lays a
/// fixed 4-byte bug-compatible CRC (§4.5) after every stored block.
const V1_CHECKSUM_SIZE: u32 = 4;
const V1_BLOCKS_PER_CHECKSUM: u32 = 1;

/// Parses and validates a V1 image, assuming `handle`'s cursor sits right
/// after the shared 20-byte outer header (magic + version stamp).
///
/// `on_anomalous_byte`, if given, is invoked once per usage-map byte whose
/// value is neither 0 nor 1 (spec.md §9 open question), with the block
/// index and the raw byte — those bytes are still treated as "not used".
pub fn verify<B: Backend>(
    backend: &B,
    handle: &mut B::Handle,
    tolerant: bool,
    factor: u32,
    mut on_anomalous_byte: Option<&mut dyn FnMut(usize, u8)>,
) -> Result<(ResolvedHeader, VersionState)> {
    let mut fields = [0u8; header::V1_FIELDS_LEN as usize];
    backend.read(handle, &mut fields)?;
    let block_size = header::read_u32_le(&fields, 0);
    let total_blocks = header::read_u64_le(&fields, 4);
    let disk_device_size = header::read_u64_le(&fields, 12);

    let head_size = header::V1_HEADER_LEN + total_blocks + 8;

    backend.seek(handle, header::V1_HEADER_LEN as i64, SeekWhence::Start)?;
    let mut usage_map = vec![0u8; total_blocks as usize];
    backend.read(handle, &mut usage_map)?;

    let mut anomalies = 0usize;
    for (i, &byte) in usage_map.iter().enumerate() {
        if byte != 0 && byte != 1 {
            anomalies += 1;
            if let Some(cb) = on_anomalous_byte.as_deref_mut() {
                cb(i, byte);
            }
        }
    }
    if anomalies > 0 {
        warn!("V1 usage map contains {anomalies} anomalous byte(s); treated as not used");
    }

    let mut trailing = [0u8; 8];
    backend.read(handle, &mut trailing)?;
    if trailing != header::V1_TRAILING_MAGIC {
        if tolerant {
            warn!("V1 trailing magic mismatch tolerated (tolerant mode)");
        } else {
            return Err(Error::InvalidFormat("V1 trailing magic mismatch".into()));
        }
    }

    let state = VersionState::new(usage_map, factor);

    // spec.md §4.6: device_size is recomputed as a side effect of prefix-sum
    // precomputation and the on-disk value is only advisory.
    let device_size = total_blocks * block_size as u64;
    if device_size != disk_device_size {
        warn!(
            "V1 device_size on disk ({disk_device_size}) disagrees with total_blocks*block_size ({device_size}); using the computed value"
        );
    }

    let resolved = ResolvedHeader {
        block_size,
        total_blocks,
        device_size,
        checksum_size: V1_CHECKSUM_SIZE,
        blocks_per_checksum: V1_BLOCKS_PER_CHECKSUM,
        head_size,
    };
    Ok((resolved, state))
}
