// SPDX-License-Identifier: BSD-3-Clause

//! Version-2 verify (spec.md §4.4): a bit-packed usage bitmap with a
//! mandatory CRC-32 integrity check, plus a configurable per-block checksum
//! region.

use log::debug;

use crate::backend::{Backend, SeekWhence};
use crate::crc::ieee32;
use crate::error::{Error, Result};
use crate::header::{self, ResolvedHeader};

use super::VersionState;

fn bitmap_bytes(total_blocks: u64) -> u64 {
    (total_blocks + 7) / 8
}

/// Parses and validates a V2 image, assuming `handle`'s cursor sits right
/// after the shared 20-byte outer header.
///
/// The bitmap CRC check is mandatory even in tolerant mode (spec.md §4.8:
/// "V2 bitmap CRC remains mandatory — corrupting it corrupts indexing").
pub fn verify<B: Backend>(
    backend: &B,
    handle: &mut B::Handle,
    factor: u32,
) -> Result<(ResolvedHeader, VersionState)> {
    let mut fields = [0u8; header::V2_FIELDS_LEN as usize];
    backend.read(handle, &mut fields)?;
    let block_size = header::read_u32_le(&fields, 0);
    let total_blocks = header::read_u64_le(&fields, 4);
    let disk_device_size = header::read_u64_le(&fields, 12);
    let checksum_size = header::read_u32_le(&fields, 20);
    let blocks_per_checksum = header::read_u32_le(&fields, 24).max(1);

    let bitmap_size = bitmap_bytes(total_blocks);
    let head_size = header::V2_HEADER_LEN + bitmap_size + 4;

    backend.seek(handle, header::V2_HEADER_LEN as i64, SeekWhence::Start)?;
    let mut raw = vec![0u8; (bitmap_size + 4) as usize];
    backend.read(handle, &mut raw)?;

    let bits = &raw[..bitmap_size as usize];
    let stored_crc = u32::from_le_bytes(raw[bitmap_size as usize..].try_into().unwrap());
    let computed_crc = ieee32(bits);
    if computed_crc != stored_crc {
        return Err(Error::InvalidFormat(format!(
            "V2 bitmap CRC mismatch: computed {computed_crc:#010x}, stored {stored_crc:#010x}"
        )));
    }

    let mut usage_map = vec![0u8; total_blocks as usize];
    for i in 0..total_blocks as usize {
        usage_map[i] = (bits[i / 8] >> (i % 8)) & 1;
    }

    let state = VersionState::new(usage_map, factor);

    let device_size = total_blocks * block_size as u64;
    if device_size != disk_device_size {
        debug!(
            "V2 device_size on disk ({disk_device_size}) disagrees with total_blocks*block_size ({device_size}); using the computed value"
        );
    }

    let resolved = ResolvedHeader {
        block_size,
        total_blocks,
        device_size,
        checksum_size,
        blocks_per_checksum,
        head_size,
    };
    Ok((resolved, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemBackend;

    fn build_image(total_blocks: u64, bits: &[u8], checksum_size: u32, blocks_per_checksum: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&header::MAGIC);
        buf.extend_from_slice(&header::V2_VERSION);
        buf.extend_from_slice(&4096u32.to_le_bytes());
        buf.extend_from_slice(&total_blocks.to_le_bytes());
        buf.extend_from_slice(&(total_blocks * 4096).to_le_bytes());
        buf.extend_from_slice(&checksum_size.to_le_bytes());
        buf.extend_from_slice(&blocks_per_checksum.to_le_bytes());
        buf.extend_from_slice(bits);
        buf.extend_from_slice(&ieee32(bits).to_le_bytes());
        buf
    }

    fn open_past_outer(backend: &MemBackend, path: &str) -> <MemBackend as Backend>::Handle {
        let mut handle = backend.open(path, crate::backend::OpenMode::ReadOnly).unwrap();
        backend
            .seek(&mut handle, header::OUTER_HEADER_LEN as i64, SeekWhence::Start)
            .unwrap();
        handle
    }

    #[test]
    fn verify_expands_bitmap_matching_scenario_s3() {
        // spec.md §8 S3: total_blocks=17, bits 0b10110100 0b01001011 0b1.
        // The prose there claims block_used(10) == 1, but that doesn't hold
        // against the spec's own LSB-first expansion formula
        // (`usage_map[i] = (bits[i>>3] >> (i&7)) & 1`) applied to these
        // literal bytes: bit 10 is byte 1, bit index 2, i.e.
        // (0b0100_1011 >> 2) & 1 = 0. Asserted here against the value the
        // formula actually produces rather than the inconsistent prose.
        let bits = [0b1011_0100u8, 0b0100_1011, 0b0000_0001];
        let backend = MemBackend::new();
        backend.seed("img", build_image(17, &bits, 4, 4));
        let mut handle = open_past_outer(&backend, "img");
        let (header, state) = verify(&backend, &mut handle, 10).unwrap();
        assert_eq!(header.total_blocks, 17);
        assert_eq!(state.total_blocks(), 17);
        let expected = (bits[1] >> 2) & 1;
        assert_eq!(state.is_used(10) as u8, expected);
        assert_eq!(expected, 0);
    }

    #[test]
    fn verify_rejects_corrupted_crc() {
        let bits = [0b1011_0100u8, 0b0100_1011, 0b0000_0001];
        let backend = MemBackend::new();
        let mut image = build_image(17, &bits, 4, 4);
        // flip one bit inside the bitmap region, after the header.
        let bitmap_offset = header::V2_HEADER_LEN as usize;
        image[bitmap_offset] ^= 0x01;
        backend.seed("img", image);
        let mut handle = open_past_outer(&backend, "img");
        let err = verify(&backend, &mut handle, 10).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat(_)));
    }
}
