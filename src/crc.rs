// SPDX-License-Identifier: BSD-3-Clause

//! CRC-32 implementations used by the image formats.
//!
//! Mirrors the two variants the on-disk formats actually use: a correct,
//! reflected IEEE CRC-32 (V2's bitmap integrity check) and a bug-compatible
//! CRC-32 retained for V1 parity with existing images (see
//! [`bug_compatible32`]).

/// Reflected CRC-32 table, polynomial `0xEDB88320`, generated at compile
/// time rather than transcribed as 256 literals.
const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 {
                0xEDB8_8320 ^ (c >> 1)
            } else {
                c >> 1
            };
            k += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = build_table();

/// Standard IEEE CRC-32: init `0xFFFFFFFF`, final XOR `0xFFFFFFFF`.
///
/// Used to validate the V2 usage bitmap (spec: bit-exact against the
/// reference format).
pub fn ieee32(buf: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in buf {
        let idx = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[idx];
    }
    crc ^ 0xFFFF_FFFF
}

/// The V1-era bug-compatible CRC-32.
///
/// The reference implementation this format derives from iterates `size`
/// times over the buffer's *first byte* instead of walking the buffer. This
/// reproduces that bug bit-for-bit: any implementation that instead produces
/// the CRC of the buffer's actual contents will not match checksums already
/// present in existing images.
pub fn bug_compatible32(buf: &[u8]) -> u32 {
    let Some(&c) = buf.first() else {
        return 0;
    };
    let mut crc = 0u32;
    for _ in 0..buf.len() {
        let idx = ((crc ^ c as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[idx];
    }
    crc
}
