// SPDX-License-Identifier: BSD-3-Clause

//! A minimal in-memory `Backend` for the integration tests in this
//! directory. Integration tests link only the crate's public API, so this
//! is a small standalone fixture rather than a re-export of the crate's own
//! internal test backend.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use partimage::backend::{Backend, OpenMode, SeekWhence};
use partimage::{Error, Result};

#[derive(Default)]
struct FileState {
    data: Vec<u8>,
}

#[derive(Clone)]
pub struct MemBackend {
    files: Rc<RefCell<HashMap<String, Rc<RefCell<FileState>>>>>,
}

impl MemBackend {
    pub fn new() -> Self {
        MemBackend {
            files: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    pub fn seed(&self, path: &str, data: Vec<u8>) {
        self.files
            .borrow_mut()
            .insert(path.to_string(), Rc::new(RefCell::new(FileState { data })));
    }
}

pub struct MemHandle {
    file: Rc<RefCell<FileState>>,
    pos: u64,
}

impl Backend for MemBackend {
    type Handle = MemHandle;

    fn open(&self, path: &str, mode: OpenMode) -> Result<MemHandle> {
        let mut files = self.files.borrow_mut();
        if !files.contains_key(path) {
            if mode == OpenMode::ReadWriteCreate {
                files.insert(path.to_string(), Rc::new(RefCell::new(FileState::default())));
            } else {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no such file: {path}"),
                )));
            }
        }
        let file = files.get(path).unwrap().clone();
        Ok(MemHandle { file, pos: 0 })
    }

    fn close(&self, _handle: MemHandle) -> Result<()> {
        Ok(())
    }

    fn seek(&self, handle: &mut MemHandle, offset: i64, whence: SeekWhence) -> Result<u64> {
        let len = handle.file.borrow().data.len() as i64;
        let base = match whence {
            SeekWhence::Start => 0,
            SeekWhence::Current => handle.pos as i64,
            SeekWhence::End => len,
        };
        let new_pos = base + offset;
        if new_pos < 0 {
            return Err(Error::InvalidArgument("seek before start of file".into()));
        }
        handle.pos = new_pos as u64;
        Ok(handle.pos)
    }

    fn read(&self, handle: &mut MemHandle, buf: &mut [u8]) -> Result<()> {
        let file = handle.file.borrow();
        let start = handle.pos as usize;
        let end = start + buf.len();
        if end > file.data.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short read",
            )));
        }
        buf.copy_from_slice(&file.data[start..end]);
        drop(file);
        handle.pos += buf.len() as u64;
        Ok(())
    }

    fn write(&self, handle: &mut MemHandle, buf: &[u8]) -> Result<()> {
        let mut file = handle.file.borrow_mut();
        let start = handle.pos as usize;
        let end = start + buf.len();
        if file.data.len() < end {
            file.data.resize(end, 0);
        }
        file.data[start..end].copy_from_slice(buf);
        drop(file);
        handle.pos += buf.len() as u64;
        Ok(())
    }

    fn file_size(&self, handle: &MemHandle) -> Result<u64> {
        Ok(handle.file.borrow().data.len() as u64)
    }
}

pub fn v1_image(block_size: u32, usage_map: &[u8]) -> Vec<u8> {
    use partimage::header;

    let mut buf = Vec::new();
    buf.extend_from_slice(&header::MAGIC);
    buf.extend_from_slice(&header::V1_VERSION);
    buf.extend_from_slice(&block_size.to_le_bytes());
    buf.extend_from_slice(&(usage_map.len() as u64).to_le_bytes());
    buf.extend_from_slice(&((usage_map.len() as u64) * block_size as u64).to_le_bytes());
    buf.extend_from_slice(usage_map);
    buf.extend_from_slice(&header::V1_TRAILING_MAGIC);
    for &used in usage_map {
        if used == 1 {
            buf.extend(std::iter::repeat(0u8).take(block_size as usize + 4));
        }
    }
    buf
}

/// Sets the stored payload (block bytes, not its trailing checksum) for a
/// used logical block inside a V1 image built by [`v1_image`].
pub fn set_v1_block(image: &mut [u8], usage_map: &[u8], block_size: u32, logical: usize, payload: &[u8]) {
    use partimage::header;

    assert_eq!(usage_map[logical], 1, "block {logical} is not marked used");
    let head_size = header::V1_HEADER_LEN as usize + usage_map.len() + header::V1_TRAILING_MAGIC.len();
    let n = usage_map[..logical].iter().filter(|&&b| b == 1).count();
    let stride = block_size as usize + 4;
    let offset = head_size + n * stride;
    image[offset..offset + payload.len()].copy_from_slice(payload);
}

pub fn v2_image(
    block_size: u32,
    total_blocks: u64,
    bits: &[u8],
    checksum_size: u32,
    blocks_per_checksum: u32,
) -> Vec<u8> {
    use partimage::header;

    let mut buf = Vec::new();
    buf.extend_from_slice(&header::MAGIC);
    buf.extend_from_slice(&header::V2_VERSION);
    buf.extend_from_slice(&block_size.to_le_bytes());
    buf.extend_from_slice(&total_blocks.to_le_bytes());
    buf.extend_from_slice(&(total_blocks * block_size as u64).to_le_bytes());
    buf.extend_from_slice(&checksum_size.to_le_bytes());
    buf.extend_from_slice(&blocks_per_checksum.to_le_bytes());
    buf.extend_from_slice(bits);
    buf.extend_from_slice(&partimage::crc::ieee32(bits).to_le_bytes());
    buf
}
