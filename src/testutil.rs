// SPDX-License-Identifier: BSD-3-Clause

//! An in-memory [`Backend`] used by unit and integration tests. The engine
//! never talks to the OS directly, so a fake backend keyed by path name is
//! all a test needs — no tempfiles, no real file descriptors.

#![cfg(test)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::backend::{Backend, OpenMode, SeekWhence};
use crate::error::{Error, Result};

#[derive(Default)]
struct FileState {
    data: Vec<u8>,
}

/// A `Backend` over an in-memory map of path -> byte vector. Each `open`
/// returns a cursor handle sharing the same backing store, so writes from
/// one handle are visible to another opened on the same path (matching the
/// real filesystem semantics the engine relies on, e.g. reopening a change
/// file after `finish`).
pub struct MemBackend {
    files: Rc<RefCell<HashMap<String, Rc<RefCell<FileState>>>>>,
}

impl MemBackend {
    pub fn new() -> Self {
        MemBackend {
            files: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    /// Seeds `path` with fixed content, as if a base image had been written
    /// out-of-band before this engine opened it.
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
        let exists = files.contains_key(path);
        if !exists {
            match mode {
                OpenMode::ReadWriteCreate => {
                    files.insert(path.to_string(), Rc::new(RefCell::new(FileState::default())));
                }
                _ => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no such file: {path}"),
                    )));
                }
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
