// SPDX-License-Identifier: BSD-3-Clause

//! The image context: lifecycle, flag state machine, path/handle ownership,
//! and dispatch to the active version (spec.md §4.1).
//!
//! The reference implementation tracks partial construction with flag bits
//! and raw pointers freed by hand on every error path (spec.md §9, "Raw
//! pointer ownership across init/teardown"). Here that's folded into
//! `Option`-typed fields: a field's presence *is* the acquisition state, and
//! `close`/`Drop` release whatever is present regardless of how far
//! construction got. [`Flags`] still exists alongside those `Option`s —
//! kept for the same reason the teacher keeps `bitflags`-based flag sets
//! (`oslib::WritevFlags`) — but it is a cached view of that state plus the
//! two mode bits (`READ_ONLY`, `TOLERANT`) that aren't themselves owned
//! resources, not the mechanism that makes teardown safe.

use bitflags::bitflags;
use log::{debug, trace};

use crate::backend::{Backend, OpenMode as BackendOpenMode, SeekWhence};
use crate::changefile::ChangeFile;
use crate::error::{Error, Result};
use crate::header::{self, OuterHeader, ResolvedHeader};
use crate::prefix::DEFAULT_FACTOR;
use crate::version::{v1, v2, Version, VersionState};

bitflags! {
    struct Flags: u32 {
        const VALID        = 0b0000_0000_0001;
        const OPEN         = 0b0000_0000_0010;
        const HEAD_VALID   = 0b0000_0000_0100;
        const VERIFIED     = 0b0000_0000_1000;
        const VERSION_INIT = 0b0000_0001_0000;
        const HAVE_CFDEP   = 0b0000_0010_0000;
        const CF_OPEN      = 0b0000_0100_0000;
        const CF_VERIFIED  = 0b0000_1000_0000;
        const READ_ONLY    = 0b0001_0000_0000;
        const TOLERANT     = 0b0010_0000_0000;
    }
}

/// How the image was asked to be opened (spec.md §3.1 `open_mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
    ReadWriteCreate,
}

/// Constructor-configurable knobs (SPEC_FULL.md §2.3).
pub struct ImageOptions {
    /// Prefix-sum stride exponent; default [`DEFAULT_FACTOR`] (one entry
    /// per 1024 blocks, spec.md §9).
    pub factor: u32,
    /// Invoked once per anomalous V1 usage-map byte (value neither 0 nor 1)
    /// encountered during verify (spec.md §9 open question).
    pub on_anomalous_byte: Option<Box<dyn FnMut(usize, u8)>>,
}

impl Default for ImageOptions {
    fn default() -> Self {
        ImageOptions {
            factor: DEFAULT_FACTOR,
            on_anomalous_byte: None,
        }
    }
}

/// Checks whether an I/O error represents a missing file, the signal this
/// crate uses to tell "overlay not created yet" apart from a real failure.
fn is_not_found(err: &Error) -> bool {
    matches!(err, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
}

/// A process-local handle for an opened partition image (spec.md §3.1).
pub struct ImageContext<B: Backend> {
    backend: B,
    flags: Flags,
    path: String,
    change_file_path: Option<String>,
    base_handle: Option<B::Handle>,
    header: Option<ResolvedHeader>,
    version: Option<Version>,
    state: Option<VersionState>,
    change_file: Option<ChangeFile<B>>,
    invalid_block: Vec<u8>,
    current_block: u64,
    open_mode: OpenMode,
    factor: u32,
    on_anomalous_byte: Option<Box<dyn FnMut(usize, u8)>>,
}

/// Opens `path` read-only, checks it is a recognized partition image, and
/// closes it. Never mutates anything (spec.md §4.1 `probe`).
pub fn probe<B: Backend>(path: &str, backend: &B) -> Result<()> {
    let mut handle = backend.open(path, BackendOpenMode::ReadOnly)?;
    let mut buf = [0u8; header::OUTER_HEADER_LEN as usize];
    let result = (|| {
        backend.read(&mut handle, &mut buf)?;
        let outer = OuterHeader::parse(&buf)
            .ok_or_else(|| Error::InvalidFormat("image shorter than the outer header".into()))?;
        if outer.magic != header::MAGIC {
            return Err(Error::InvalidFormat("magic mismatch".into()));
        }
        Version::from_stamp(&outer.version)
            .ok_or_else(|| Error::NotFound(format!("unrecognized version stamp {:?}", outer.version)))?;
        Ok(())
    })();
    backend.close(handle)?;
    result
}

impl<B: Backend> ImageContext<B> {
    /// Allocates a context and opens the base file read-only unconditionally
    /// (spec.md §4.1: the backing image is never opened for writing, even
    /// in read-write mode — see §5). Does not read the header.
    pub fn open(
        path: &str,
        change_file_path: Option<&str>,
        open_mode: OpenMode,
        backend: B,
        options: ImageOptions,
    ) -> Result<Self> {
        let base_handle = backend.open(path, BackendOpenMode::ReadOnly)?;
        let mut flags = Flags::VALID | Flags::OPEN;
        if open_mode == OpenMode::ReadOnly {
            flags |= Flags::READ_ONLY;
        }
        debug!("opened {path} ({open_mode:?})");
        Ok(ImageContext {
            backend,
            flags,
            path: path.to_string(),
            change_file_path: change_file_path.map(str::to_string),
            base_handle: Some(base_handle),
            header: None,
            version: None,
            state: None,
            change_file: None,
            invalid_block: Vec::new(),
            current_block: 0,
            open_mode,
            factor: options.factor,
            on_anomalous_byte: options.on_anomalous_byte,
        })
    }

    /// Sets tolerant (soft-verify) mode. Must be called before [`Self::verify`]
    /// to have any effect (spec.md §4.8).
    pub fn tolerant_mode(&mut self) -> Result<()> {
        if !self.flags.contains(Flags::OPEN) {
            return Err(Error::InvalidArgument("context not open".into()));
        }
        self.flags |= Flags::TOLERANT;
        Ok(())
    }

    fn read_ready(&self) -> bool {
        self.flags.contains(Flags::OPEN | Flags::VERIFIED | Flags::HEAD_VALID | Flags::VERSION_INIT)
    }

    fn write_ready(&self) -> bool {
        self.read_ready()
            && !self.flags.contains(Flags::READ_ONLY)
            && self.flags.contains(Flags::HAVE_CFDEP | Flags::CF_VERIFIED)
    }

    /// Reads the fixed header, identifies the format, and builds the
    /// per-version state (spec.md §4.1 `verify`).
    pub fn verify(&mut self) -> Result<()> {
        if !self.flags.contains(Flags::OPEN) {
            return Err(Error::InvalidArgument("context not open".into()));
        }
        let handle = self
            .base_handle
            .as_mut()
            .ok_or_else(|| Error::InvalidArgument("no base handle".into()))?;

        self.backend.seek(handle, 0, SeekWhence::Start)?;
        let mut outer_buf = [0u8; header::OUTER_HEADER_LEN as usize];
        self.backend.read(handle, &mut outer_buf)?;
        let outer = OuterHeader::parse(&outer_buf)
            .ok_or_else(|| Error::InvalidFormat("image shorter than the outer header".into()))?;
        if outer.magic != header::MAGIC {
            return Err(Error::InvalidFormat("magic mismatch".into()));
        }
        let version = Version::from_stamp(&outer.version)
            .ok_or_else(|| Error::NotFound(format!("unrecognized version stamp {:?}", outer.version)))?;

        let tolerant = self.flags.contains(Flags::TOLERANT);
        let (resolved, state) = match version {
            Version::V1 => v1::verify(
                &self.backend,
                handle,
                tolerant,
                self.factor,
                self.on_anomalous_byte.as_deref_mut(),
            )?,
            Version::V2 => v2::verify(&self.backend, handle, self.factor)?,
        };

        self.invalid_block = vec![0u8; resolved.block_size as usize];
        self.header = Some(resolved);
        self.version = Some(version);
        self.state = Some(state);
        self.current_block = 0;
        self.flags |= Flags::HEAD_VALID | Flags::VERIFIED | Flags::VERSION_INIT;
        debug!(
            "verified {} as {version:?}: {} blocks of {} bytes",
            self.path, resolved.total_blocks, resolved.block_size
        );

        if let Some(cf_path) = self.change_file_path.clone() {
            self.flags |= Flags::HAVE_CFDEP;
            match ChangeFile::open(&self.backend, &cf_path, resolved.block_size, resolved.total_blocks) {
                Ok(cf) => {
                    self.change_file = Some(cf);
                    self.flags |= Flags::CF_OPEN | Flags::CF_VERIFIED;
                    debug!("attached existing change file {cf_path}");
                }
                Err(e) if is_not_found(&e) => {
                    debug!("change file {cf_path} not present yet; deferring to first write");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn header(&self) -> Result<&ResolvedHeader> {
        self.header
            .as_ref()
            .filter(|_| self.flags.contains(Flags::VERIFIED))
            .ok_or_else(|| Error::InvalidArgument("image not verified".into()))
    }

    pub fn blocksize(&self) -> Result<u32> {
        Ok(self.header()?.block_size)
    }

    pub fn blockcount(&self) -> Result<u64> {
        Ok(self.header()?.total_blocks)
    }

    pub fn device_size(&self) -> Result<u64> {
        Ok(self.header()?.device_size)
    }

    /// Which on-disk format `verify` identified this image as.
    pub fn version(&self) -> Result<Version> {
        self.version
            .filter(|_| self.flags.contains(Flags::VERIFIED))
            .ok_or_else(|| Error::InvalidArgument("image not verified".into()))
    }

    /// Positions the cursor at `block`, resynchronizing the walking prefix
    /// counter and the overlay's own cursor (spec.md §4.7).
    pub fn seek(&mut self, block: u64) -> Result<()> {
        if !self.read_ready() {
            return Err(Error::InvalidArgument("image not read-ready".into()));
        }
        let total_blocks = self.header()?.total_blocks;
        if block > total_blocks {
            return Err(Error::InvalidArgument(format!(
                "block {block} out of range (0..={total_blocks})"
            )));
        }
        self.state.as_mut().unwrap().seek(block);
        if let Some(cf) = self.change_file.as_mut() {
            cf.seek(block)?;
        }
        self.current_block = block;
        Ok(())
    }

    pub fn tell(&self) -> Result<u64> {
        if !self.read_ready() {
            return Err(Error::InvalidArgument("image not read-ready".into()));
        }
        Ok(self.current_block)
    }

    /// Reads `n` blocks starting at the cursor into `buf` (spec.md §4.1
    /// `read-blocks`). Stops at the first error; blocks already written into
    /// `buf` and a cursor advanced past them are not rolled back, but the
    /// cursor never advances past the failing block.
    pub fn read_blocks(&mut self, buf: &mut [u8], n: u64) -> Result<()> {
        if !self.read_ready() {
            return Err(Error::InvalidArgument("image not read-ready".into()));
        }
        let block_size = self.header()?.block_size as usize;
        if buf.len() < n as usize * block_size {
            return Err(Error::InvalidArgument("output buffer smaller than n blocks".into()));
        }
        let header = *self.header()?;
        let total_blocks = header.total_blocks;
        self.state.as_mut().unwrap().seek(self.current_block);

        for i in 0..n {
            let block = self.current_block;
            if block >= total_blocks {
                return Err(Error::InvalidArgument("read past end of device".into()));
            }
            let chunk = &mut buf[i as usize * block_size..(i as usize + 1) * block_size];

            let mut served = false;
            if let Some(cf) = self.change_file.as_mut() {
                cf.seek(block)?;
                served = cf.read_block(&self.backend, chunk)?;
            }
            if served {
                trace!("block {block}: served from overlay");
            } else {
                let handle = self.base_handle.as_mut().unwrap();
                let read = self
                    .state
                    .as_mut()
                    .unwrap()
                    .read_block(&header, &self.backend, handle, block, chunk)?;
                if read {
                    trace!("block {block}: served from base image");
                } else {
                    trace!("block {block}: unused, zero-filled");
                    chunk.copy_from_slice(&self.invalid_block);
                }
            }
            // The base-image walking count advances regardless of whether
            // this block was actually served from the base image or from
            // the overlay — it tracks the base usage map, not what was
            // served (see `VersionState::advance_past`).
            self.state.as_mut().unwrap().advance_past(block);
            self.current_block += 1;
        }
        Ok(())
    }

    /// Whether the block at the cursor is used, per the overlay first and
    /// the base usage map otherwise (spec.md §4.7 `block-used`).
    pub fn block_used(&mut self) -> Result<bool> {
        if !self.read_ready() {
            return Err(Error::InvalidArgument("image not read-ready".into()));
        }
        let block = self.current_block;
        let total_blocks = self.header()?.total_blocks;
        if block >= total_blocks {
            return Err(Error::InvalidArgument("cursor at or past end of device".into()));
        }
        if let Some(cf) = self.change_file.as_mut() {
            cf.seek(block)?;
            if cf.block_used()? {
                return Ok(true);
            }
        }
        Ok(self.state.as_ref().unwrap().block_used(block))
    }

    /// Opens the overlay (or creates it at `<image-path>.cf` if no overlay
    /// is attached yet) on the first write (spec.md §4.1 `write-blocks`).
    fn ensure_change_file(&mut self) -> Result<()> {
        if self.change_file.is_some() {
            return Ok(());
        }
        let header = *self.header()?;
        let path = self
            .change_file_path
            .clone()
            .unwrap_or_else(|| format!("{}.cf", self.path));

        let cf = match ChangeFile::open(&self.backend, &path, header.block_size, header.total_blocks) {
            Ok(cf) => cf,
            Err(e) if is_not_found(&e) => {
                ChangeFile::create(&self.backend, &path, header.block_size, header.total_blocks)?
            }
            Err(e) => return Err(e),
        };
        debug!("attached change file {path}");
        self.change_file_path = Some(path);
        self.change_file = Some(cf);
        self.flags |= Flags::HAVE_CFDEP | Flags::CF_OPEN | Flags::CF_VERIFIED;
        Ok(())
    }

    /// Writes `n` blocks from `buf` starting at the cursor, exclusively to
    /// the overlay (spec.md §4.1 `write-blocks`). The base image is never
    /// touched by this engine.
    pub fn write_blocks(&mut self, buf: &[u8], n: u64) -> Result<()> {
        if !self.read_ready() {
            return Err(Error::InvalidArgument("image not read-ready".into()));
        }
        if self.flags.contains(Flags::READ_ONLY) {
            return Err(Error::InvalidArgument("image opened read-only".into()));
        }
        let block_size = self.header()?.block_size as usize;
        let total_blocks = self.header()?.total_blocks;
        if buf.len() < n as usize * block_size {
            return Err(Error::InvalidArgument("input buffer smaller than n blocks".into()));
        }
        self.ensure_change_file()?;
        self.state.as_mut().unwrap().seek(self.current_block);

        for i in 0..n {
            let block = self.current_block;
            if block >= total_blocks {
                return Err(Error::InvalidArgument("write past end of device".into()));
            }
            let chunk = &buf[i as usize * block_size..(i as usize + 1) * block_size];
            let cf = self.change_file.as_mut().unwrap();
            cf.seek(block)?;
            cf.write_block(&self.backend, chunk)?;
            trace!("block {block}: written to overlay");
            self.current_block += 1;
        }
        Ok(())
    }

    /// Flushes the overlay (spec.md §4.1 `sync`).
    pub fn sync(&mut self) -> Result<()> {
        if !self.write_ready() {
            return Err(Error::InvalidArgument("image not write-ready".into()));
        }
        self.change_file.as_mut().unwrap().sync(&self.backend)
    }

    /// Flushes the overlay if open, closes the base file, and releases all
    /// owned resources. Calling this twice (or on a context that failed
    /// partway through `open`/`verify`) is a no-op the second time, since
    /// each resource field is `take()`n on first release.
    pub fn close(&mut self) -> Result<()> {
        let mut first_err = None;
        if let Some(cf) = self.change_file.take() {
            if let Err(e) = cf.finish(&self.backend) {
                first_err = Some(e);
            }
        }
        if let Some(handle) = self.base_handle.take() {
            if let Err(e) = self.backend.close(handle) {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        self.flags = Flags::empty();
        self.header = None;
        self.state = None;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<B: Backend> Drop for ImageContext<B> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
