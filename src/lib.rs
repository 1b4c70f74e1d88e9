// SPDX-License-Identifier: BSD-3-Clause

//! Random-access reading and modification of partition image files: compact
//! on-disk representations of a block device where only the allocated
//! blocks are stored, backed by a usage bitmap, with writes redirected to a
//! sidecar change-file overlay so the base image is never mutated.
//!
//! The crate presents an image through [`ImageContext`]: open a path,
//! [`ImageContext::verify`] it against the two supported on-disk formats,
//! then `seek`/`read_blocks`/`write_blocks` as if driving a block device.
//! All byte-level I/O goes through a [`Backend`] implementation the caller
//! supplies — [`PosixBackend`] for ordinary files, or a fake one in tests.
//!
//! ```no_run
//! use partimage::{Backend, ImageContext, ImageOptions, OpenMode, PosixBackend};
//!
//! # fn main() -> partimage::Result<()> {
//! let mut ctx = ImageContext::open(
//!     "disk.img",
//!     None,
//!     OpenMode::ReadWrite,
//!     PosixBackend,
//!     ImageOptions::default(),
//! )?;
//! ctx.verify()?;
//! let mut buf = vec![0u8; ctx.blocksize()? as usize];
//! ctx.seek(0)?;
//! ctx.read_blocks(&mut buf, 1)?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod changefile;
mod context;
pub mod crc;
pub mod error;
pub mod header;
pub mod prefix;
#[cfg(test)]
mod testutil;
pub mod version;

pub use backend::{Backend, PosixBackend};
pub use context::{probe, ImageContext, ImageOptions, OpenMode};
pub use error::{Error, Result};
pub use version::Version;
