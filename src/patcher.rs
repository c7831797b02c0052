//! # Code writer
//!
//! Overwrites bytes in live code, lifting page protections for the duration
//! of the write and restoring them afterwards.
//!
//! Unlike a scoped patch guard, these writes are deliberately persistent:
//! patch sites stay diverted until the trampoline manager explicitly
//! restores the displaced bytes, so there is nothing to undo on drop.

use std::ptr;

use region::Protection;
use thiserror::Error;

/// Errors when writing to a live code region.
#[derive(Debug, Error)]
pub enum WriteError {
    /// Error when setting memory protections
    #[error("error setting memory protections: {0}")]
    Protection(#[from] region::Error),
}

/// Overwrites `bytes.len()` bytes at `location`, temporarily making the
/// containing pages writable.
///
/// # Safety
///
/// `location` must be valid for `bytes.len()` bytes, and must be memory not
/// tracked by Rust (module images, trampoline arena blocks). Rewriting bytes
/// that another thread may be executing requires the process to be quiesced
/// first; this function does not check that.
pub unsafe fn write_code(location: *mut u8, bytes: &[u8]) -> Result<(), WriteError> {
    let _guard = region::protect_with_handle(location, bytes.len(), Protection::all())?;
    ptr::copy(bytes.as_ptr(), location, bytes.len());
    Ok(())
}

/// Reads `len` bytes from `location` into an owned buffer.
///
/// # Safety
///
/// `location` must be valid for `len` bytes.
pub unsafe fn read_code(location: *const u8, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    ptr::copy(location, buf.as_mut_ptr(), len);
    buf
}
