//! # Trampoline manager
//!
//! Builds and tears down the diversions at patch sites. An injected point
//! looks like this:
//!
//! ```text
//! patch site:            jmp rel32 ──────────────┐
//!                                                ▼
//! trampoline:    ┌─ register-save prologue
//!                │  call dispatch gateway (site, &saved regs)
//!                │  register-restore epilogue
//!                ├─ displaced original instructions   ◄─ "copied code"
//!                ├─ jmp back to site + displaced_len
//!                └─ [exit slot: jmp abs <redirect>]   (only with redirect)
//! ```
//!
//! The displaced block doubles as the saved copy of the pre-patch bytes:
//! removal restores the site from it, and the signature matcher reads it to
//! hash module content as it was before patching.
//!
//! Trampoline buffers are allocated from the leak-by-design
//! [`alloc`](crate::alloc) arena and are never freed or reused after
//! removal: third-party hooks may have chained off their addresses.

use iced_x86::{Code, Decoder, DecoderOptions, FlowControl};
use log::{debug, error, warn};
use thiserror::Error;

use crate::alloc::{self, proximity::ArenaError};
use crate::code::x64::{self, JMP_ABS_LEN};
use crate::index::PatchIndex;
use crate::patcher::{self, WriteError};
use crate::table::{PointId, Table, PATCH_REGION_SIZE};

/// Longest x86-64 instruction; region reads are padded by this much so the
/// final instruction can always be decoded.
const MAX_INSTR_LEN: usize = 15;

/// Bytes read when analyzing a patch region.
const REGION_READ_LEN: usize = PATCH_REGION_SIZE + MAX_INSTR_LEN - 1;

/// Per-point injection failures. All are non-fatal: the point is left
/// uninjected and a policy counter is incremented.
#[derive(Debug, Error)]
pub enum InjectError {
    /// The region overlaps an already-injected hook region.
    #[error("patch region at {0:#x} overlaps an existing hook")]
    AlreadyHooked(usize),

    /// A control-transfer or interrupt instruction starts and ends inside
    /// the region, so control could branch into the middle of the patch.
    #[error("control transfer inside patch region at {0:#x}")]
    UnsafeRegion(usize),

    /// The region's bytes do not decode as instructions.
    #[error("undecodable instructions in patch region at {0:#x}")]
    Undecodable(usize),

    /// The arena could not place a trampoline within branch range.
    #[error("patch site at {site:#x} cannot reach trampoline at {trampoline:#x}")]
    BranchRange {
        /// Absolute patch-site address.
        site: usize,
        /// Allocated trampoline address.
        trampoline: usize,
    },

    /// Trampoline memory allocation failed.
    #[error(transparent)]
    Arena(#[from] ArenaError),

    /// Writing the site branch failed.
    #[error(transparent)]
    Write(#[from] WriteError),
}

/// Builds, installs, retargets and removes trampolines.
pub struct TrampolineManager {
    /// Absolute address of the dispatch gateway's raw entry function,
    /// baked into every trampoline's call.
    entry: usize,
}

impl TrampolineManager {
    /// Creates a manager whose trampolines call `entry`.
    pub fn new(entry: usize) -> Self {
        TrampolineManager { entry }
    }

    /// Injects one patch point. The owning module must already be matched
    /// (its runtime base set) and the point registered in no index.
    ///
    /// Registration ordering: the point is visible in `index` strictly
    /// before the branch is written at the site, so a thread can never hit
    /// the patch and miss the descriptor.
    ///
    /// # Safety
    ///
    /// The module's code at the point's offset must be mapped and valid for
    /// reads of [`REGION_READ_LEN`] bytes and writes of
    /// [`PATCH_REGION_SIZE`] bytes. All other threads must be quiesced.
    pub unsafe fn inject(
        &self,
        table: &Table,
        index: &mut PatchIndex,
        id: PointId,
    ) -> Result<(), InjectError> {
        let (Some(module), Some(point)) = (table.module(id), table.point(id)) else {
            debug_assert!(false, "inject: descriptor out of range");
            error!("trampoline: inject with dangling descriptor, skipping");
            return Ok(());
        };
        let Some(base) = module.runtime.base() else {
            debug_assert!(false, "inject on unmatched module");
            error!("trampoline: inject on unmatched module, skipping");
            return Ok(());
        };

        let region = point.region(base);
        if index.overlaps(&region) {
            return Err(InjectError::AlreadyHooked(region.start));
        }

        // analyze the site: refuse unsafe regions, expand to an
        // instruction boundary
        let site_bytes = patcher::read_code(region.start as *const u8, REGION_READ_LEN);
        let displaced_len = analyze_region(&site_bytes, region.start)?;

        // assemble the whole trampoline image before touching live code
        let entry_code = emit_entry(region.start, self.entry);
        let displaced_at = entry_code.len();
        let tail_at = displaced_at + displaced_len;
        let exit_at = tail_at + JMP_ABS_LEN;
        let total = exit_at + if point.redirect_offset.is_some() {
            JMP_ABS_LEN
        } else {
            0
        };

        let block = alloc::alloc_exec(region.start, total)?;
        let site_jmp = x64::jmp_rel32(region.start, block.addr).ok_or(
            InjectError::BranchRange {
                site: region.start,
                trampoline: block.addr,
            },
        )?;

        let mut image = entry_code;
        image.extend_from_slice(&site_bytes[..displaced_len]);
        image.extend_from_slice(&x64::jmp_abs(region.start + displaced_len));
        if let Some(redirect) = point.redirect_offset {
            image.extend_from_slice(&x64::jmp_abs(base + redirect));
        }
        std::ptr::copy_nonoverlapping(image.as_ptr(), block.as_mut_ptr(), image.len());

        point.runtime.set_injected(
            block.addr,
            block.addr + displaced_at,
            displaced_len,
            point.redirect_offset.map(|_| block.addr + exit_at),
        );

        if !index.insert(region.clone(), id) {
            // refused insert means a bookkeeping race; back out our state
            point.runtime.clear();
            return Err(InjectError::AlreadyHooked(region.start));
        }

        if let Err(e) = patcher::write_code(region.start as *mut u8, &site_jmp) {
            index.remove(&region);
            point.runtime.clear();
            return Err(e.into());
        }

        debug!(
            "injected point {:#x} -> trampoline {:#x} ({} displaced bytes)",
            region.start, block.addr, displaced_len
        );

        self.resolve_redirects(table, index);
        Ok(())
    }

    /// Removes one injected patch point: restores the original bytes at the
    /// site, then drops the index entry. The trampoline buffer is parked,
    /// never freed.
    ///
    /// Removing a point that is not injected is a defensively-ignored
    /// invariant violation and changes nothing.
    ///
    /// # Safety
    ///
    /// All other threads must be quiesced, and the module's code at the
    /// point must still be mapped and writable.
    pub unsafe fn remove(&self, table: &Table, index: &mut PatchIndex, id: PointId) {
        let (Some(module), Some(point)) = (table.module(id), table.point(id)) else {
            debug_assert!(false, "remove: descriptor out of range");
            error!("trampoline: remove with dangling descriptor, ignoring");
            return;
        };

        let (Some(displaced), Some(base)) = (point.runtime.displaced(), module.runtime.base())
        else {
            debug_assert!(false, "remove of uninjected point");
            error!("trampoline: remove of uninjected point, ignoring");
            return;
        };

        let region = point.region(base);

        // restore the site before dropping the index entry, so the region
        // is never live-patched while unresolvable
        let original = patcher::read_code(displaced as *const u8, PATCH_REGION_SIZE);
        if let Err(e) = patcher::write_code(region.start as *mut u8, &original) {
            debug_assert!(false, "site restore failed: {e}");
            error!("trampoline: failed to restore site {:#x}: {e}", region.start);
            return;
        }

        index.remove(&region);
        point.runtime.clear();
        debug!("removed point {:#x} (trampoline parked)", region.start);

        self.resolve_redirects(table, index);
    }

    /// Re-resolves every injected point's exit-branch target.
    ///
    /// A redirect target that lands inside another injected point's patch
    /// region must not jump onto that point's site branch; it is re-pointed
    /// at the corresponding offset inside the other point's displaced
    /// original code, which is the logical original instruction stream.
    /// Running over the whole table also repairs points whose inbound
    /// redirect sources changed with the last inject/remove.
    ///
    /// # Safety
    ///
    /// All injected trampolines must still be mapped; callers hold the
    /// process quiesced for any slot whose target may be live.
    pub unsafe fn resolve_redirects(&self, table: &Table, index: &PatchIndex) {
        for policy in &table.policies {
            for set in &policy.sets {
                for module in &set.modules {
                    let Some(base) = module.runtime.base() else {
                        continue;
                    };
                    for point in &module.points {
                        let (Some(slot), Some(redirect)) =
                            (point.runtime.exit_slot(), point.redirect_offset)
                        else {
                            continue;
                        };
                        let target = base + redirect;
                        let resolved = index
                            .lookup(target)
                            .and_then(|entry| {
                                let other = table.point(entry.id)?;
                                let displaced = other.runtime.displaced()?;
                                Some(displaced + (target - entry.range.start))
                            })
                            .unwrap_or(target);
                        x64::retarget_jmp_abs(slot as *mut u8, resolved);
                    }
                }
            }
        }
    }
}

/// Validates a patch region and returns the number of bytes to displace.
///
/// `bytes` are the [`REGION_READ_LEN`] bytes at `site`. The region is
/// rejected if any instruction that starts and ends fully inside it can
/// transfer control (branch, call, return, interrupt): control must never
/// be able to land in the middle of the patched bytes.
fn analyze_region(bytes: &[u8], site: usize) -> Result<usize, InjectError> {
    let end = site + PATCH_REGION_SIZE;
    let mut decoder = Decoder::with_ip(64, bytes, site as u64, DecoderOptions::NONE);
    let mut covered = site;

    while covered < end {
        if !decoder.can_decode() {
            return Err(InjectError::Undecodable(site));
        }
        let instr = decoder.decode();
        if instr.code() == Code::INVALID {
            return Err(InjectError::Undecodable(site));
        }
        let start = instr.ip() as usize;
        let stop = start + instr.len();
        if start >= site && stop <= end && instr.flow_control() != FlowControl::Next {
            warn!(
                "patch region {site:#x}: control transfer at {start:#x}, skipping injection"
            );
            return Err(InjectError::UnsafeRegion(site));
        }
        covered = stop;
    }

    Ok(covered - site)
}

/// Emits the trampoline prologue/epilogue: spill every integer register and
/// the flags into a [`CpuContext`](crate::context::CpuContext)-shaped block
/// on the diverted thread's stack, call the gateway entry with the site
/// address and the block pointer, and restore everything on return.
///
/// The first `0x88` bytes below the interrupted stack pointer are skipped
/// before spilling: `0x80` for the leaf-function scratch area the
/// interrupted code may still own, plus 8 for the context's `rip` slot.
fn emit_entry(site: usize, gateway_entry: usize) -> Vec<u8> {
    /// Bytes skipped below the interrupted rsp before the register block.
    const SKIP: i32 = 0x88;
    /// Size of the register block: 17 pushes of 8 bytes.
    const SAVE: i32 = 0x88;

    let mut code = Vec::with_capacity(128);

    // lea rsp, [rsp - SKIP]
    code.extend_from_slice(&[0x48, 0x8d, 0xa4, 0x24]);
    code.extend_from_slice(&(-SKIP).to_le_bytes());
    // pushfq
    code.push(0x9c);
    // push r15 .. r8
    code.extend_from_slice(&[
        0x41, 0x57, 0x41, 0x56, 0x41, 0x55, 0x41, 0x54, 0x41, 0x53, 0x41, 0x52, 0x41, 0x51,
        0x41, 0x50,
    ]);
    // push rax: placeholder for the rsp slot, fixed up below
    code.push(0x50);
    // push rbp, rdi, rsi, rdx, rcx, rbx, rax
    code.extend_from_slice(&[0x55, 0x57, 0x56, 0x52, 0x51, 0x53, 0x50]);
    // lea rax, [rsp + SKIP + SAVE]  (the interrupted rsp)
    code.extend_from_slice(&[0x48, 0x8d, 0x84, 0x24]);
    code.extend_from_slice(&(SKIP + SAVE).to_le_bytes());
    // mov [rsp + 0x38], rax         (context rsp slot)
    code.extend_from_slice(&[0x48, 0x89, 0x44, 0x24, 0x38]);
    // mov rdi, site
    code.extend_from_slice(&[0x48, 0xbf]);
    code.extend_from_slice(&(site as u64).to_le_bytes());
    // mov rsi, rsp                  (context pointer)
    code.extend_from_slice(&[0x48, 0x89, 0xe6]);
    // mov rbp, rsp; and rsp, -16    (ABI stack alignment for the call)
    code.extend_from_slice(&[0x48, 0x89, 0xe5]);
    code.extend_from_slice(&[0x48, 0x83, 0xe4, 0xf0]);
    // mov rax, gateway_entry; call rax
    code.extend_from_slice(&[0x48, 0xb8]);
    code.extend_from_slice(&(gateway_entry as u64).to_le_bytes());
    code.extend_from_slice(&[0xff, 0xd0]);
    // mov rsp, rbp
    code.extend_from_slice(&[0x48, 0x89, 0xec]);
    // pop rax, rbx, rcx, rdx, rsi, rdi, rbp
    code.extend_from_slice(&[0x58, 0x5b, 0x59, 0x5a, 0x5e, 0x5f, 0x5d]);
    // add rsp, 8                    (skip the rsp slot)
    code.extend_from_slice(&[0x48, 0x83, 0xc4, 0x08]);
    // pop r8 .. r15
    code.extend_from_slice(&[
        0x41, 0x58, 0x41, 0x59, 0x41, 0x5a, 0x41, 0x5b, 0x41, 0x5c, 0x41, 0x5d, 0x41, 0x5e,
        0x41, 0x5f,
    ]);
    // popfq
    code.push(0x9d);
    // lea rsp, [rsp + SKIP]
    code.extend_from_slice(&[0x48, 0x8d, 0xa4, 0x24]);
    code.extend_from_slice(&SKIP.to_le_bytes());

    code
}
