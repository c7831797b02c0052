//! # CPU context snapshot
//!
//! The register/flag state of a diverted thread, captured by the trampoline
//! prologue and handed to provider functions by value. Providers never see a
//! live reference to the interrupted thread's state, so a provider crash
//! cannot corrupt it.

/// Integer register and flag snapshot of an x86-64 thread.
///
/// Field order is load-bearing: the trampoline prologue pushes registers so
/// that the saved block on the stack has exactly this layout, and
/// [`divert`](crate::code::x64::divert) restores from it by field offset.
/// `layout_is_stable` below pins the offsets.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuContext {
    /// General purpose register `rax`.
    pub rax: u64,
    /// General purpose register `rbx`.
    pub rbx: u64,
    /// General purpose register `rcx`.
    pub rcx: u64,
    /// General purpose register `rdx`.
    pub rdx: u64,
    /// General purpose register `rsi`.
    pub rsi: u64,
    /// General purpose register `rdi`.
    pub rdi: u64,
    /// Frame register `rbp`.
    pub rbp: u64,
    /// Stack pointer of the interrupted thread, before diversion.
    pub rsp: u64,
    /// General purpose register `r8`.
    pub r8: u64,
    /// General purpose register `r9`.
    pub r9: u64,
    /// General purpose register `r10`.
    pub r10: u64,
    /// General purpose register `r11`.
    pub r11: u64,
    /// General purpose register `r12`.
    pub r12: u64,
    /// General purpose register `r13`.
    pub r13: u64,
    /// General purpose register `r14`.
    pub r14: u64,
    /// General purpose register `r15`.
    pub r15: u64,
    /// Flags register.
    pub rflags: u64,
    /// Instruction pointer: the patch-site address on entry, or the
    /// diversion target when control flow is redirected.
    pub rip: u64,
}

/// Byte offset of `rsp` within [`CpuContext`].
pub const CTX_OFF_RSP: usize = 7 * 8;
/// Byte offset of `rflags` within [`CpuContext`].
pub const CTX_OFF_RFLAGS: usize = 16 * 8;
/// Byte offset of `rip` within [`CpuContext`].
pub const CTX_OFF_RIP: usize = 17 * 8;
/// Total size of the stack block saved by the trampoline prologue
/// (everything up to but not including `rip`, which lives in the skipped
/// scratch area above the save block).
pub const CTX_SAVE_SIZE: usize = CTX_OFF_RIP;
