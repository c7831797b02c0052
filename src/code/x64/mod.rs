//! x86-64 branch encodings and the diverging context-restore primitive.

use std::mem;

use crate::context::CpuContext;

/// Length of a rel32 `jmp`, the instruction written at every patch site.
pub const JMP_REL32_LEN: usize = 5;

/// Length of an absolute indirect `jmp` (opcode + rip-relative slot +
/// 8-byte target).
pub const JMP_ABS_LEN: usize = mem::size_of::<JmpAbs>();

/// Byte offset of the 8-byte target inside an absolute `jmp` encoding.
pub const JMP_ABS_TARGET_OFFSET: usize = 6;

#[repr(packed)]
#[allow(dead_code)]
/// Struct helper for generating an absolute jump
struct JmpAbs {
    /// Absolute jmp instruction (jmp [rip + 0])
    jmp: [u8; 6],
    /// Absolute address to jump to
    target: usize,
}

/// Generates an absolute jump to a specified address and returns bytecode
pub fn jmp_abs(target: usize) -> [u8; JMP_ABS_LEN] {
    unsafe {
        mem::transmute(JmpAbs {
            jmp: [0xff, 0x25, 0x00, 0x00, 0x00, 0x00],
            target,
        })
    }
}

/// Generates a rel32 jump from `src` to `dst`, or `None` when the
/// displacement does not fit in 32 bits.
pub fn jmp_rel32(src: usize, dst: usize) -> Option<[u8; JMP_REL32_LEN]> {
    let disp = (dst as i64).checked_sub(src as i64 + JMP_REL32_LEN as i64)?;
    let disp = i32::try_from(disp).ok()?;
    let mut code = [0xe9, 0, 0, 0, 0];
    code[1..].copy_from_slice(&disp.to_le_bytes());
    Some(code)
}

/// Rewrites the 8-byte target of an absolute `jmp` previously emitted with
/// [`jmp_abs`] at `slot`.
///
/// # Safety
///
/// `slot` must point at a live, writable [`JMP_ABS_LEN`]-byte absolute jump
/// encoding, and no thread may be executing the slot's target-load while it
/// is rewritten (callers hold the process quiesced).
pub unsafe fn retarget_jmp_abs(slot: *mut u8, target: usize) {
    let target_bytes = target.to_le_bytes();
    std::ptr::copy_nonoverlapping(
        target_bytes.as_ptr(),
        slot.add(JMP_ABS_TARGET_OFFSET),
        target_bytes.len(),
    );
}

/// Reads back the 8-byte target of an absolute `jmp` at `slot`.
///
/// # Safety
///
/// `slot` must point at a live [`JMP_ABS_LEN`]-byte absolute jump encoding.
pub unsafe fn read_jmp_abs_target(slot: *const u8) -> usize {
    let mut bytes = [0u8; 8];
    std::ptr::copy_nonoverlapping(
        slot.add(JMP_ABS_TARGET_OFFSET),
        bytes.as_mut_ptr(),
        bytes.len(),
    );
    usize::from_le_bytes(bytes)
}

/// Restores the full register state from `ctx` and transfers execution to
/// `ctx.rip`. Never returns.
///
/// This is the single narrow diverging primitive behind control-flow
/// redirection: the protector's requested target (or the trampoline exit
/// slot) goes in `ctx.rip`, everything else is restored verbatim.
///
/// # Safety
///
/// `ctx.rip` must be a valid code address and `ctx.rsp` a valid stack
/// pointer for that code; the current call frame is abandoned, so no
/// unwinding or destructors run for it.
#[cfg(target_arch = "x86_64")]
pub unsafe fn divert(ctx: &CpuContext) -> ! {
    use crate::context::{CTX_OFF_RFLAGS, CTX_OFF_RIP, CTX_OFF_RSP};

    std::arch::asm!(
        // switch to the target stack, then seed it with rip and rflags
        "mov rsp, [rdi + {rsp_off}]",
        "push qword ptr [rdi + {rip_off}]",
        "push qword ptr [rdi + {rflags_off}]",
        "popfq",
        // plain moves below: nothing may touch rflags past this line
        "mov rax, [rdi + 0x00]",
        "mov rbx, [rdi + 0x08]",
        "mov rcx, [rdi + 0x10]",
        "mov rdx, [rdi + 0x18]",
        "mov rsi, [rdi + 0x20]",
        "mov rbp, [rdi + 0x30]",
        "mov r8,  [rdi + 0x40]",
        "mov r9,  [rdi + 0x48]",
        "mov r10, [rdi + 0x50]",
        "mov r11, [rdi + 0x58]",
        "mov r12, [rdi + 0x60]",
        "mov r13, [rdi + 0x68]",
        "mov r14, [rdi + 0x70]",
        "mov r15, [rdi + 0x78]",
        // rdi last: it holds the context pointer until here
        "mov rdi, [rdi + 0x28]",
        "ret",
        rsp_off = const CTX_OFF_RSP,
        rip_off = const CTX_OFF_RIP,
        rflags_off = const CTX_OFF_RFLAGS,
        in("rdi") ctx as *const CpuContext,
        options(noreturn)
    )
}

/// Fallback for non-x86-64 hosts: diversion is unsupported, fail closed.
#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn divert(_ctx: &CpuContext) -> ! {
    std::process::abort()
}
