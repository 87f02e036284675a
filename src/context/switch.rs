//! Machine-level symmetric context transfer.
//!
//! Three primitives operate on saved execution contexts: `make` fabricates a
//! context on a fresh stack, `jump` transfers control to one, and `ontop`
//! transfers control while running a function on the target stack first
//! (used to destroy the stack we are leaving). Every transfer carries one
//! data pointer across.

use std::arch::global_asm;

/// Handle to a suspended execution context (stack pointer into its saved
/// register frame). Consuming it through a jump invalidates the old value.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Continuation(*mut ());

unsafe impl Send for Continuation {}

impl Continuation {
    pub(crate) fn null() -> Self {
        Continuation(std::ptr::null_mut())
    }

    pub(crate) fn from_raw(raw: *mut ()) -> Self {
        Continuation(raw)
    }

    pub(crate) fn into_raw(self) -> *mut () {
        self.0
    }

    pub(crate) fn into_option(self) -> Option<Continuation> {
        if self.0.is_null() {
            None
        } else {
            Some(self)
        }
    }
}

/// What a context transfer hands to the other side: the continuation of the
/// context that performed the transfer, plus one pointer of payload.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub(crate) struct Transfer {
    pub(crate) continuation: Continuation,
    pub(crate) data: *mut (),
}

extern "C" {
    /// Fabricates a context whose first resumption enters `entry` on the
    /// stack region `[sp - size, sp)`. The entry function receives the
    /// jumping context's continuation and the jump's data pointer.
    pub(crate) fn coriolis_make_context(
        sp: *mut u8,
        size: usize,
        entry: extern "C" fn(Transfer) -> !,
    ) -> Continuation;

    /// Suspends the current context and resumes `to`. Returns when some
    /// later transfer resumes us; the returned continuation is null if the
    /// resuming context destroyed itself on the way out.
    pub(crate) fn coriolis_jump_context(to: Continuation, data: *mut ()) -> Transfer;

    /// Like `coriolis_jump_context`, but runs `f` on the target stack before
    /// the target's suspended transfer returns; whatever `f` returns becomes
    /// that transfer's result. The calling context is *not* saved.
    pub(crate) fn coriolis_ontop_context(
        to: Continuation,
        data: *mut (),
        f: extern "C" fn(Transfer) -> Transfer,
    ) -> Transfer;
}

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("coriolis only supports x86_64 Linux");

// Saved frame layout, from the context pointer upward:
//   0x00  MXCSR (4) + x87 control word (4)
//   0x08  R12    0x10  R13    0x18  R14    0x20  R15
//   0x28  RBX    0x30  RBP    0x38  RIP
// A fabricated frame seeds RBX with the entry function and RIP with the
// trampoline below; RBP holds a guard that faults if the entry ever returns.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
global_asm!(
    r#"
.text

.globl coriolis_jump_context
.balign 16
.type coriolis_jump_context,@function
coriolis_jump_context:
    leaq -0x38(%rsp), %rsp
    stmxcsr (%rsp)
    fnstcw 0x4(%rsp)
    movq %r12, 0x8(%rsp)
    movq %r13, 0x10(%rsp)
    movq %r14, 0x18(%rsp)
    movq %r15, 0x20(%rsp)
    movq %rbx, 0x28(%rsp)
    movq %rbp, 0x30(%rsp)
    movq %rsp, %rax
    movq %rdi, %rsp
    ldmxcsr (%rsp)
    fldcw 0x4(%rsp)
    movq 0x8(%rsp), %r12
    movq 0x10(%rsp), %r13
    movq 0x18(%rsp), %r14
    movq 0x20(%rsp), %r15
    movq 0x28(%rsp), %rbx
    movq 0x30(%rsp), %rbp
    movq 0x38(%rsp), %r8
    leaq 0x40(%rsp), %rsp
    movq %rsi, %rdx
    movq %rax, %rdi
    jmp *%r8
.size coriolis_jump_context,.-coriolis_jump_context

.globl coriolis_ontop_context
.balign 16
.type coriolis_ontop_context,@function
coriolis_ontop_context:
    movq %rdx, %r8
    leaq -0x38(%rsp), %rsp
    stmxcsr (%rsp)
    fnstcw 0x4(%rsp)
    movq %r12, 0x8(%rsp)
    movq %r13, 0x10(%rsp)
    movq %r14, 0x18(%rsp)
    movq %r15, 0x20(%rsp)
    movq %rbx, 0x28(%rsp)
    movq %rbp, 0x30(%rsp)
    movq %rsp, %rax
    movq %rdi, %rsp
    ldmxcsr (%rsp)
    fldcw 0x4(%rsp)
    movq 0x8(%rsp), %r12
    movq 0x10(%rsp), %r13
    movq 0x18(%rsp), %r14
    movq 0x20(%rsp), %r15
    movq 0x28(%rsp), %rbx
    movq 0x30(%rsp), %rbp
    leaq 0x38(%rsp), %rsp
    movq %rsi, %rdx
    movq %rax, %rdi
    jmp *%r8
.size coriolis_ontop_context,.-coriolis_ontop_context

.globl coriolis_make_context
.balign 16
.type coriolis_make_context,@function
coriolis_make_context:
    movq %rdi, %rax
    andq $-16, %rax
    leaq -0x40(%rax), %rax
    movq %rdx, 0x28(%rax)
    stmxcsr (%rax)
    fnstcw 0x4(%rax)
    leaq 1f(%rip), %rcx
    movq %rcx, 0x38(%rax)
    leaq 2f(%rip), %rcx
    movq %rcx, 0x30(%rax)
    ret
1:
    push %rbp
    jmp *%rbx
2:
    ud2
.size coriolis_make_context,.-coriolis_make_context

.section .note.GNU-stack,"",@progbits
.text
"#,
    options(att_syntax)
);
