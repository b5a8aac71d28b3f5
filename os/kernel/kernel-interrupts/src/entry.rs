//! Bare-metal common interrupt entry.
//!
//! Every stub jumps here with the error code and vector on the stack. The
//! entry saves the general purpose registers to complete an
//! [`IsrState`], hands it to the installed [`Dispatcher`], and returns
//! through whatever state the handlers left behind.

use crate::{Dispatcher, IsrState};
use core::arch::naked_asm;
use core::sync::atomic::{AtomicPtr, Ordering};

static DISPATCHER: AtomicPtr<Dispatcher> = AtomicPtr::new(core::ptr::null_mut());

/// Makes `dispatcher` the target of all interrupts.
pub fn install_dispatcher(dispatcher: &'static Dispatcher) {
    DISPATCHER.store(core::ptr::from_ref(dispatcher).cast_mut(), Ordering::Release);
}

/// Address of [`isr_common`], the jump target of every stub.
#[must_use]
pub fn common_entry_address() -> u64 {
    isr_common as usize as u64
}

/// Frame on entry: `[rsp]` vector, `+8` error code, `+16` rip, `+24` cs.
/// After the 15 pushes the stack pointer is 16-byte aligned.
#[unsafe(naked)]
pub extern "C" fn isr_common() {
    naked_asm!(
        "cld",
        "test qword ptr [rsp + 24], 3",
        "jz 1f",
        "swapgs",
        "1:",
        "push rax", "push rbx", "push rcx", "push rdx", "push rsi", "push rdi", "push rbp",
        "push r8", "push r9", "push r10", "push r11", "push r12", "push r13", "push r14", "push r15",
        "mov rdi, rsp",
        "call {dispatch}",
        "pop r15", "pop r14", "pop r13", "pop r12", "pop r11", "pop r10", "pop r9", "pop r8",
        "pop rbp", "pop rdi", "pop rsi", "pop rdx", "pop rcx", "pop rbx", "pop rax",
        // Drop vector and error code.
        "add rsp, 16",
        "test qword ptr [rsp + 8], 3",
        "jz 2f",
        "swapgs",
        "2:",
        "iretq",
        dispatch = sym dispatch_from_entry,
    )
}

extern "C" fn dispatch_from_entry(state: *mut IsrState) {
    // SAFETY: the entry passes the frame it just built on this stack.
    let state = unsafe { &mut *state };
    let dispatcher = DISPATCHER.load(Ordering::Acquire);
    if dispatcher.is_null() {
        log::error!("interrupt {:#04x} before the dispatcher was installed", state.vector());
        return;
    }
    // SAFETY: only `&'static` dispatchers are installed.
    unsafe { &*dispatcher }.dispatch(state);
}
