/// Register image saved by the common interrupt entry.
///
/// Laid out in stack order, lowest address first: the general purpose
/// registers pushed by the common entry, the vector and error code pushed
/// by the stub (a dummy zero where the CPU pushes none), then the frame
/// the CPU pushes. Handlers may edit it; `iretq` resumes whatever it
/// describes once the dispatcher returns.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IsrState {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

const _: () = assert!(size_of::<IsrState>() == 22 * 8);

impl IsrState {
    /// Offset of `vector` from the start of the image.
    pub const VECTOR_OFFSET: usize = 15 * 8;

    /// Whether the interrupted code ran in ring 3.
    #[must_use]
    pub const fn from_userland(&self) -> bool {
        self.cs & 3 == 3
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn vector(&self) -> u8 {
        self.vector as u8
    }
}
