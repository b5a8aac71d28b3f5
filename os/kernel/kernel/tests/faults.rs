//! The page fault path end to end: memory manager first, exception
//! contexts second, with the kernel VAS descriptors on the bootstrap arena.

use kernel::bootstrap::{BootstrapPages, BootstrapPoolProvider, PageArena};
use kernel::faults::{exception_for, resolve_page_fault};
use kernel_alloc::HeapPoolProvider;
use kernel_exec::{ExecError, Process, ProcessId};
use kernel_info::memory::USERLAND_START;
use kernel_interrupts::{
    AccessKind, ExceptionContextChain, ExceptionType, IsrState, KnownExceptionVector,
    ResumePoint, Uncaught,
};
use kernel_vmem::testing::{TestFrames, TestMmu, TestPhys};
use kernel_vmem::{MemoryFlags, PAGE_SIZE, VirtualAddress};
use kernel_vmm::{KernelVas, MemoryAllocationOptions as Opt, MemoryContent, ProcessSpace, Vmm};

const ARENA_PAGES: usize = 16;

type TestVmm<'a> =
    Vmm<TestMmu, TestFrames, &'a TestPhys, BootstrapPoolProvider<'a, ARENA_PAGES>>;

fn setup<'a>(
    phys: &'a TestPhys,
    arena: &'a PageArena<ARENA_PAGES>,
) -> (TestVmm<'a>, ProcessSpace<HeapPoolProvider>) {
    let descriptors = BootstrapPoolProvider::new(BootstrapPages::new(arena));
    let vmm = Vmm::new(TestMmu::default(), phys, TestFrames::new(phys), descriptors).unwrap();
    let space = vmm.create_space(HeapPoolProvider).unwrap();
    (vmm, space)
}

fn user_pages(vmm: &TestVmm<'_>, space: &ProcessSpace<HeapPoolProvider>) -> VirtualAddress {
    vmm.allocate_pages(
        space,
        None,
        2,
        Opt::ALLOCATE_ON_DEMAND | Opt::VIRTUAL_USER,
        MemoryFlags::WRITABLE | MemoryFlags::USERLAND,
        MemoryContent::Generic,
    )
    .unwrap()
}

/// State of a user-mode write fault on a non-present page.
fn write_fault(rip: u64) -> IsrState {
    IsrState {
        vector: KnownExceptionVector::PageFault as u64,
        error_code: 0b110,
        rip,
        rsp: 0x7000,
        cs: 0x2b,
        ..IsrState::default()
    }
}

#[test]
fn descriptors_come_from_the_bootstrap_arena() {
    let phys = TestPhys::new(512);
    let arena = Box::new(PageArena::new());
    let (vmm, _space) = setup(&phys, &arena);
    let reserve = vmm.kernel_vas().free_descriptors();
    assert!(reserve >= KernelVas::<HeapPoolProvider>::FREE_DESCRIPTORS_THRESHOLD);

    // Kernel heap allocations draw on the reserve, which refills from the
    // arena.
    for _ in 0..8 {
        vmm.allocate_kernel_pages(
            None,
            1,
            Opt::ALLOCATE_ON_DEMAND | Opt::GUARD_LOW,
            MemoryFlags::WRITABLE,
            MemoryContent::Generic,
        )
        .unwrap();
    }
    assert!(vmm.kernel_vas().free_descriptors() >= 1);
}

#[test]
fn demand_pages_are_backed_without_an_exception() {
    let phys = TestPhys::new(512);
    let arena = Box::new(PageArena::new());
    let (vmm, space) = setup(&phys, &arena);
    let va = user_pages(&vmm, &space);

    let mut state = write_fault(0x40_1000);
    let mut chain = ExceptionContextChain::new();
    resolve_page_fault(&vmm, &space, va + 8, &mut state, &mut chain).unwrap();

    assert_eq!(state.rip, 0x40_1000);
    assert!(chain.exception().is_none());
    assert!(vmm.translate(&space, va).is_some());
}

#[test]
fn unresolved_faults_resume_at_the_catching_context() {
    let phys = TestPhys::new(512);
    let arena = Box::new(PageArena::new());
    let (vmm, space) = setup(&phys, &arena);
    let va = user_pages(&vmm, &space);
    let outside = va + 64 * PAGE_SIZE;

    let mut chain = ExceptionContextChain::new();
    let resume = ResumePoint {
        rip: 0x40_2000,
        rsp: 0x6f00,
        rbp: 0x6f80,
    };
    chain.enter(resume).unwrap();

    let mut state = write_fault(0x40_1000);
    resolve_page_fault(&vmm, &space, outside, &mut state, &mut chain).unwrap();
    assert_eq!((state.rip, state.rsp, state.rbp), (0x40_2000, 0x6f00, 0x6f80));

    let exception = chain.exception().copied().unwrap();
    assert_eq!(exception.instruction_pointer, 0x40_1000);
    match exception.kind {
        ExceptionType::MemoryAccessViolation(v) => {
            assert_eq!(v.address, outside);
            assert_eq!(v.physical_address, None);
            assert_eq!(v.access.kind(), AccessKind::Write);
            assert!(v.access.unprivileged());
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn without_a_context_the_fault_is_uncaught() {
    let phys = TestPhys::new(512);
    let arena = Box::new(PageArena::new());
    let (vmm, space) = setup(&phys, &arena);

    let mut state = write_fault(0x40_1000);
    let mut chain = ExceptionContextChain::new();
    let Err(Uncaught(exception)) = resolve_page_fault(
        &vmm,
        &space,
        VirtualAddress::new(0x10),
        &mut state,
        &mut chain,
    ) else {
        panic!("null access was resolved");
    };
    assert_eq!(exception.kind, ExceptionType::NullReference);
    assert_eq!(state.rip, 0x40_1000);

    let near_userland = VirtualAddress::new(USERLAND_START - PAGE_SIZE);
    assert!(resolve_page_fault(&vmm, &space, near_userland, &mut state, &mut chain).is_err());
}

#[test]
fn cpu_faults_map_to_exception_types() {
    let mut state = IsrState {
        vector: KnownExceptionVector::DivideError as u64,
        rip: 0x1234,
        ..IsrState::default()
    };
    assert_eq!(exception_for(&state).kind, ExceptionType::DivideByZero);
    assert_eq!(exception_for(&state).instruction_pointer, 0x1234);
    state.vector = KnownExceptionVector::InvalidOpcode as u64;
    assert_eq!(exception_for(&state).kind, ExceptionType::InvalidInstruction);
    state.vector = KnownExceptionVector::Overflow as u64;
    assert_eq!(exception_for(&state).kind, ExceptionType::ArithmeticOverflow);
    state.vector = KnownExceptionVector::GeneralProtectionFault as u64;
    assert_eq!(exception_for(&state).kind, ExceptionType::Unknown);
}

#[test]
fn process_heap_is_paged_in_on_first_touch() {
    let phys = TestPhys::new(512);
    let arena = Box::new(PageArena::new());
    let (vmm, space) = setup(&phys, &arena);
    let process = Process::new(ProcessId(1), space);
    process.activate().unwrap();

    let grow = |pages| {
        process.extend_heap(pages, |at, pages| {
            vmm.allocate_pages(
                process.space(),
                Some(at),
                pages,
                Opt::ALLOCATE_ON_DEMAND | Opt::VIRTUAL_USER,
                MemoryFlags::WRITABLE | MemoryFlags::USERLAND,
                MemoryContent::Generic,
            )?;
            Ok(())
        })
    };
    let first = grow(2).unwrap();
    let second = grow(1).unwrap();
    assert_eq!(first.as_u64(), USERLAND_START);
    assert_eq!(second, first + 2 * PAGE_SIZE);
    assert_eq!(process.heap_cursor(), first + 3 * PAGE_SIZE);

    let mut state = write_fault(0x40_1000);
    let mut chain = ExceptionContextChain::new();
    resolve_page_fault(&vmm, process.space(), second + 0x10, &mut state, &mut chain).unwrap();
    assert!(vmm.translate(process.space(), second).is_some());

    // Something else took the next pages: the cursor stays put.
    vmm.allocate_pages(
        process.space(),
        Some(process.heap_cursor()),
        1,
        Opt::COMMIT | Opt::VIRTUAL_USER,
        MemoryFlags::USERLAND,
        MemoryContent::Generic,
    )
    .unwrap();
    assert!(matches!(grow(1), Err(ExecError::Vmm(_))));
    assert_eq!(process.heap_cursor(), first + 3 * PAGE_SIZE);

    process.terminate().unwrap();
    assert!(matches!(
        grow(1),
        Err(ExecError::InvalidProcessTransition { .. })
    ));
}
