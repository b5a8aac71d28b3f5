//! Interrupt plumbing for a core coming up.

use crate::BootError;
use crate::config::TIMER_VECTOR;
use crate::faults::FAULT_VECTORS;
use crate::fatal;
use kernel_interrupts::{
    Dispatcher, Handler, Idt, InterruptContext, IsrState, JumpEncodeError, STUB_SIZE, StubTable,
    Uncaught,
};
use kernel_sync::SyncOnceCell;

/// Resolves a CPU fault or throws it through the current thread's
/// exception contexts.
pub type FaultHook = fn(&mut IsrState) -> Result<(), Uncaught>;

/// Runs the current core's timer interrupt.
pub type TickHook = fn(&mut IsrState);

/// Sends `log` output to the QEMU debug console.
///
/// # Errors
/// [`BootError::Logger`] if a logger is already installed.
pub fn init_logging(level: log::LevelFilter) -> Result<(), BootError> {
    kernel_qemu::init_logger(level).map_err(|_| BootError::Logger)?;
    log::info!("logging at {level}");
    Ok(())
}

static FAULT_HOOK: SyncOnceCell<FaultHook> = SyncOnceCell::new();
static TICK_HOOK: SyncOnceCell<TickHook> = SyncOnceCell::new();

/// Writes the entry stubs into `area` and points every gate of `idt` at
/// its stub.
///
/// Returns the address the stubs start at.
///
/// # Errors
/// When `area` is too small or `common_entry` is out of reach.
pub fn install_stubs(
    idt: &mut Idt,
    area: &mut [u8],
    common_entry: u64,
) -> Result<u64, JumpEncodeError> {
    let base = area.as_ptr() as u64;
    let table = StubTable::build(base, common_entry)?;
    let code = table.as_bytes();
    let (needed, available) = (code.len(), area.len());
    area.get_mut(..needed)
        .ok_or(JumpEncodeError::NoRoom { needed, available })?
        .copy_from_slice(code);
    idt.install_stubs(base, STUB_SIZE as u64);
    log::debug!("{} interrupt stubs at {base:#x}", code.len() / STUB_SIZE);
    Ok(base)
}

/// Routes the fault vectors and the timer vector to the given hooks.
///
/// # Errors
/// [`BootError::AlreadyInstalled`] on a second call, or when the
/// dispatcher has no room for the handlers.
pub fn install_handlers(
    dispatcher: &Dispatcher,
    fault: FaultHook,
    tick: TickHook,
) -> Result<(), BootError> {
    FAULT_HOOK
        .set(fault)
        .map_err(|_| BootError::AlreadyInstalled("fault hook"))?;
    TICK_HOOK
        .set(tick)
        .map_err(|_| BootError::AlreadyInstalled("tick hook"))?;

    for vector in FAULT_VECTORS {
        let handler = Handler::new(on_fault, 0).with_priority(Handler::MAX_PRIORITY);
        dispatcher.subscribe(vector, handler)?;
    }
    dispatcher.subscribe(TIMER_VECTOR, Handler::new(on_tick, 0))?;
    Ok(())
}

fn on_fault(ctx: &mut InterruptContext<'_>, _: usize) {
    let outcome = match FAULT_HOOK.get() {
        Some(hook) => hook(ctx.state),
        None => Err(Uncaught(crate::faults::exception_for(ctx.state))),
    };
    if let Err(Uncaught(exception)) = outcome {
        fatal::report_uncaught(&exception, ctx.state);
        fatal::stop();
    }
}

fn on_tick(ctx: &mut InterruptContext<'_>, _: usize) {
    if let Some(hook) = TICK_HOOK.get() {
        hook(ctx.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use kernel_interrupts::{KnownExceptionVector, VECTOR_COUNT};

    #[test]
    fn stubs_land_in_the_area_and_the_gates_follow() {
        let mut area = vec![0u8; VECTOR_COUNT * STUB_SIZE + 64];
        let mut idt = Box::new(Idt::new());
        let base = install_stubs(&mut idt, &mut area, 0x4000).unwrap();

        assert_eq!(base, area.as_ptr() as u64);
        let expected = StubTable::build(base, 0x4000).unwrap();
        assert_eq!(&area[..VECTOR_COUNT * STUB_SIZE], expected.as_bytes());
        assert_eq!(area[VECTOR_COUNT * STUB_SIZE..], [0; 64]);
        for vector in [0usize, 14, 0x30, 0xFF] {
            assert!(idt[vector].is_present());
            assert_eq!(
                idt[vector].handler_address(),
                base + (vector * STUB_SIZE) as u64
            );
        }
    }

    #[test]
    fn logging_is_installed_once() {
        init_logging(log::LevelFilter::Debug).unwrap();
        assert!(matches!(
            init_logging(log::LevelFilter::Trace),
            Err(BootError::Logger)
        ));
    }

    #[test]
    fn short_area_is_refused() {
        let mut area = vec![0u8; STUB_SIZE];
        let mut idt = Box::new(Idt::new());
        assert_eq!(
            install_stubs(&mut idt, &mut area, 0x4000),
            Err(JumpEncodeError::NoRoom {
                needed: VECTOR_COUNT * STUB_SIZE,
                available: STUB_SIZE
            })
        );
        assert!(!idt[0].is_present());
    }

    static TICKS: AtomicUsize = AtomicUsize::new(0);
    static FAULTS: AtomicUsize = AtomicUsize::new(0);

    fn resolve(state: &mut IsrState) -> Result<(), Uncaught> {
        FAULTS.fetch_add(1, Ordering::Relaxed);
        state.rip += 2;
        Ok(())
    }

    fn tick(_: &mut IsrState) {
        TICKS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn handlers_reach_the_hooks_once() {
        let dispatcher = Dispatcher::new();
        install_handlers(&dispatcher, resolve, tick).unwrap();
        assert!(matches!(
            install_handlers(&dispatcher, resolve, tick),
            Err(BootError::AlreadyInstalled(_))
        ));
        for vector in FAULT_VECTORS {
            assert_eq!(dispatcher.handler_count(vector), 1);
        }

        let mut state = IsrState {
            vector: KnownExceptionVector::PageFault as u64,
            rip: 0x1000,
            ..IsrState::default()
        };
        dispatcher.dispatch(&mut state);
        assert_eq!(state.rip, 0x1002);
        assert_eq!(FAULTS.load(Ordering::Relaxed), 1);

        state.vector = u64::from(TIMER_VECTOR);
        dispatcher.dispatch(&mut state);
        assert_eq!(TICKS.load(Ordering::Relaxed), 1);
    }
}
