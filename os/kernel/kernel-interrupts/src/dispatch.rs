//! Per-vector handler lists.
//!
//! Each vector holds up to [`MAX_HANDLERS_PER_VECTOR`] handlers, kept in
//! descending priority order, and at most one ender that acknowledges the
//! interrupt once all handlers have run.

use crate::{IRQ_BASE, IRQ_COUNT, InterruptError, IsrState, VECTOR_COUNT};
use arrayvec::ArrayVec;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_sync::TicketMutex;

pub const MAX_HANDLERS_PER_VECTOR: usize = 8;

/// What a handler sees of the interrupt being dispatched.
pub struct InterruptContext<'a> {
    pub state: &'a mut IsrState,
    pub vector: u8,
    /// IRQ line, for vectors in the IRQ window.
    pub irq: Option<u8>,
    /// Handlers that ran before the current one.
    pub counter: usize,
}

/// When an ender runs relative to the kernel's handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptEndType {
    AfterKernel,
    BeforeUserland,
    AfterUserland,
}

/// A handler function with its cookie and priority.
#[derive(Debug, Clone, Copy)]
pub struct Handler {
    pub func: fn(&mut InterruptContext<'_>, usize),
    pub cookie: usize,
    pub priority: usize,
}

impl Handler {
    pub const MAX_PRIORITY: usize = usize::MAX / 2 + usize::MAX / 4 + usize::MAX / 8 + usize::MAX / 16;
    pub const VERY_HIGH_PRIORITY: usize = usize::MAX / 2 + usize::MAX / 4 + usize::MAX / 8;
    pub const HIGH_PRIORITY: usize = usize::MAX / 2 + usize::MAX / 4;
    pub const MEDIUM_PRIORITY: usize = usize::MAX / 2;
    pub const LOW_PRIORITY: usize = usize::MAX / 2 - usize::MAX / 4;
    pub const VERY_LOW_PRIORITY: usize = usize::MAX / 2 - usize::MAX / 4 - usize::MAX / 8;
    pub const MIN_PRIORITY: usize =
        usize::MAX / 2 - usize::MAX / 4 - usize::MAX / 8 - usize::MAX / 16;

    /// A handler at [`MEDIUM_PRIORITY`](Self::MEDIUM_PRIORITY).
    #[must_use]
    pub const fn new(func: fn(&mut InterruptContext<'_>, usize), cookie: usize) -> Self {
        Self {
            func,
            cookie,
            priority: Self::MEDIUM_PRIORITY,
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: usize) -> Self {
        self.priority = priority;
        self
    }
}

/// Acknowledges an interrupt, typically an EOI to the interrupt controller.
#[derive(Debug, Clone, Copy)]
pub struct Ender {
    pub func: fn(&InterruptContext<'_>, usize, InterruptEndType),
    pub cookie: usize,
}

/// Proof of a subscription, needed to undo it.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct Subscription {
    vector: u8,
    id: u32,
}

impl Subscription {
    #[must_use]
    pub const fn vector(&self) -> u8 {
        self.vector
    }
}

/// Proof of an ender registration.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct EnderToken {
    vector: u8,
    id: u32,
}

#[derive(Clone, Copy)]
struct Slot<T> {
    id: u32,
    entry: T,
}

struct VectorData {
    handlers: TicketMutex<ArrayVec<Slot<Handler>, MAX_HANDLERS_PER_VECTOR>>,
    ender: TicketMutex<Option<Slot<Ender>>>,
}

impl VectorData {
    const fn new() -> Self {
        Self {
            handlers: TicketMutex::new(ArrayVec::new_const()),
            ender: TicketMutex::new(None),
        }
    }
}

/// Routes every vector to its subscribed handlers.
pub struct Dispatcher {
    vectors: [VectorData; VECTOR_COUNT],
    next_id: AtomicU32,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            vectors: [const { VectorData::new() }; VECTOR_COUNT],
            next_id: AtomicU32::new(1),
        }
    }

    fn id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Adds `handler` to `vector`, behind handlers of equal or higher
    /// priority.
    ///
    /// # Errors
    /// [`InterruptError::HandlersFull`] when the vector has no free slot.
    pub fn subscribe(&self, vector: u8, handler: Handler) -> Result<Subscription, InterruptError> {
        let id = self.id();
        let mut list = self.vectors[usize::from(vector)].handlers.lock_uninterruptible();
        if list.is_full() {
            return Err(InterruptError::HandlersFull(vector));
        }
        let at = list
            .iter()
            .position(|s| s.entry.priority < handler.priority)
            .unwrap_or(list.len());
        list.insert(at, Slot { id, entry: handler });
        Ok(Subscription { vector, id })
    }

    /// [`subscribe`](Self::subscribe) by IRQ line.
    ///
    /// # Errors
    /// [`InterruptError::VectorOutOfRange`] for lines past [`IRQ_COUNT`].
    pub fn subscribe_irq(&self, irq: u8, handler: Handler) -> Result<Subscription, InterruptError> {
        if irq >= IRQ_COUNT {
            return Err(InterruptError::VectorOutOfRange(usize::from(irq)));
        }
        self.subscribe(irq + IRQ_BASE, handler)
    }

    /// # Errors
    /// [`InterruptError::NotSubscribed`] if the subscription is gone.
    pub fn unsubscribe(&self, subscription: Subscription) -> Result<(), InterruptError> {
        let mut list = self.vectors[usize::from(subscription.vector)]
            .handlers
            .lock_uninterruptible();
        let at = list
            .iter()
            .position(|s| s.id == subscription.id)
            .ok_or(InterruptError::NotSubscribed)?;
        list.remove(at);
        Ok(())
    }

    #[must_use]
    pub fn handler_count(&self, vector: u8) -> usize {
        self.vectors[usize::from(vector)].handlers.lock_uninterruptible().len()
    }

    /// # Errors
    /// [`InterruptError::EnderAlreadyRegistered`] if `vector` has one.
    pub fn register_ender(&self, vector: u8, ender: Ender) -> Result<EnderToken, InterruptError> {
        let id = self.id();
        let mut slot = self.vectors[usize::from(vector)].ender.lock_uninterruptible();
        if slot.is_some() {
            return Err(InterruptError::EnderAlreadyRegistered(vector));
        }
        *slot = Some(Slot { id, entry: ender });
        Ok(EnderToken { vector, id })
    }

    /// # Errors
    /// [`InterruptError::EnderNotRegistered`] or, if another ender took
    /// the vector meanwhile, [`InterruptError::WrongEnder`].
    pub fn unregister_ender(&self, token: EnderToken) -> Result<(), InterruptError> {
        let mut slot = self.vectors[usize::from(token.vector)].ender.lock_uninterruptible();
        match *slot {
            None => Err(InterruptError::EnderNotRegistered(token.vector)),
            Some(s) if s.id != token.id => Err(InterruptError::WrongEnder(token.vector)),
            Some(_) => {
                *slot = None;
                Ok(())
            }
        }
    }

    /// Runs the handlers of `state.vector`, then its ender.
    ///
    /// The lists are copied out first, so handlers may subscribe or
    /// unsubscribe. Returns the number of handlers run.
    pub fn dispatch(&self, state: &mut IsrState) -> usize {
        let vector = state.vector();
        let data = &self.vectors[usize::from(vector)];
        let handlers = data.handlers.lock_uninterruptible().clone();
        let ender = *data.ender.lock_uninterruptible();

        let irq = vector
            .checked_sub(IRQ_BASE)
            .filter(|&irq| irq < IRQ_COUNT);
        let mut context = InterruptContext {
            state,
            vector,
            irq,
            counter: 0,
        };
        for slot in &handlers {
            (slot.entry.func)(&mut context, slot.entry.cookie);
            context.counter += 1;
        }
        if handlers.is_empty() {
            log::warn!("vector {vector:#04x} raised without handlers");
        }
        if let Some(end) = ender {
            (end.entry.func)(&context, end.entry.cookie, InterruptEndType::AfterKernel);
        }
        context.counter
    }
}
