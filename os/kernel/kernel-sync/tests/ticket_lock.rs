use kernel_sync::{TicketLock, TicketMutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex as StdMutex};
use std::{panic, thread};

#[test]
fn basic_lock_and_raii() {
    let l = TicketMutex::new(0_u32);

    {
        let mut g = l.lock();
        *g = 41;
    }

    // previous drop must have released the ticket
    {
        let mut g = l.lock();
        *g += 1;
        assert_eq!(*g, 42);
    }
    assert!(l.raw().check());
}

#[test]
fn try_lock_semantics() {
    let l = TicketMutex::new(1u8);

    let g1 = l.try_lock();
    assert!(g1.is_some());

    assert!(l.try_lock().is_none());
    assert!(!l.raw().check());

    drop(g1);
    assert!(l.try_lock().is_some());
}

#[test]
fn contended_increments_are_exact_and_exclusive() {
    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(TicketMutex::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let mut handles = Vec::with_capacity(threads);
    for _ in 0..threads {
        let lock = Arc::clone(&lock);
        let in_cs = Arc::clone(&in_cs);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..iters {
                lock.with_lock(|v| {
                    let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(prev, 0, "mutual exclusion violated");
                    *v += 1;
                    thread::yield_now();
                    in_cs.fetch_sub(1, Ordering::SeqCst);
                });
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), threads * iters);
    assert_eq!(in_cs.load(Ordering::SeqCst), 0);
}

#[test]
fn waiters_are_served_in_ticket_order() {
    let lock = Arc::new(TicketLock::new());
    let order = Arc::new(StdMutex::new(Vec::new()));

    lock.acquire();

    let waiters = 6;
    let mut handles = Vec::with_capacity(waiters);
    for id in 0..waiters {
        let lock = Arc::clone(&lock);
        let order = Arc::clone(&order);
        handles.push(thread::spawn(move || {
            lock.acquire();
            order.lock().unwrap().push(id);
            unsafe { lock.release() };
        }));

        // only spawn the next waiter once this one holds its ticket
        let expected = u16::try_from(id + 2).unwrap();
        while lock.queued() != expected {
            thread::yield_now();
        }
    }

    unsafe { lock.release() };
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(*order.lock().unwrap(), (0..waiters).collect::<Vec<_>>());
    assert!(lock.check());
}

#[test]
fn spin_wait_returns_once_released() {
    let lock = Arc::new(TicketLock::new());
    lock.acquire();

    let waiter = {
        let lock = Arc::clone(&lock);
        thread::spawn(move || {
            lock.spin_wait();
            lock.check()
        })
    };

    thread::yield_now();
    unsafe { lock.release() };
    assert!(waiter.join().unwrap());
}

#[test]
fn lock_is_released_on_panic() {
    let l = TicketMutex::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");

    assert_eq!(l.with_lock(|v| *v), 123);
}

#[test]
fn ticket_mutex_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    let l = TicketMutex::new(0u8);
    takes_sync(&l);
}
