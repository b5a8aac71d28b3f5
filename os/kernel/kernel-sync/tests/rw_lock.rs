use kernel_sync::{RwLock, RwSpinlock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn readers_and_writer_never_overlap() {
    let readers = 4;
    let writers = 2;
    let iters = 2_000;

    let lock = Arc::new(RwLock::new(0usize));
    let active_readers = Arc::new(AtomicUsize::new(0));
    let writing = Arc::new(AtomicBool::new(false));
    let start = Arc::new(Barrier::new(readers + writers));

    let mut handles = Vec::new();
    for _ in 0..readers {
        let lock = Arc::clone(&lock);
        let active_readers = Arc::clone(&active_readers);
        let writing = Arc::clone(&writing);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..iters {
                let g = lock.read();
                active_readers.fetch_add(1, Ordering::SeqCst);
                assert!(!writing.load(Ordering::SeqCst), "reader saw a writer");
                assert!(!lock.raw().has_writer());
                let _ = *g;
                active_readers.fetch_sub(1, Ordering::SeqCst);
            }
        }));
    }

    for _ in 0..writers {
        let lock = Arc::clone(&lock);
        let active_readers = Arc::clone(&active_readers);
        let writing = Arc::clone(&writing);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..iters {
                let mut g = lock.write();
                assert!(!writing.swap(true, Ordering::SeqCst), "two writers");
                assert_eq!(active_readers.load(Ordering::SeqCst), 0);
                assert_eq!(lock.raw().reader_count(), 0);
                *g += 1;
                writing.store(false, Ordering::SeqCst);
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(*lock.read(), writers * iters);
    assert_eq!(lock.raw().snapshot(), 0);
}

#[test]
fn reader_count_and_writer_bit_are_exclusive_under_contention() {
    let lock = Arc::new(RwSpinlock::new());
    let stop = Arc::new(AtomicBool::new(false));

    let observer = {
        let lock = Arc::clone(&lock);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let v = lock.snapshot();
                let readers = v >> 3;
                let writer = v & 0b10 != 0;
                assert!(!(readers > 0 && writer), "state {v:#x}");
            }
        })
    };

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                for _ in 0..3_000 {
                    if i % 2 == 0 {
                        lock.acquire_as_writer();
                        unsafe { lock.release_as_writer() };
                    } else {
                        lock.acquire_as_reader();
                        unsafe { lock.release_as_reader() };
                    }
                }
            })
        })
        .collect();

    for w in workers {
        w.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    observer.join().unwrap();
}

#[test]
fn upgrade_waits_for_other_readers() {
    let lock = Arc::new(RwLock::new(0u32));
    let other = lock.read();

    let upgrader = {
        let lock = Arc::clone(&lock);
        thread::spawn(move || {
            let r = lock.read();
            let Ok(mut w) = r.upgrade() else {
                panic!("upgrade refused");
            };
            *w = 7;
        })
    };

    // the upgrade cannot finish while `other` is alive
    while lock.raw().snapshot() & 0b100 == 0 {
        thread::yield_now();
    }
    assert!(lock.try_read().is_none());
    drop(other);

    upgrader.join().unwrap();
    assert_eq!(*lock.read(), 7);
}
