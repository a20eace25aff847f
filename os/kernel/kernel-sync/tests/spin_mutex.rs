use kernel_sync::{IrqGuard, SpinMutex, interrupts_enabled};
use std::{panic, thread};

#[test]
fn lock_irq_is_released_on_drop() {
    let m = SpinMutex::new(0_u32);

    {
        let mut g = m.lock_irq();
        *g = 41;
        assert!(!interrupts_enabled());
        assert!(m.try_lock().is_none());
    }

    // previous drop must have unlocked
    let mut g = m.try_lock().unwrap();
    *g += 1;
    assert_eq!(*g, 42);
}

#[test]
fn try_lock_semantics() {
    let m = SpinMutex::new(1u8);

    let g1 = m.try_lock();
    assert!(g1.is_some());
    assert_eq!(**g1.as_ref().unwrap(), 1);
    assert!(!interrupts_enabled());

    // while held, try_lock must fail
    assert!(m.try_lock().is_none());

    drop(g1);
    assert!(m.try_lock().is_some());
}

#[test]
fn nested_guards_keep_interrupts_off_until_the_outermost_drops() {
    let outer = IrqGuard::new();
    let inner = IrqGuard::new();
    assert!(!interrupts_enabled());
    drop(inner);
    assert!(!interrupts_enabled());
    drop(outer);
}

#[test]
fn with_irq_works_and_unlocks() {
    let m = SpinMutex::new(String::from("a"));
    let len = m.with_irq(|s| {
        assert!(!interrupts_enabled());
        s.push('b');
        s.len()
    });
    assert_eq!(len, 2);
    assert_eq!(m.with_irq(|s| s.clone()), "ab");
}

#[test]
fn contended_increments_are_exact_and_exclusive() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(SpinMutex::new(0usize));
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
                lock.with_irq(|v| {
                    let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(prev, 0, "mutual exclusion violated");
                    *v += 1;
                    in_cs.fetch_sub(1, Ordering::SeqCst);
                });
                thread::yield_now();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_irq(|v| *v), threads * iters);
    assert_eq!(in_cs.load(Ordering::SeqCst), 0);
}

#[test]
fn lock_is_released_on_panic() {
    let m = SpinMutex::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        m.with_irq(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");

    assert_eq!(m.with_irq(|v| *v), 123);
}

#[test]
fn spin_mutex_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    let m = SpinMutex::new(0u8);
    takes_sync(&m);
}
