use crate::{
    Acquired, FutexError, FutexLock, FutexOp, LockSite, LockState, RobustMutex, RobustRegistry,
    futex::{self, sys},
    robust_list::{self, RobustListHead},
    word::{self, FUTEX_OWNER_DIED, FUTEX_WAITERS},
};

use nix::{
    errno::Errno,
    sys::{
        pthread::{pthread_kill, pthread_self},
        signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction},
    },
};

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

fn wait_for_waiters(lock: &FutexLock) {
    while !matches!(lock.state(), LockState::OwnedWithWaiters(_)) {
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_basic_mutex_operations() {
    let mutex = RobustMutex::new(42);

    {
        let guard = mutex.lock().unwrap();
        assert_eq!(*guard, 42);
    }

    {
        let mut guard = mutex.lock().unwrap();
        *guard = 100;
        assert_eq!(*guard, 100);
    }

    {
        let guard = mutex.try_lock().unwrap().unwrap();
        assert_eq!(*guard, 100);
    }
    assert!(!mutex.is_locked());
    assert_eq!(mutex.into_inner(), 100);
}

#[test]
fn test_uncontended_lock_is_one_word_write() {
    let lock = FutexLock::new();
    let guard = lock.lock().unwrap();
    assert_eq!(guard.acquired(), Acquired::Clean);
    assert_eq!(lock.state(), LockState::Owned(futex::tid()));
    assert!(lock.is_locked_by_me());
    assert_eq!(guard.unlock().unwrap(), 0);
    assert_eq!(lock.word().load(), 0);
}

#[test]
fn test_try_lock_fails_when_locked() {
    let mutex = Arc::new(RobustMutex::new(0));

    let guard = mutex.lock().unwrap();

    assert!(mutex.try_lock().unwrap().is_none());
    thread::spawn({
        let mutex = mutex.clone();
        move || {
            assert!(mutex.try_lock().unwrap().is_none());
            assert!(!mutex.futex().word().try_claim(futex::tid()));
        }
    })
    .join()
    .unwrap();

    drop(guard);
    let guard = mutex.try_lock().unwrap().unwrap();
    assert_eq!(*guard, 0);
}

#[test]
fn test_multiple_threads_counter() {
    let mutex = Arc::new(RobustMutex::new(0));

    let num_threads = 8;
    let increments_per_thread = 500;

    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let mutex = mutex.clone();
            thread::spawn(move || {
                for _ in 0..increments_per_thread {
                    let mut guard = mutex.lock().unwrap();
                    *guard += 1;
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let final_value = *mutex.lock().unwrap();
    assert_eq!(final_value, num_threads * increments_per_thread);
}

#[test]
fn test_blocking_behavior() {
    let mutex = Arc::new(RobustMutex::new("initial"));

    let guard = mutex.lock().unwrap();

    let mutex_clone = mutex.clone();
    let (tx, rx) = mpsc::channel();

    let handle = thread::spawn(move || {
        tx.send("thread_started").unwrap();
        let mut guard = mutex_clone.lock().unwrap(); // blocks
        *guard = "modified_by_thread";
        tx.send("thread_acquired_lock").unwrap();
        drop(guard);
        tx.send("thread_released_lock").unwrap();
    });

    assert_eq!(rx.recv().unwrap(), "thread_started");
    wait_for_waiters(mutex.futex());
    assert_eq!(*guard, "initial");

    drop(guard);

    assert_eq!(rx.recv().unwrap(), "thread_acquired_lock");
    assert_eq!(rx.recv().unwrap(), "thread_released_lock");

    handle.join().unwrap();

    let final_guard = mutex.lock().unwrap();
    assert_eq!(*final_guard, "modified_by_thread");
}

#[test]
fn test_long_running_operations() {
    let mutex = Arc::new(RobustMutex::new(0u64));
    let num_threads = 4;

    let handles: Vec<_> = (0..num_threads)
        .map(|i| {
            let mutex = mutex.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    let mut guard = mutex.lock().unwrap();
                    let old_value = *guard;

                    thread::sleep(Duration::from_millis(2));

                    *guard = old_value + (i as u64 + 1);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let final_value = *mutex.lock().unwrap();
    assert_eq!(final_value, 100);
}

#[test]
fn test_two_unit_handoff() {
    let lock = Arc::new(FutexLock::new());
    let registry_a = Box::pin(RobustRegistry::new());

    let acquired = unsafe { lock.acquire(registry_a.as_ref(), 100) }.unwrap();
    assert_eq!(acquired, Acquired::Clean);
    assert_eq!(lock.word().load(), 100);

    let b = thread::spawn({
        let lock = lock.clone();
        move || {
            let registry_b = Box::pin(RobustRegistry::new());
            let acquired = unsafe { lock.acquire(registry_b.as_ref(), 200) }.unwrap();
            let seen = lock.word().load();
            unsafe { lock.release(registry_b.as_ref(), 200) }.unwrap();
            (acquired, seen)
        }
    });

    wait_for_waiters(&lock);
    assert_eq!(lock.word().load(), 0x8000_0064);

    let woken = unsafe { lock.release(registry_a.as_ref(), 100) }.unwrap();
    assert!(woken <= 1);
    assert!(registry_a.as_ref().is_empty());

    let (acquired, seen) = b.join().unwrap();
    assert_eq!(acquired, Acquired::Clean);
    assert_eq!(word::owner_of(seen), 200);
    // B slept, so it holds the word with the waiter flag raised
    assert_ne!(seen & FUTEX_WAITERS, 0);
    assert_eq!(lock.word().load(), 0);
}

#[test]
fn test_release_wakes_at_most_one() {
    let lock = Arc::new(FutexLock::new());
    let guard = lock.lock().unwrap();
    let acquired = Arc::new(AtomicUsize::new(0));
    let total_woken = Arc::new(AtomicU32::new(0));
    let num_threads = 4;

    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let lock = lock.clone();
            let acquired = acquired.clone();
            let total_woken = total_woken.clone();
            thread::spawn(move || {
                let guard = lock.lock().unwrap();
                acquired.fetch_add(1, Ordering::Relaxed);
                thread::sleep(Duration::from_millis(5));
                let woken = guard.unlock().unwrap();
                assert!(woken <= 1);
                total_woken.fetch_add(woken, Ordering::Relaxed);
            })
        })
        .collect();

    wait_for_waiters(&lock);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(acquired.load(Ordering::Relaxed), 0);

    let woken = guard.unlock().unwrap();
    assert_eq!(woken, 1);

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(acquired.load(Ordering::Relaxed), num_threads);
    assert!(total_woken.load(Ordering::Relaxed) <= num_threads as u32);
    assert_eq!(lock.word().load(), 0);
}

#[test]
fn test_walk_most_recent_first() {
    let registry = Box::pin(RobustRegistry::new());
    let locks = [FutexLock::new(), FutexLock::new(), FutexLock::new()];
    let addr = |l: &FutexLock| l.word() as *const _ as usize;

    assert!(registry.as_ref().is_empty());
    for lock in &locks {
        unsafe { lock.acquire(registry.as_ref(), 7) }.unwrap();
    }

    let walked: Vec<_> = registry.as_ref().walk().map(|e| e.word_addr()).collect();
    assert_eq!(walked, [addr(&locks[2]), addr(&locks[1]), addr(&locks[0])]);
    assert!(registry.as_ref().walk().all(|e| e.value() == 7));
    assert!(registry.as_ref().pending().is_none());

    unsafe { locks[1].release(registry.as_ref(), 7) }.unwrap();
    let walk = registry.as_ref().walk();
    let first: Vec<_> = walk.clone().map(|e| e.word_addr()).collect();
    let again: Vec<_> = walk.map(|e| e.word_addr()).collect();
    assert_eq!(first, [addr(&locks[2]), addr(&locks[0])]);
    assert_eq!(first, again);

    unsafe { locks[2].release(registry.as_ref(), 7) }.unwrap();
    unsafe { locks[0].release(registry.as_ref(), 7) }.unwrap();
    assert!(registry.as_ref().is_empty());
    assert_eq!(registry.as_ref().walk().count(), 0);
}

#[test]
fn test_register_unregister_site() {
    let registry = Box::pin(RobustRegistry::new());
    let (a, b) = (LockSite::new(), LockSite::new());

    unsafe {
        registry.as_ref().register_site(&a);
        registry.as_ref().register_site(&b);
    }
    let walked: Vec<_> = registry.as_ref().walk().map(|e| e.site_addr()).collect();
    assert_eq!(walked, [&b as *const _ as usize, &a as *const _ as usize]);

    assert!(unsafe { registry.as_ref().unregister_site(&b) });
    assert!(!unsafe { registry.as_ref().unregister_site(&b) });
    assert!(unsafe { registry.as_ref().unregister_site(&a) });
    assert!(registry.as_ref().is_empty());
    assert!(registry.as_ref().pending().is_none());
}

#[test]
fn test_try_acquire_does_not_link_on_failure() {
    let registry = Box::pin(RobustRegistry::new());
    let lock = FutexLock::new();
    assert!(lock.word().try_claim(9));

    assert_eq!(unsafe { lock.try_acquire(registry.as_ref(), 10) }, None);
    assert!(registry.as_ref().is_empty());
    assert!(registry.as_ref().pending().is_none());
    assert_eq!(lock.word().release_and_clear(9), 9);

    assert_eq!(
        unsafe { lock.try_acquire(registry.as_ref(), 10) },
        Some(Acquired::Clean)
    );
    assert_eq!(registry.as_ref().walk().count(), 1);
    unsafe { lock.release(registry.as_ref(), 10) }.unwrap();
}

#[test]
fn test_recover_dead_unit() {
    let lock = Arc::new(FutexLock::new());
    let registry = Arc::pin(RobustRegistry::new());

    let acquired = thread::spawn({
        let lock = lock.clone();
        let registry = registry.clone();
        move || unsafe { lock.acquire(registry.as_ref(), 300) }.unwrap()
    })
    .join()
    .unwrap();
    assert_eq!(acquired, Acquired::Clean);

    // unit 300 is gone without releasing
    assert_eq!(lock.state(), LockState::Owned(300));
    assert_eq!(registry.as_ref().walk().count(), 1);

    assert_eq!(unsafe { registry.as_ref().recover(300) }.unwrap(), 1);
    assert_eq!(lock.word().load(), FUTEX_OWNER_DIED);
    assert!(registry.as_ref().is_empty());

    let other = Box::pin(RobustRegistry::new());
    let acquired = unsafe { lock.acquire(other.as_ref(), 400) }.unwrap();
    assert_eq!(acquired, Acquired::OwnerDied);
    assert_eq!(lock.state(), LockState::Owned(400));
    unsafe { lock.release(other.as_ref(), 400) }.unwrap();
    assert_eq!(lock.word().load(), 0);
}

#[test]
fn test_recover_wakes_waiter() {
    let lock = Arc::new(FutexLock::new());
    let dead = Box::pin(RobustRegistry::new());
    unsafe { lock.acquire(dead.as_ref(), 301) }.unwrap();

    let waiter = thread::spawn({
        let lock = lock.clone();
        move || {
            let registry = Box::pin(RobustRegistry::new());
            let acquired = unsafe { lock.acquire(registry.as_ref(), 501) }.unwrap();
            unsafe { lock.release(registry.as_ref(), 501) }.unwrap();
            acquired
        }
    });

    wait_for_waiters(&lock);
    assert_eq!(unsafe { dead.as_ref().recover(301) }.unwrap(), 1);
    assert_eq!(waiter.join().unwrap(), Acquired::OwnerDied);
    assert_eq!(lock.word().load(), 0);
}

#[test]
fn test_recover_pending_site() {
    let registry = Box::pin(RobustRegistry::new());
    let linked = LockSite::new();
    let in_flight = LockSite::new();
    let foreign = LockSite::new();

    assert!(linked.word().try_claim(600));
    assert!(in_flight.word().try_claim(600));
    assert!(foreign.word().try_claim(601));
    unsafe { registry.as_ref().register_site(&linked) };
    unsafe { registry.as_ref().register_site(&foreign) };
    // died between claiming and linking
    registry.as_ref().set_pending(&in_flight);

    assert_eq!(unsafe { registry.as_ref().recover(600) }.unwrap(), 2);
    assert_eq!(linked.word().load(), FUTEX_OWNER_DIED);
    assert_eq!(in_flight.word().load(), FUTEX_OWNER_DIED);
    assert_eq!(foreign.word().load(), 601);
    assert!(registry.as_ref().pending().is_none());
    assert!(registry.as_ref().is_empty());
}

#[test]
fn test_thread_exit_repairs_lock() {
    let mutex = Arc::new(RobustMutex::new(0u64));
    thread::spawn({
        let mutex = mutex.clone();
        move || {
            let mut guard = mutex.lock().unwrap();
            *guard = 10;
            std::mem::forget(guard);
        }
    })
    .join()
    .unwrap();

    let value = mutex.futex().word().load();
    assert_eq!(word::owner_of(value), 0);
    assert_ne!(value & FUTEX_OWNER_DIED, 0);

    {
        let mut guard = mutex.lock().unwrap_err();
        assert_eq!(*guard, 10);
        *guard += 5;
    }
    assert_eq!(*mutex.lock().unwrap(), 15);
}

#[test]
fn test_thread_exit_wakes_blocked_waiter() {
    let mutex = Arc::new(RobustMutex::new(0u64));
    let (locked_tx, locked_rx) = mpsc::channel();
    let (exit_tx, exit_rx) = mpsc::channel::<()>();

    let owner = thread::spawn({
        let mutex = mutex.clone();
        move || {
            let mut guard = mutex.lock().unwrap();
            *guard = 999;
            locked_tx.send(()).unwrap();
            exit_rx.recv().unwrap();
            std::mem::forget(guard);
        }
    });
    locked_rx.recv().unwrap();

    let waiter = thread::spawn({
        let mutex = mutex.clone();
        move || match mutex.lock() {
            Ok(guard) => (false, *guard),
            Err(guard) => (true, *guard),
        }
    });

    wait_for_waiters(mutex.futex());
    exit_tx.send(()).unwrap();
    owner.join().unwrap();

    assert_eq!(waiter.join().unwrap(), (true, 999));
    assert!(mutex.try_lock().unwrap().is_some());
}

#[test]
fn test_panic_releases_lock() {
    let mutex = Arc::new(RobustMutex::new(42));

    let result = thread::spawn({
        let mutex = mutex.clone();
        move || {
            let mut guard = mutex.lock().unwrap();
            *guard = 999;
            panic!("Intentional panic while holding lock");
        }
    })
    .join();
    assert!(result.is_err());

    // unwinding dropped the guard, so this is a clean acquire
    let guard = mutex.try_lock().unwrap().unwrap();
    assert_eq!(*guard, 999);
}

#[test]
fn test_forgotten_guard_unlinked_on_drop() {
    let lock = FutexLock::new();
    std::mem::forget(lock.lock().unwrap());
    assert_eq!(robust_list::with_current(|reg| reg.walk().count()), 1);
    drop(lock);
    assert!(robust_list::with_current(|reg| reg.is_empty()));
}

#[test]
fn test_moved_lock_keeps_its_site() {
    let lock = FutexLock::new();
    std::mem::forget(lock.lock().unwrap());
    let linked_at = robust_list::with_current(|reg| reg.walk().next().unwrap().word_addr());

    let moved = Box::new(lock);
    assert_eq!(moved.word() as *const _ as usize, linked_at);
    assert!(moved.is_locked_by_me());

    drop(moved);
    assert_eq!(robust_list::with_current(|reg| reg.walk().count()), 0);
}

extern "C" fn ignore_signal(_: libc::c_int) {}

#[test]
fn test_interrupted_wait_is_retried() {
    // no SA_RESTART: the blocked FUTEX_WAIT comes back with EINTR
    let action = SigAction::new(
        SigHandler::Handler(ignore_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGUSR1, &action) }.unwrap();

    let lock = Arc::new(FutexLock::new());
    let holder = Box::pin(RobustRegistry::new());
    unsafe { lock.acquire(holder.as_ref(), 700) }.unwrap();

    let (tx, rx) = mpsc::channel();
    let waiter = thread::spawn({
        let lock = lock.clone();
        move || {
            tx.send(pthread_self()).unwrap();
            let registry = Box::pin(RobustRegistry::new());
            let acquired = unsafe { lock.acquire(registry.as_ref(), 701) };
            if acquired.is_ok() {
                unsafe { lock.release(registry.as_ref(), 701) }.unwrap();
            }
            acquired
        }
    });
    let waiter_thread = rx.recv().unwrap();

    wait_for_waiters(&lock);
    thread::sleep(Duration::from_millis(20));
    for _ in 0..3 {
        pthread_kill(waiter_thread, Signal::SIGUSR1).unwrap();
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(word::owner_of(lock.word().load()), 700);
    assert!(!waiter.is_finished());

    unsafe { lock.release(holder.as_ref(), 700) }.unwrap();
    assert_eq!(waiter.join().unwrap(), Ok(Acquired::Clean));
    assert_eq!(lock.word().load(), 0);
}

#[test]
fn test_query_returns_published_registry() {
    thread::spawn(|| {
        futex::tid();
        let (addr, len) = RobustRegistry::query(0).unwrap();
        assert_eq!(addr, robust_list::with_current(|reg| reg.address()));
        assert_eq!(len, std::mem::size_of::<RobustListHead>());
    })
    .join()
    .unwrap();
}

#[test]
fn test_wake_without_waiters() {
    let lock = FutexLock::new();
    assert_eq!(sys::wake(lock.word(), 1).unwrap(), 0);
    assert_eq!(
        sys::wait(lock.word(), 1).unwrap(),
        futex::WaitOutcome::ValueChanged
    );
}

#[test]
fn test_error_reports_operation() {
    let e = FutexError::failed(FutexOp::Wake, Errno::EINVAL);
    assert_eq!(e.op(), FutexOp::Wake);
    assert!(e.to_string().contains("FUTEX_WAKE"));
    let io: io::Error = e.into();
    assert_eq!(io.kind(), io::ErrorKind::InvalidInput);
}
