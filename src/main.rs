use std::{
    env,
    io::Write,
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use log::{Level, LevelFilter, Log, Metadata, Record};
use robust_futex::{FutexLock, LockState, RobustMutex, RobustRegistry};

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let color = match record.level() {
            Level::Error => "\x1b[31m",
            Level::Warn => "\x1b[33m",
            Level::Info => "\x1b[32m",
            Level::Debug => "\x1b[36m",
            Level::Trace => "\x1b[90m",
        };
        let _ = writeln!(
            std::io::stderr(),
            "{color}[{:>5}]\x1b[0m {}",
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging() -> Result<()> {
    let level = match env::var("ROBUST_FUTEX_LOG") {
        Ok(v) => v
            .parse::<LevelFilter>()
            .map_err(|e| anyhow!("ROBUST_FUTEX_LOG={v}: {e}"))?,
        Err(_) => LevelFilter::Info,
    };
    log::set_logger(&LOGGER).map_err(|e| anyhow!("{e}"))?;
    log::set_max_level(level);
    Ok(())
}

fn main() -> Result<()> {
    init_logging()?;
    handoff()?;
    owner_death()?;
    Ok(())
}

/// Unit A (id 100) holds the word, unit B (id 200) blocks on it, A's release wakes B.
fn handoff() -> Result<()> {
    log::info!("=== handoff ===");
    let lock = Arc::new(FutexLock::new());
    let registry_a = Box::pin(RobustRegistry::new());

    unsafe { lock.acquire(registry_a.as_ref(), 100) }?;
    log::info!("A: acquired, word {:#x}", lock.word().load());

    let b = thread::spawn({
        let lock = lock.clone();
        move || -> Result<u32> {
            let registry_b = Box::pin(RobustRegistry::new());
            unsafe { lock.acquire(registry_b.as_ref(), 200) }?;
            let seen = lock.word().load();
            log::info!("B: acquired, word {seen:#x}");
            unsafe { lock.release(registry_b.as_ref(), 200) }?;
            Ok(seen)
        }
    });

    while !matches!(lock.state(), LockState::OwnedWithWaiters(100)) {
        thread::sleep(Duration::from_millis(1));
    }
    log::info!("A: B is waiting, word {:#x}", lock.word().load());

    let woken = unsafe { lock.release(registry_a.as_ref(), 100) }?;
    log::info!("A: released, woke {woken}");

    let seen = b.join().map_err(|_| anyhow!("unit B panicked"))??;
    log::info!("B saw owner {}", seen & robust_futex::word::FUTEX_TID_MASK);
    Ok(())
}

/// A thread exits holding the lock; the kernel repairs the word on its way out.
fn owner_death() -> Result<()> {
    log::info!("=== owner death ===");
    let shared = Arc::new(RobustMutex::new(0u64));
    let (tx, rx) = mpsc::channel();

    let dead = thread::spawn({
        let shared = shared.clone();
        move || {
            let mut guard = shared.grab();
            *guard = 10;
            let _ = tx.send(robust_futex::futex::tid());
            std::mem::forget(guard);
        }
    });
    let tid = rx.recv().context("owner thread never locked")?;
    dead.join().map_err(|_| anyhow!("owner thread panicked"))?;
    log::info!("thread {tid} exited holding the lock: {:?}", shared.futex().state());

    match shared.lock() {
        Ok(guard) => log::info!("lock clean, value {}", *guard),
        Err(mut guard) => {
            log::warn!("previous owner died, value {}; resetting", *guard);
            *guard = 0;
        }
    }
    Ok(())
}
