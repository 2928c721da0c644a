// SCHEDGOV COMMIT PATH
// APPLIES AN ACCEPTED FREQUENCY: FAST SWITCH IN THE CALLER, OR A SINGLE
// REALTIME WORKER THREAD PER DOMAIN FOR BLOCKING DRIVERS.
//
// SLOW PATH HANDOFF IS ONE ATOMIC CELL, NOT A QUEUE:
//   request(f): pending <- f; IF THE WORKER WAS IDLE, WAKE IT
//   worker:     LOOP { f <- swap(pending, UNSET); IF UNSET BREAK; set_frequency(f) }
// REQUESTS THAT ARRIVE WHILE THE WORKER IS INSIDE set_frequency OVERWRITE
// EACH OTHER, SO ONLY THE LATEST ONE REACHES THE HARDWARE.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::driver::FreqDriver;
use crate::lock;

pub const FREQ_UNSET: u32 = u32::MAX;

// WORKER PRIORITY: HALF THE USER RT RANGE
const WORKER_RT_PRIORITY: i32 = 50;

const FLUSH_POLL: Duration = Duration::from_micros(200);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CommitState {
    Idle,
    Committing,
}

struct Shared {
    driver: Arc<dyn FreqDriver>,
    pending: AtomicU32,
    work_in_progress: AtomicBool,
    committed: AtomicU32,
    // A TRANSITION FAILED SINCE THE DOMAIN LAST LOOKED
    failed: AtomicBool,
    stop: AtomicBool,
    work_lock: Mutex<()>,
    commits: AtomicU64,
    failures: AtomicU64,
}

impl Shared {
    fn record_ok(&self, freq: u32) {
        self.committed.store(freq, Ordering::Release);
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failed.store(true, Ordering::Release);
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    // DRAIN THE PENDING CELL UNTIL EMPTY. ALL HARDWARE CALLS HOLD work_lock.
    fn drain(&self, name: &str) {
        loop {
            let freq = self.pending.swap(FREQ_UNSET, Ordering::AcqRel);
            if freq == FREQ_UNSET {
                break;
            }
            let _g = lock(&self.work_lock);
            match self.driver.set_frequency(freq) {
                Ok(()) => self.record_ok(freq),
                Err(e) => {
                    log_warn!("{}: transition to {} kHz failed: {:#}", name, freq, e);
                    self.record_failure();
                }
            }
        }
    }
}

// EVERY HOT-PATH CALL IS LOCK-FREE. ONLY stop() TAKES THE worker MUTEX.
pub struct CommitPath {
    shared: Arc<Shared>,
    fast: bool,
    wake: Option<SyncSender<()>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommitPath {
    // SPAWNS THE WORKER ONLY FOR DRIVERS WITHOUT FAST SWITCH.
    // SPAWN FAILURE IS AN INITIALIZATION FAILURE.
    pub fn new(driver: Arc<dyn FreqDriver>, first_cpu: usize, rt_worker: bool) -> Result<Self> {
        let fast = driver.fast_switch_capable();
        let shared = Arc::new(Shared {
            driver,
            pending: AtomicU32::new(FREQ_UNSET),
            work_in_progress: AtomicBool::new(false),
            committed: AtomicU32::new(FREQ_UNSET),
            failed: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            work_lock: Mutex::new(()),
            commits: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        });

        if fast {
            return Ok(Self { shared, fast, wake: None, worker: Mutex::new(None) });
        }

        let (tx, rx) = sync_channel::<()>(1);
        let name = format!("sgov:{}", first_cpu);
        let worker_shared = Arc::clone(&shared);
        let thread_name = name.clone();
        let worker = std::thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(worker_shared, rx, thread_name, rt_worker))
            .with_context(|| format!("spawning commit worker for policy{}", first_cpu))?;

        Ok(Self {
            shared,
            fast,
            wake: Some(tx),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn is_fast(&self) -> bool {
        self.fast
    }

    pub fn driver(&self) -> &Arc<dyn FreqDriver> {
        &self.shared.driver
    }

    pub fn state(&self) -> CommitState {
        if self.in_progress() { CommitState::Committing } else { CommitState::Idle }
    }

    pub fn in_progress(&self) -> bool {
        self.shared.work_in_progress.load(Ordering::Acquire)
    }

    pub fn last_committed(&self) -> Option<u32> {
        match self.shared.committed.load(Ordering::Acquire) {
            FREQ_UNSET => None,
            f => Some(f),
        }
    }

    // REQUEST WAITING FOR THE WORKER, NOT YET PICKED UP
    pub fn pending(&self) -> Option<u32> {
        match self.shared.pending.load(Ordering::Acquire) {
            FREQ_UNSET => None,
            f => Some(f),
        }
    }

    // SEED THE COMMITTED VALUE (HARDWARE FREQUENCY KNOWN AT START)
    pub fn set_committed(&self, freq: u32) {
        self.shared.committed.store(freq, Ordering::Release);
    }

    pub fn commits(&self) -> u64 {
        self.shared.commits.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.shared.failures.load(Ordering::Relaxed)
    }

    // TRUE ONCE PER FAILED TRANSITION
    pub fn take_failed(&self) -> bool {
        self.shared.failed.swap(false, Ordering::AcqRel)
    }

    // NON-BLOCKING. RETURNS THE FREQUENCY SET, NONE ON REFUSAL.
    pub fn fast_commit(&self, freq: u32) -> Option<u32> {
        match self.shared.driver.fast_switch(freq) {
            Some(f) => {
                self.shared.record_ok(f);
                Some(f)
            }
            None => {
                self.shared.failures.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    // NON-BLOCKING. COALESCES ONTO THE SINGLE PENDING CELL.
    pub fn request(&self, freq: u32) {
        self.shared.pending.store(freq, Ordering::Release);
        if !self.shared.work_in_progress.swap(true, Ordering::AcqRel) {
            self.kick();
        }
    }

    fn kick(&self) {
        if let Some(tx) = &self.wake {
            match tx.try_send(()) {
                // FULL: A WAKEUP IS ALREADY QUEUED
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => {
                    self.shared.work_in_progress.store(false, Ordering::Release);
                }
            }
        }
    }

    // RUN A BLOCKING DRIVER CALL SERIALIZED AGAINST THE WORKER
    pub fn with_work_lock<T>(&self, f: impl FnOnce(&dyn FreqDriver) -> T) -> T {
        let _g = lock(&self.shared.work_lock);
        f(self.shared.driver.as_ref())
    }

    // WAIT UNTIL NO DEFERRED COMMIT IS IN FLIGHT
    pub fn flush(&self) {
        if self.fast {
            return;
        }
        while self.in_progress() && !self.shared.stop.load(Ordering::Acquire) {
            std::thread::sleep(FLUSH_POLL);
        }
    }

    // FINISH IN-FLIGHT WORK, THEN STOP AND JOIN THE WORKER
    pub fn stop(&self) {
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        // THE WORKER CHECKS stop AFTER EVERY DRAIN. FULL MEANS IT IS
        // ALREADY ABOUT TO WAKE.
        self.shared.stop.store(true, Ordering::Release);
        if let Some(tx) = &self.wake {
            let _ = tx.try_send(());
        }
        if worker.join().is_err() {
            log_error!("commit worker {} panicked", self.shared.driver.name());
        }
        self.shared.work_in_progress.store(false, Ordering::Release);
    }
}

impl Drop for CommitPath {
    fn drop(&mut self) {
        self.stop();
    }
}

fn raise_to_fifo(name: &str) {
    let param = libc::sched_param { sched_priority: WORKER_RT_PRIORITY };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc != 0 {
        log_warn!("{}: SCHED_FIFO unavailable ({}), running at normal priority",
                  name, std::io::Error::last_os_error());
    }
}

fn worker_loop(shared: Arc<Shared>, rx: Receiver<()>, name: String, rt: bool) {
    if rt {
        raise_to_fifo(&name);
    }

    // RECV ERRORS WHEN THE SENDER IS DROPPED: TEARDOWN
    while rx.recv().is_ok() {
        loop {
            shared.drain(&name);
            shared.work_in_progress.store(false, Ordering::Release);

            // A REQUEST THAT LANDED BETWEEN THE LAST SWAP AND THE STORE ABOVE
            // SAW work_in_progress SET AND DID NOT WAKE US. RECLAIM IT.
            if shared.pending.load(Ordering::Acquire) == FREQ_UNSET
                || shared.work_in_progress.swap(true, Ordering::AcqRel)
            {
                break;
            }
        }
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
    }
}
