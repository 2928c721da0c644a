// SCHEDGOV FREQUENCY DRIVERS
// THE HARDWARE SIDE OF THE COMMIT PATH.
//
// set_frequency MAY BLOCK AND ONLY RUNS ON THE PER-DOMAIN WORKER.
// fast_switch AND resolve_freq MUST NOT BLOCK: THEY RUN IN THE CALLER.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::freq::{FreqTable, PolicyLimits};
use crate::lock;

pub trait FreqDriver: Send + Sync {
    fn name(&self) -> &str;

    // BLOCKING TRANSITION. KHZ.
    fn set_frequency(&self, freq: u32) -> Result<()>;

    // NON-BLOCKING TRANSITION. RETURNS THE FREQUENCY ACTUALLY SET,
    // NONE IF THE SWITCH WAS REFUSED.
    fn fast_switch(&self, _freq: u32) -> Option<u32> {
        None
    }

    fn fast_switch_capable(&self) -> bool {
        false
    }

    fn transition_latency_ns(&self) -> u64 {
        0
    }

    fn resolve_freq(&self, table: &FreqTable, limits: &PolicyLimits, raw: u64) -> u32 {
        table.resolve(raw, limits)
    }
}

// SYSFS DRIVER
// WRITES scaling_setspeed. REQUIRES THE userspace GOVERNOR ON THE POLICY.

pub struct SysfsDriver {
    name: String,
    setspeed: PathBuf,
    latency_ns: u64,
}

impl SysfsDriver {
    pub fn new(policy_dir: PathBuf, latency_ns: u64) -> Self {
        let name = policy_dir.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "policy".to_string());
        Self { name, setspeed: policy_dir.join("scaling_setspeed"), latency_ns }
    }
}

impl FreqDriver for SysfsDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_frequency(&self, freq: u32) -> Result<()> {
        let mut f = OpenOptions::new()
            .write(true)
            .open(&self.setspeed)
            .with_context(|| format!("opening {}", self.setspeed.display()))?;
        write!(f, "{}", freq)
            .with_context(|| format!("writing {} to {}", freq, self.setspeed.display()))?;
        Ok(())
    }

    fn transition_latency_ns(&self) -> u64 {
        self.latency_ns
    }
}

// SIMULATED DRIVER
// RECORDS EVERY HARDWARE CALL. OPTIONAL PER-CALL DELAY AND INJECTED FAILURE.

pub struct SimDriver {
    name: String,
    fast: bool,
    latency_ns: u64,
    delay: Duration,
    current: AtomicU32,
    calls: AtomicU64,
    fail: AtomicBool,
    history: Mutex<Vec<u32>>,
}

impl SimDriver {
    pub fn new(name: &str, fast: bool, initial: u32) -> Self {
        Self {
            name: name.to_string(),
            fast,
            latency_ns: 0,
            delay: Duration::ZERO,
            current: AtomicU32::new(initial),
            calls: AtomicU64::new(0),
            fail: AtomicBool::new(false),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency_ns(mut self, latency_ns: u64) -> Self {
        self.latency_ns = latency_ns;
        self
    }

    // BLOCKING CALLS SLEEP THIS LONG, TO HOLD THE WORKER BUSY
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn history(&self) -> Vec<u32> {
        lock(&self.history).clone()
    }
}

impl FreqDriver for SimDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_frequency(&self, freq: u32) -> Result<()> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.calls.fetch_add(1, Ordering::Relaxed);
        lock(&self.history).push(freq);
        if self.fail.load(Ordering::Relaxed) {
            bail!("{}: simulated transition failure at {} kHz", self.name, freq);
        }
        self.current.store(freq, Ordering::Relaxed);
        Ok(())
    }

    fn fast_switch(&self, freq: u32) -> Option<u32> {
        if !self.fast {
            return None;
        }
        self.calls.fetch_add(1, Ordering::Relaxed);
        lock(&self.history).push(freq);
        if self.fail.load(Ordering::Relaxed) {
            return None;
        }
        self.current.store(freq, Ordering::Relaxed);
        Some(freq)
    }

    fn fast_switch_capable(&self) -> bool {
        self.fast
    }

    fn transition_latency_ns(&self) -> u64 {
        self.latency_ns
    }
}
