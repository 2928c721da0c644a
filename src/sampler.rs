// SCHEDGOV UTILIZATION SAMPLING
// PER-CPU RUN-QUEUE SIGNALS AND THE SCHEDULER CONTEXT THAT OWNS THEM.
//
// THE SCHEDULER SIDE WRITES SIGNALS (ATOMICS, ONE WRITER PER CPU).
// THE GOVERNOR READS THEM THROUGH sample(). NOTHING HERE BLOCKS.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::error::GovError;
use crate::schedtune::SchedTune;
use crate::topology::CapacityTable;

pub const SCHED_CAPACITY_SHIFT: u32 = 10;
pub const SCHED_CAPACITY_SCALE: u64 = 1 << SCHED_CAPACITY_SHIFT;

// RT AVERAGING WINDOW (HALF OF THE 1S sched_time_avg)
pub const SCHED_AVG_PERIOD_NS: u64 = 500_000_000;

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SampleMode {
    // RUNNING AVERAGE + RT CONTRIBUTION
    Pelt = 0,
    // BASE UTILIZATION PLUS THE CPU'S SCHEDTUNE MARGIN
    Boosted = 1,
}

impl SampleMode {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Pelt,
            _ => Self::Boosted,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Pelt => "PELT",
            Self::Boosted => "BOOSTED",
        }
    }
}

// RUN-QUEUE SIGNALS FOR ONE CPU

#[derive(Default)]
pub struct RqSignals {
    util_avg: AtomicU64,
    rt_avg: AtomicU64,
    age_stamp: AtomicU64,
    idle_calls: AtomicU64,
}

impl RqSignals {
    pub fn set_util_avg(&self, util: u64) {
        self.util_avg.store(util, Ordering::Relaxed);
    }

    pub fn util_avg(&self) -> u64 {
        self.util_avg.load(Ordering::Relaxed)
    }

    // rt_avg: DECAYED RT RUNTIME (NS) ACCUMULATED SINCE age_stamp
    pub fn set_rt_avg(&self, rt_avg: u64, age_stamp: u64) {
        self.rt_avg.store(rt_avg, Ordering::Relaxed);
        self.age_stamp.store(age_stamp, Ordering::Relaxed);
    }

    // COUNTED EVERY TIME THE CPU ENTERS IDLE
    pub fn enter_idle(&self) {
        self.idle_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn idle_calls(&self) -> u64 {
        self.idle_calls.load(Ordering::Relaxed)
    }
}

// RT CONTRIBUTION, SCALED TO CAPACITY. A CLOCK BEHIND age_stamp CLAMPS
// THE ELAPSED TERM TO ZERO.
pub fn rt_contribution(rt_avg: u64, age_stamp: u64, now: u64, cap: u64) -> u64 {
    let delta = now.saturating_sub(age_stamp);
    let rt = rt_avg / (SCHED_AVG_PERIOD_NS + delta);
    (rt * cap) >> SCHED_CAPACITY_SHIFT
}

// SCHEDTUNE MARGIN: BOOST PERCENT OF THE HEADROOM LEFT UNDER CAPACITY
pub fn boosted_util(util: u64, cap: u64, boost_pct: u32) -> u64 {
    let util = util.min(cap);
    let margin = (cap - util) * boost_pct.min(100) as u64 / 100;
    util + margin
}

// SCHEDULER CONTEXT
// EVERYTHING PER-CPU THAT THE GOVERNOR CONSUMES BUT DOES NOT OWN.
// ONE PER PROCESS, PASSED EXPLICITLY.

pub struct SchedContext {
    capacity: CapacityTable,
    rq: Vec<RqSignals>,
    schedtune: Arc<SchedTune>,
    suspended: AtomicBool,
    mode: AtomicU8,
}

impl SchedContext {
    pub fn new(capacity: CapacityTable, schedtune: Arc<SchedTune>) -> Result<Self> {
        let nr = capacity.nr_cpus();
        if schedtune.nr_cpus() != nr {
            bail!(GovError::InvalidValue {
                attr: "schedtune cpus".into(),
                value: format!("{} (capacity table has {})", schedtune.nr_cpus(), nr),
            });
        }
        Ok(Self {
            capacity,
            rq: (0..nr).map(|_| RqSignals::default()).collect(),
            schedtune,
            suspended: AtomicBool::new(false),
            mode: AtomicU8::new(SampleMode::Pelt as u8),
        })
    }

    pub fn nr_cpus(&self) -> usize {
        self.rq.len()
    }

    pub fn rq(&self, cpu: usize) -> Option<&RqSignals> {
        self.rq.get(cpu)
    }

    pub fn schedtune(&self) -> &Arc<SchedTune> {
        &self.schedtune
    }

    pub fn read_capacity(&self, cpu: usize) -> u64 {
        self.capacity.get(cpu)
    }

    pub fn read_suspend_state(&self) -> bool {
        self.suspended.load(Ordering::Relaxed)
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Relaxed);
    }

    pub fn mode(&self) -> SampleMode {
        SampleMode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    pub fn set_mode(&self, mode: SampleMode) {
        self.mode.store(mode as u8, Ordering::Relaxed);
    }

    pub fn idle_calls(&self, cpu: usize) -> u64 {
        self.rq.get(cpu).map(|rq| rq.idle_calls()).unwrap_or(0)
    }

    // UTILIZATION SAMPLER
    // (util, capacity) FOR cpu AT now. util NEVER EXCEEDS capacity.
    pub fn sample(&self, cpu: usize, now: u64) -> (u64, u64) {
        let cap = self.read_capacity(cpu);
        let Some(rq) = self.rq.get(cpu) else {
            return (0, cap);
        };

        let rt = rt_contribution(
            rq.rt_avg.load(Ordering::Relaxed),
            rq.age_stamp.load(Ordering::Relaxed),
            now,
            cap,
        );
        let util = (rq.util_avg() + rt).min(cap);

        let util = match self.mode() {
            SampleMode::Pelt => util,
            SampleMode::Boosted => {
                let boost = self.schedtune.cpu_boost(cpu, now);
                boosted_util(rq.util_avg().min(cap), cap, boost as u32)
            }
        };
        (util, cap)
    }
}
