// SCHEDGOV POLICY DOMAIN
// ONE FREQUENCY DOMAIN: ITS CPUS, TABLE, LIMITS, RATE LIMITER, MAPPER
// AND COMMIT PATH.
//
// EVERY UTILIZATION UPDATE RUNS update() TO COMPLETION UNDER THE DOMAIN
// LOCK, WHICH IS NEVER HELD ACROSS A BLOCKING DRIVER CALL. THE COMMIT PATH
// IS LOCK-FREE, SO ONLY THE SLOW-SWITCH WORKER EVER WAITS ON HARDWARE:
//   iowait bookkeeping -> gate -> sample/aggregate -> map -> dwell check -> commit

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};

use crate::aggregate::{aggregate, Aggregate};
use crate::commit::CommitPath;
use crate::driver::FreqDriver;
use crate::error::GovError;
use crate::freq::{FreqTable, FrequencyMapper, MapContext, PolicyLimits};
use crate::iowait::IowaitBooster;
use crate::lock;
use crate::ratelimit::{FreqState, Gate, RateLimiter};
use crate::sampler::SchedContext;
use crate::topology::ClusterClass;
use crate::tuning::Tunables;

// SCHEDULING-CLASS FLAGS OF ONE UTILIZATION UPDATE

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct UpdateFlags(u32);

impl UpdateFlags {
    pub const NONE: Self = Self(0);
    pub const IOWAIT: Self = Self(1 << 0);
    pub const DEADLINE: Self = Self(1 << 1);
    // CPU IS ENTERING IDLE: RECORD, DO NOT EVALUATE
    pub const IDLE: Self = Self(1 << 2);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn iowait(self) -> bool {
        self.contains(Self::IOWAIT)
    }

    pub fn deadline(self) -> bool {
        self.contains(Self::DEADLINE)
    }

    pub fn idle(self) -> bool {
        self.contains(Self::IDLE)
    }
}

impl std::ops::BitOr for UpdateFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// PER-CPU STATE
// WRITTEN ONLY BY ITS OWN CPU'S UPDATES. SIBLINGS READ IT DURING AGGREGATION.

#[derive(Clone, Debug)]
pub struct PerCpuState {
    pub cpu: usize,
    pub util: u64,
    pub max: u64,
    pub flags: UpdateFlags,
    pub last_update: u64,
    pub iowait: IowaitBooster,
    // idle_calls AT THE PREVIOUS EVALUATION (SINGLE-CPU BUSY HEURISTIC)
    pub saved_idle_calls: u64,
}

impl PerCpuState {
    pub fn new(cpu: usize, boost_ceiling: u64, boost_floor: u64) -> Self {
        Self {
            cpu,
            util: 0,
            max: 0,
            flags: UpdateFlags::NONE,
            last_update: 0,
            iowait: IowaitBooster::new(boost_ceiling, boost_floor),
            saved_idle_calls: 0,
        }
    }

    // NO IDLE ENTRY SINCE THE LAST LOOK: THE CPU HAS BEEN BUSY THROUGHOUT
    pub fn is_busy(&mut self, idle_calls: u64) -> bool {
        let busy = idle_calls == self.saved_idle_calls;
        self.saved_idle_calls = idle_calls;
        busy
    }
}

// STATIC DESCRIPTION OF A DOMAIN

#[derive(Clone, Debug)]
pub struct DomainConfig {
    pub cpus: Vec<usize>,
    pub table: Vec<u32>,
    pub min: Option<u32>,
    pub max: Option<u32>,
    // HARDWARE FREQUENCY AT ATTACH TIME, IF KNOWN
    pub cur: Option<u32>,
    pub class: ClusterClass,
    pub invariant: bool,
}

impl DomainConfig {
    pub fn new(cpus: Vec<usize>, table: Vec<u32>, class: ClusterClass) -> Self {
        Self { cpus, table, min: None, max: None, cur: None, class, invariant: true }
    }

    pub fn first_cpu(&self) -> Option<usize> {
        self.cpus.first().copied()
    }
}

// DOMAIN STATE UNDER THE DOMAIN LOCK

struct DomainState {
    freq: FreqState,
    limits: PolicyLimits,
    mapper: FrequencyMapper,
    rate: RateLimiter,
    tunables: Tunables,
    cpus: Vec<PerCpuState>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct DomainStats {
    pub updates: u64,
    pub evaluations: u64,
    pub requests: u64,
    pub commits: u64,
    pub failures: u64,
}

pub struct PolicyDomain {
    cpus: Vec<usize>,
    table: FreqTable,
    class: ClusterClass,
    invariant: bool,
    ctx: Arc<SchedContext>,
    commit: CommitPath,
    fast: bool,
    state: Mutex<DomainState>,
    updates: AtomicU64,
    evaluations: AtomicU64,
    requests: AtomicU64,
}

impl PolicyDomain {
    pub fn new(cfg: &DomainConfig, driver: Arc<dyn FreqDriver>, ctx: Arc<SchedContext>,
               tunables: Tunables, rt_worker: bool) -> Result<Self> {
        let Some(first) = cfg.first_cpu() else {
            bail!(GovError::InvalidValue { attr: "cpus".into(), value: "[]".into() });
        };
        if let Some(&bad) = cfg.cpus.iter().find(|&&c| c >= ctx.nr_cpus()) {
            bail!(GovError::NotFound(format!("cpu{}", bad)));
        }
        tunables.validate()?;

        let table = FreqTable::new(cfg.table.clone())?;
        let mut limits = PolicyLimits::for_table(&table);
        limits.min = cfg.min.unwrap_or(limits.min);
        limits.max = cfg.max.unwrap_or(limits.max);
        if !table.covers(limits.min, limits.max) {
            bail!(GovError::EmptyTable);
        }
        limits.cur = driver.resolve_freq(&table, &limits, cfg.cur.unwrap_or(limits.max) as u64);

        let commit = CommitPath::new(driver, first, rt_worker)?;
        let fast = commit.is_fast();

        let state = DomainState {
            freq: FreqState::default(),
            limits,
            mapper: FrequencyMapper::new(),
            rate: RateLimiter::new(tunables.up_rate_delay_ns(), tunables.down_rate_delay_ns()),
            tunables,
            cpus: cfg.cpus.iter()
                .map(|&c| PerCpuState::new(c, limits.hw_max as u64, limits.min as u64))
                .collect(),
        };

        Ok(Self {
            cpus: cfg.cpus.clone(),
            table,
            class: cfg.class,
            invariant: cfg.invariant,
            ctx,
            commit,
            fast,
            state: Mutex::new(state),
            updates: AtomicU64::new(0),
            evaluations: AtomicU64::new(0),
            requests: AtomicU64::new(0),
        })
    }

    pub fn first_cpu(&self) -> usize {
        self.cpus[0]
    }

    pub fn cpus(&self) -> &[usize] {
        &self.cpus
    }

    pub fn table(&self) -> &FreqTable {
        &self.table
    }

    pub fn class(&self) -> ClusterClass {
        self.class
    }

    pub fn is_fast(&self) -> bool {
        self.fast
    }

    pub fn limits(&self) -> PolicyLimits {
        lock(&self.state).limits
    }

    pub fn tunables(&self) -> Tunables {
        lock(&self.state).tunables
    }

    // (up, down) DWELL TIMES CURRENTLY ENFORCED, SUSPEND SWAP INCLUDED
    pub fn rate_delays(&self) -> (u64, u64) {
        let st = lock(&self.state);
        (st.rate.up_delay_ns(), st.rate.down_delay_ns())
    }

    pub fn next_freq(&self) -> Option<u32> {
        lock(&self.state).freq.next_freq
    }

    pub fn last_committed(&self) -> Option<u32> {
        self.commit.last_committed()
    }

    pub fn iowait_boost(&self, cpu: usize) -> Option<u64> {
        let st = lock(&self.state);
        st.cpus.iter().find(|c| c.cpu == cpu).map(|c| c.iowait.value())
    }

    pub fn stats(&self) -> DomainStats {
        let commit = &self.commit;
        DomainStats {
            updates: self.updates.load(Ordering::Relaxed),
            evaluations: self.evaluations.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            commits: commit.commits(),
            failures: commit.failures(),
        }
    }

    // --- LIFECYCLE HOOKS (CALLED BY THE GOVERNOR) ---

    // RESET PER-CPU AND UPDATE STATE. DOMAIN BEGINS WITH NO TARGET.
    pub fn start(&self) {
        let mut st = lock(&self.state);
        let limits = st.limits;
        st.freq = FreqState::default();
        st.mapper.reset();
        for c in st.cpus.iter_mut() {
            *c = PerCpuState::new(c.cpu, limits.hw_max as u64, limits.min as u64);
            c.saved_idle_calls = self.ctx.idle_calls(c.cpu);
        }
        self.commit.set_committed(limits.cur);
    }

    // WAIT FOR ANY DEFERRED COMMIT IN FLIGHT
    pub fn flush(&self) {
        self.commit.flush();
    }

    // JOIN THE WORKER. NO FURTHER COMMITS AFTER THIS.
    pub fn stop_worker(&self) {
        self.commit.stop();
    }

    // NEW TUNABLES FROM THE SHARED SET. FORCES A FRESH EVALUATION.
    pub fn apply_tunables(&self, t: &Tunables) {
        let mut st = lock(&self.state);
        st.tunables = *t;
        st.rate.set_delays(t.up_rate_delay_ns(), t.down_rate_delay_ns());
        st.freq.need_freq_update = true;
    }

    pub fn set_suspended(&self, suspended: bool) {
        let mut st = lock(&self.state);
        if suspended {
            st.rate.enter_suspend();
        } else {
            st.rate.exit_suspend();
        }
    }

    // NEW ADMIN LIMITS. THE HARDWARE IS PULLED INSIDE THEM IMMEDIATELY, THEN
    // A FRESH EVALUATION IS FORCED. A FAST SWITCH RUNS UNDER THE DOMAIN LOCK.
    // A BLOCKING DRIVER RUNS UNDER THE WORKER LOCK ONLY, SO CONCURRENT
    // UTILIZATION UPDATES NEVER WAIT ON IT.
    pub fn set_limits(&self, min: u32, max: u32) -> Result<()> {
        if !self.table.covers(min, max) {
            bail!(GovError::OutOfRange {
                attr: "limits".into(),
                value: min as i64,
                min: self.table.lowest() as i64,
                max: max as i64,
            });
        }

        let blocking = {
            let mut st = lock(&self.state);
            st.limits.min = min;
            st.limits.max = max;
            for c in st.cpus.iter_mut() {
                c.iowait.set_floor(min as u64);
            }
            let cur = st.limits.cur;
            let limits = st.limits;
            let clamped = self.commit.driver().resolve_freq(&self.table, &limits, cur as u64);
            if clamped == cur {
                None
            } else if self.fast {
                match self.commit.fast_commit(clamped) {
                    Some(f) => st.limits.cur = f,
                    None => log_warn!("policy{}: limits clamp to {} refused by {}",
                                      self.first_cpu(), clamped, self.commit.driver().name()),
                }
                None
            } else {
                Some(clamped)
            }
        };

        if let Some(clamped) = blocking {
            match self.commit.with_work_lock(|d| d.set_frequency(clamped)) {
                Ok(()) => {
                    self.commit.set_committed(clamped);
                    lock(&self.state).limits.cur = clamped;
                }
                Err(e) => log_warn!("policy{}: limits clamp failed: {:#}", self.first_cpu(), e),
            }
        }

        lock(&self.state).freq.need_freq_update = true;
        Ok(())
    }

    // --- HOT PATH ---

    pub fn update(&self, cpu: usize, now: u64, flags: UpdateFlags) {
        let Some(idx) = self.cpus.iter().position(|&c| c == cpu) else {
            return;
        };
        self.updates.fetch_add(1, Ordering::Relaxed);

        let (util, max) = self.ctx.sample(cpu, now);
        let suspended = self.ctx.read_suspend_state();
        let commit = &self.commit;
        let mut st = lock(&self.state);

        // HARDWARE STATE FROM THE COMMIT PATH
        if let Some(f) = commit.last_committed() {
            st.limits.cur = f;
        }
        if commit.take_failed() {
            st.freq.next_freq = None;
        }

        if self.cpus.len() == 1 {
            self.update_single(&mut st, commit, now, flags, util, max, suspended);
        } else {
            self.update_shared(&mut st, commit, idx, now, flags, util, max, suspended);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn update_single(&self, st: &mut DomainState, commit: &CommitPath, now: u64,
                     flags: UpdateFlags, util: u64, max: u64, suspended: bool) {
        let enabled = st.tunables.iowait_boost_enable;
        {
            let me = &mut st.cpus[0];
            if flags.idle() {
                me.flags = UpdateFlags::NONE;
                return;
            }
            me.iowait.update(now, me.last_update, flags.iowait(), enabled);
            me.last_update = now;
            me.flags = flags;
            me.util = util;
            me.max = max;
        }

        let gate = st.rate.should_update(now, &mut st.freq, commit.in_progress());
        if gate == Gate::Skip {
            return;
        }
        self.evaluations.fetch_add(1, Ordering::Relaxed);

        let idle_calls = self.ctx.idle_calls(self.cpus[0]);
        let busy = st.cpus[0].is_busy(idle_calls);

        let next_f = if flags.deadline() {
            let ctx = self.map_ctx(&st.limits, &st.tunables, suspended);
            st.mapper.deadline_freq(&ctx)
        } else {
            let (u, m) = st.cpus[0].iowait.apply(util, max);
            let ctx = self.map_ctx(&st.limits, &st.tunables, suspended);
            let mut f = st.mapper.next_freq(&ctx, u, m, st.freq.next_freq);
            // NOT IDLE SINCE THE LAST LOOK: LOWERING NOW WOULD BE PREMATURE
            if let Some(prev) = st.freq.next_freq {
                if busy && f < prev {
                    f = prev;
                    st.mapper.reset();
                }
            }
            f
        };

        self.commit_freq(st, commit, now, next_f, gate);
    }

    #[allow(clippy::too_many_arguments)]
    fn update_shared(&self, st: &mut DomainState, commit: &CommitPath, idx: usize, now: u64,
                     flags: UpdateFlags, util: u64, max: u64, suspended: bool) {
        let enabled = st.tunables.iowait_boost_enable;
        {
            let me = &mut st.cpus[idx];
            if flags.idle() {
                me.flags = UpdateFlags::NONE;
                return;
            }
            me.util = util;
            me.max = max;
            me.flags = flags;
            me.iowait.update(now, me.last_update, flags.iowait(), enabled);
            me.last_update = now;
        }

        let gate = st.rate.should_update(now, &mut st.freq, commit.in_progress());
        if gate == Gate::Skip {
            return;
        }
        self.evaluations.fetch_add(1, Ordering::Relaxed);

        let next_f = if flags.deadline() {
            let ctx = self.map_ctx(&st.limits, &st.tunables, suspended);
            st.mapper.deadline_freq(&ctx)
        } else {
            match aggregate(&mut st.cpus, idx, st.freq.last_update_time) {
                Aggregate::Deadline => {
                    let ctx = self.map_ctx(&st.limits, &st.tunables, suspended);
                    st.mapper.deadline_freq(&ctx)
                }
                Aggregate::Util { util, max } => {
                    let ctx = self.map_ctx(&st.limits, &st.tunables, suspended);
                    st.mapper.next_freq(&ctx, util, max, st.freq.next_freq)
                }
            }
        };

        self.commit_freq(st, commit, now, next_f, gate);
    }

    fn map_ctx<'a>(&'a self, limits: &'a PolicyLimits, tunables: &'a Tunables,
                   suspended: bool) -> MapContext<'a> {
        MapContext {
            table: &self.table,
            driver: self.commit.driver().as_ref(),
            limits,
            tunables,
            class: self.class,
            suspended,
            invariant: self.invariant,
        }
    }

    fn commit_freq(&self, st: &mut DomainState, commit: &CommitPath, now: u64,
                   next_f: u32, gate: Gate) {
        let committed = commit.last_committed();
        if !st.rate.should_commit(now, &st.freq, next_f, committed, gate) {
            return;
        }
        if st.freq.next_freq == Some(next_f) {
            return;
        }
        st.freq.next_freq = Some(next_f);
        st.freq.last_update_time = now;

        if self.fast {
            self.requests.fetch_add(1, Ordering::Relaxed);
            match commit.fast_commit(next_f) {
                Some(f) => st.limits.cur = f,
                // REFUSED: FORGET THE TARGET SO THE NEXT UPDATE RESUBMITS
                None => st.freq.next_freq = None,
            }
        } else if committed != Some(next_f) || commit.in_progress() {
            self.requests.fetch_add(1, Ordering::Relaxed);
            commit.request(next_f);
        }
    }
}
