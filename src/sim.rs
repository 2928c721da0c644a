// SCHEDGOV SYNTHETIC WORKLOAD
// DRIVES A TWO-CLUSTER GOVERNOR THROUGH A FIXED SEQUENCE OF PHASES ON A
// VIRTUAL CLOCK. SAME CONFIG, SAME OUTPUT.
//
// PHASES (FRACTION OF THE RUN):
//   0.00  IDLE       LIGHT NOISE, CPUS ENTER IDLE EVERY TICK
//   0.15  RAMP       UTILIZATION CLIMBS LINEARLY TOWARD SATURATION
//   0.35  IOWAIT     CPU0 BLOCKS ON I/O EVERY TICK
//   0.50  DEADLINE   ONE CPU PER CLUSTER RUNS DEADLINE WORK
//   0.60  TOP-APP    A top-app TASK ON CPU0 WITH THE SCHED-BOOST SWITCH ON
//   0.80  COOLDOWN   LIGHT NOISE, OPTIONALLY SUSPENDED

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::domain::{DomainConfig, UpdateFlags};
use crate::driver::{FreqDriver, SimDriver};
use crate::event::{EventLog, Snapshot};
use crate::governor::{Governor, GovernorConfig};
use crate::sampler::{SampleMode, SchedContext};
use crate::schedtune::{SchedBoostSwitch, SchedTune, Task, ROOT_GROUP, TOP_APP};
use crate::topology::{CapacityTable, ClusterClass};
use crate::tuning::{Shaping, TICK_NS};

pub const LITTLE_TABLE: [u32; 9] = [
    300_000, 576_000, 768_000, 1_017_600, 1_248_000,
    1_324_800, 1_516_800, 1_708_800, 1_804_800,
];

pub const BIG_TABLE: [u32; 10] = [
    652_800, 825_600, 979_200, 1_209_600, 1_401_600,
    1_612_800, 1_804_800, 2_016_000, 2_265_600, 2_419_200,
];

pub const LITTLE_CAPACITY: u64 = 410;
pub const BIG_CAPACITY: u64 = 1024;

const NS_PER_MS: u64 = 1_000_000;
const TOP_APP_BOOST: i64 = 10;
const TOP_APP_SCHED_BOOST: i64 = 40;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase {
    Idle,
    Ramp,
    Iowait,
    Deadline,
    TopApp,
    Cooldown,
}

impl Phase {
    pub fn at(tick: u64, ticks: u64) -> Self {
        let pct = tick * 100 / ticks.max(1);
        match pct {
            0..=14 => Self::Idle,
            15..=34 => Self::Ramp,
            35..=49 => Self::Iowait,
            50..=59 => Self::Deadline,
            60..=79 => Self::TopApp,
            _ => Self::Cooldown,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Ramp => "RAMP",
            Self::Iowait => "IOWAIT",
            Self::Deadline => "DEADLINE",
            Self::TopApp => "TOP-APP",
            Self::Cooldown => "COOLDOWN",
        }
    }
}

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub little_cpus: usize,
    pub big_cpus: usize,
    pub duration_ms: u64,
    pub fast_switch: bool,
    pub per_policy_tunables: bool,
    pub suspend_cooldown: bool,
    pub shaping: Shaping,
    pub boosted: bool,
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            little_cpus: 4,
            big_cpus: 4,
            duration_ms: 2000,
            fast_switch: true,
            per_policy_tunables: false,
            suspend_cooldown: false,
            shaping: Shaping::Scaled,
            boosted: true,
            seed: 0x5eed,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PolicyReport {
    pub first_cpu: usize,
    pub class: &'static str,
    pub commits: u64,
    pub failures: u64,
    pub transitions: u64,
    pub violations: u64,
    pub min_khz: u32,
    pub max_khz: u32,
    pub policy_max: u32,
    // HIGHEST FREQUENCY SEEN WHILE SUSPENDED (0 IF NEVER)
    pub suspended_peak: u32,
    pub deadline_at_max: bool,
}

pub struct SimReport {
    pub ticks: u64,
    pub policies: Vec<PolicyReport>,
    pub peak_boost: i32,
    pub log: EventLog,
}

impl SimReport {
    pub fn violations(&self) -> u64 {
        self.policies.iter().map(|p| p.violations).sum()
    }

    pub fn print(&self) {
        println!("SIM TICKS: {}", self.ticks);
        for p in &self.policies {
            println!("policy{} {} commits={} failures={} transitions={} violations={} \
                      min={} max={} policy_max={} deadline_at_max={} suspended_peak={}",
                     p.first_cpu, p.class, p.commits, p.failures, p.transitions, p.violations,
                     p.min_khz, p.max_khz, p.policy_max, p.deadline_at_max, p.suspended_peak);
        }
        println!("peak_boost={}", self.peak_boost);
        println!("rate_limit_violations={}", self.violations());
    }
}

// DETERMINISTIC NOISE
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n.max(1)
    }
}

struct Tracker {
    first_cpu: usize,
    last_freq: Option<u32>,
    last_change: u64,
    report: PolicyReport,
}

// HARDWARE STARTS AT THE BOTTOM OF THE TABLE
fn cluster(cpus: Vec<usize>, table: &[u32], class: ClusterClass) -> DomainConfig {
    let mut dc = DomainConfig::new(cpus, table.to_vec(), class);
    dc.cur = table.first().copied();
    dc
}

// (util_avg, flags) FOR ONE CPU IN ONE TICK
fn workload(phase: Phase, cpu: usize, cap: u64, progress: u64, deadline_cpus: &[usize],
            rng: &mut XorShift) -> (u64, UpdateFlags) {
    let noise = rng.below(cap / 16 + 1);
    match phase {
        Phase::Idle | Phase::Cooldown => (cap / 20 + noise, UpdateFlags::NONE),
        Phase::Ramp => ((cap * progress / 100 + noise).min(cap), UpdateFlags::NONE),
        Phase::Iowait if cpu == 0 => (cap / 8, UpdateFlags::IOWAIT),
        Phase::Iowait => (cap / 10 + noise, UpdateFlags::NONE),
        Phase::Deadline if deadline_cpus.contains(&cpu) => (cap / 10, UpdateFlags::DEADLINE),
        Phase::Deadline => (cap / 10 + noise, UpdateFlags::NONE),
        Phase::TopApp => (cap * 3 / 10 + noise, UpdateFlags::NONE),
    }
}

pub fn run(cfg: &SimConfig) -> Result<SimReport> {
    let nr = cfg.little_cpus + cfg.big_cpus;
    let caps: Vec<u64> = (0..nr)
        .map(|c| if c < cfg.little_cpus { LITTLE_CAPACITY } else { BIG_CAPACITY })
        .collect();

    let schedtune = Arc::new(SchedTune::new(nr));
    let top = schedtune.create(ROOT_GROUP, TOP_APP)?;
    schedtune.set_boost(top, TOP_APP_BOOST, 0)?;
    schedtune.set_sched_boost(top, TOP_APP_SCHED_BOOST)?;
    let switch = SchedBoostSwitch::new(TOP_APP);

    let ctx = Arc::new(SchedContext::new(CapacityTable::new(caps.clone())?, Arc::clone(&schedtune))?);
    if cfg.boosted {
        ctx.set_mode(SampleMode::Boosted);
    }

    let gov = Governor::new(Arc::clone(&ctx), GovernorConfig {
        per_policy_tunables: cfg.per_policy_tunables,
        rt_worker: false,
    });

    let mut clusters: Vec<(DomainConfig, &'static str)> = Vec::new();
    if cfg.little_cpus > 0 {
        clusters.push((cluster((0..cfg.little_cpus).collect(), &LITTLE_TABLE, ClusterClass::Little),
                       "little"));
    }
    if cfg.big_cpus > 0 {
        clusters.push((cluster((cfg.little_cpus..nr).collect(), &BIG_TABLE, ClusterClass::Big),
                       "big"));
    }

    let mut trackers = Vec::new();
    for (dc, label) in &clusters {
        let Some(&lowest) = dc.table.first() else {
            continue;
        };
        let driver: Arc<dyn FreqDriver> = Arc::new(SimDriver::new(label, cfg.fast_switch, lowest));
        let first = gov.init(dc, driver).with_context(|| format!("attaching {} cluster", label))?;
        let mut t = gov.tunables(first)?;
        t.shaping = cfg.shaping;
        gov.set_tunables(first, t)?;
        gov.start(first)?;

        let policy_max = gov.domain(first).map(|d| d.limits().max).unwrap_or(0);
        trackers.push(Tracker {
            first_cpu: first,
            last_freq: Some(lowest),
            last_change: 0,
            report: PolicyReport {
                first_cpu: first,
                class: label,
                min_khz: u32::MAX,
                policy_max,
                ..Default::default()
            },
        });
    }

    // LAST CPU OF EACH CLUSTER RUNS THE DEADLINE WORK
    let deadline_cpus: Vec<usize> = clusters.iter()
        .filter_map(|(dc, _)| dc.cpus.last().copied())
        .collect();

    let ticks = cfg.duration_ms * NS_PER_MS / TICK_NS;
    let mut rng = XorShift(cfg.seed.max(1));
    let mut log = EventLog::new();
    let mut peak_boost = 0;
    let top_task = Task::new(1000, top);
    let mut phase = Phase::Idle;
    let mut suspended = false;

    for tick in 0..ticks {
        let now = (tick + 1) * TICK_NS;
        let next = Phase::at(tick, ticks);

        if next != phase {
            match (phase, next) {
                (_, Phase::TopApp) => {
                    schedtune.enqueue(&top_task, 0, now);
                    switch.set(&schedtune, 1, now)?;
                }
                (Phase::TopApp, _) => {
                    switch.set(&schedtune, 0, now)?;
                    schedtune.dequeue(&top_task, 0, now);
                }
                _ => {}
            }
            if next == Phase::Cooldown && cfg.suspend_cooldown {
                gov.set_suspended(true);
                suspended = true;
            }
            phase = next;
        }

        let start = ticks * 15 / 100;
        let span = (ticks * 20 / 100).max(1);
        let progress = (tick.saturating_sub(start) * 100 / span).min(100);

        for cpu in 0..nr {
            let (util, flags) = workload(phase, cpu, caps[cpu], progress, &deadline_cpus, &mut rng);
            if let Some(rq) = ctx.rq(cpu) {
                rq.set_util_avg(util);
                if util < caps[cpu] / 4 {
                    rq.enter_idle();
                }
            }
            gov.on_util_update(cpu, now, flags);
        }

        for t in trackers.iter_mut() {
            let Some(d) = gov.domain(t.first_cpu) else {
                continue;
            };
            d.flush();
            let freq = d.last_committed().unwrap_or(0);
            let stats = d.stats();
            let boost = schedtune.cpu_boost(t.first_cpu, now);
            peak_boost = peak_boost.max(boost);

            if let Some(prev) = t.last_freq.filter(|&p| p != freq) {
                let (up, down) = d.rate_delays();
                let delta = now - t.last_change;
                if (freq > prev && delta < up) || (freq < prev && delta < down) {
                    t.report.violations += 1;
                }
                t.report.transitions += 1;
                t.last_freq = Some(freq);
                t.last_change = now;
            }

            t.report.min_khz = t.report.min_khz.min(freq);
            t.report.max_khz = t.report.max_khz.max(freq);
            t.report.commits = stats.commits;
            t.report.failures = stats.failures;
            if suspended {
                t.report.suspended_peak = t.report.suspended_peak.max(freq);
            }
            if phase == Phase::Deadline && freq == t.report.policy_max {
                t.report.deadline_at_max = true;
            }

            let util = d.cpus().iter()
                .filter_map(|&c| ctx.rq(c).map(|rq| rq.util_avg()))
                .max()
                .unwrap_or(0);
            log.record(Snapshot {
                ts_ns: now,
                policy: t.first_cpu,
                util,
                max: ctx.read_capacity(t.first_cpu),
                freq_khz: freq,
                cpu_boost: boost,
                commits: stats.commits,
                failures: stats.failures,
            });
        }
    }

    if phase == Phase::TopApp {
        switch.set(&schedtune, 0, ticks * TICK_NS)?;
        schedtune.dequeue(&top_task, 0, ticks * TICK_NS);
    }
    gov.shutdown();

    Ok(SimReport {
        ticks,
        policies: trackers.into_iter().map(|t| t.report).collect(),
        peak_boost,
        log,
    })
}
