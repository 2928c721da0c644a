// SCHEDGOV HOST MODE
// DRIVES THE REAL CPUFREQ POLICIES OF THIS MACHINE: TOPOLOGY FROM SYSFS,
// PER-CPU BUSY TIME FROM /proc/stat, COMMITS THROUGH scaling_setspeed.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;

use schedgov::domain::{DomainConfig, UpdateFlags};
use schedgov::driver::{FreqDriver, SimDriver, SysfsDriver};
use schedgov::event::{now_ns, EventLog, Snapshot};
use schedgov::governor::{Governor, GovernorConfig};
use schedgov::sampler::SchedContext;
use schedgov::schedtune::SchedTune;
use schedgov::topology::{discover_policies, read_capacities, SYSFS_CPU_ROOT};
use schedgov::{log_info, log_warn};

pub struct RunOpts {
    pub interval_ms: u64,
    pub duration_s: u64,
    pub dry_run: bool,
    pub per_policy_tunables: bool,
    pub rt_worker: bool,
    pub dump_log: bool,
    pub tunables: Vec<(String, String)>,
}

// ONE /proc/stat cpuN LINE, JIFFIES
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub idle: u64,
    pub iowait: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.busy + self.idle + self.iowait
    }
}

pub fn stat_regex() -> Result<Regex> {
    // cpuN user nice system idle iowait irq softirq [steal ...]
    Ok(Regex::new(
        r"(?m)^cpu(\d+)\s+(\d+)\s+(\d+)\s+(\d+)\s+(\d+)\s+(\d+)\s+(\d+)\s+(\d+)(?:\s+(\d+))?",
    )?)
}

pub fn parse_proc_stat(re: &Regex, text: &str, nr_cpus: usize) -> Vec<CpuTimes> {
    let mut out = vec![CpuTimes::default(); nr_cpus];
    for cap in re.captures_iter(text) {
        let field = |i: usize| -> u64 {
            cap.get(i).and_then(|m| m.as_str().parse().ok()).unwrap_or(0)
        };
        let cpu = field(1) as usize;
        let Some(slot) = out.get_mut(cpu) else {
            continue;
        };
        *slot = CpuTimes {
            busy: field(2) + field(3) + field(4) + field(7) + field(8) + field(9),
            idle: field(5),
            iowait: field(6),
        };
    }
    out
}

// BUSY FRACTION OF THE INTERVAL, SCALED TO CAPACITY
pub fn interval_util(prev: &CpuTimes, cur: &CpuTimes, cap: u64) -> u64 {
    let total = cur.total().saturating_sub(prev.total());
    if total == 0 {
        return 0;
    }
    let busy = cur.busy.saturating_sub(prev.busy);
    (busy * cap / total).min(cap)
}

fn read_governor(dir: &Path) -> String {
    std::fs::read_to_string(dir.join("scaling_governor"))
        .unwrap_or_default()
        .trim()
        .to_string()
}

pub fn run_host(opts: &RunOpts, shutdown: &AtomicBool) -> Result<()> {
    let root = Path::new(SYSFS_CPU_ROOT);
    let policies = discover_policies(root)?;
    let nr_cpus = policies.iter()
        .flat_map(|p| p.cpus.iter().copied())
        .max()
        .map(|c| c + 1)
        .unwrap_or(1);

    if !opts.dry_run {
        for p in &policies {
            let gov = read_governor(&p.dir);
            if gov != "userspace" {
                bail!("{}: scaling_governor is {:?}, need \"userspace\" (or use --dry-run)",
                      p.dir.display(), gov);
            }
        }
    }

    let capacity = read_capacities(root, nr_cpus)?;
    let schedtune = Arc::new(SchedTune::new(nr_cpus));
    let ctx = Arc::new(SchedContext::new(capacity, schedtune)?);
    let gov = Governor::new(Arc::clone(&ctx), GovernorConfig {
        per_policy_tunables: opts.per_policy_tunables,
        rt_worker: opts.rt_worker,
    });

    let mut firsts = Vec::new();
    for p in &policies {
        let driver: Arc<dyn FreqDriver> = if opts.dry_run {
            let name = p.dir.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Arc::new(SimDriver::new(&name, true, p.cur).with_latency_ns(p.latency_ns))
        } else {
            Arc::new(SysfsDriver::new(p.dir.clone(), p.latency_ns))
        };

        let mut dc = DomainConfig::new(p.cpus.clone(), p.table.clone(), p.class);
        dc.min = Some(p.min);
        dc.max = Some(p.max);
        dc.cur = Some(p.cur);

        let first = gov.init(&dc, driver)
            .with_context(|| format!("attaching {}", p.dir.display()))?;
        for (attr, value) in &opts.tunables {
            gov.store_tunable(first, attr, value)?;
        }
        gov.start(first)?;
        firsts.push(first);
    }

    log_info!("{} policies, {} cpus, interval {}ms{}", firsts.len(), nr_cpus, opts.interval_ms,
              if opts.dry_run { " (DRY RUN)" } else { "" });

    let re = stat_regex()?;
    let read_stat = || -> Result<Vec<CpuTimes>> {
        let text = std::fs::read_to_string("/proc/stat").context("reading /proc/stat")?;
        Ok(parse_proc_stat(&re, &text, nr_cpus))
    };

    let mut prev = read_stat()?;
    let mut log = EventLog::new();
    let interval = Duration::from_millis(opts.interval_ms.max(1));
    let deadline = (opts.duration_s > 0)
        .then(|| now_ns() + opts.duration_s * 1_000_000_000);

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(interval);
        let now = now_ns();
        if deadline.is_some_and(|d| now >= d) {
            break;
        }

        let cur = match read_stat() {
            Ok(c) => c,
            Err(e) => {
                log_warn!("{:#}", e);
                continue;
            }
        };

        for cpu in 0..nr_cpus {
            let cap = ctx.read_capacity(cpu);
            let util = interval_util(&prev[cpu], &cur[cpu], cap);
            let Some(rq) = ctx.rq(cpu) else {
                continue;
            };
            rq.set_util_avg(util);
            if cur[cpu].idle > prev[cpu].idle {
                rq.enter_idle();
            }
            let flags = if cur[cpu].iowait > prev[cpu].iowait {
                UpdateFlags::IOWAIT
            } else {
                UpdateFlags::NONE
            };
            gov.on_util_update(cpu, now, flags);
        }

        for &first in &firsts {
            let Some(d) = gov.domain(first) else {
                continue;
            };
            let stats = d.stats();
            let util = d.cpus().iter()
                .filter_map(|&c| ctx.rq(c).map(|rq| rq.util_avg()))
                .max()
                .unwrap_or(0);
            log.record(Snapshot {
                ts_ns: now,
                policy: first,
                util,
                max: ctx.read_capacity(first),
                freq_khz: d.last_committed().unwrap_or(0),
                cpu_boost: ctx.schedtune().cpu_boost(first, now),
                commits: stats.commits,
                failures: stats.failures,
            });
        }
        prev = cur;
    }

    gov.shutdown();
    if opts.dump_log {
        log.dump();
    }
    log.summary();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "cpu  100 0 50 1000 10 0 0 0 0 0\n\
                        cpu0 60 0 20 500 5 0 0 0 0 0\n\
                        cpu1 40 0 30 500 5 0 0 0 0 0\n\
                        intr 12345\n";

    #[test]
    fn parses_per_cpu_lines_only() {
        let re = stat_regex().unwrap();
        let t = parse_proc_stat(&re, STAT, 2);
        assert_eq!(t[0], CpuTimes { busy: 80, idle: 500, iowait: 5 });
        assert_eq!(t[1], CpuTimes { busy: 70, idle: 500, iowait: 5 });
    }

    #[test]
    fn util_is_busy_share_of_capacity() {
        let a = CpuTimes { busy: 0, idle: 0, iowait: 0 };
        let b = CpuTimes { busy: 50, idle: 50, iowait: 0 };
        assert_eq!(interval_util(&a, &b, 1024), 512);
        assert_eq!(interval_util(&b, &b, 1024), 0);
    }
}
