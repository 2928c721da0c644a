// SCHEDGOV CPU TOPOLOGY
// CAPACITY TABLE, CLUSTER CLASSES, CPUFREQ POLICY DISCOVERY FROM SYSFS
//
// THE CONTROL LOOP NEVER TOUCHES SYSFS. DISCOVERY RUNS ONCE AT STARTUP
// AND HANDS PLAIN VALUES TO THE GOVERNOR.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::error::GovError;
use crate::sampler::SCHED_CAPACITY_SCALE;

pub const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

// CLUSTER CLASS
// SELECTS DEFAULT TUNABLES AND WHICH SUSPEND CEILING APPLIES.

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ClusterClass {
    Little,
    Big,
    Prime,
}

impl ClusterClass {
    pub fn label(self) -> &'static str {
        match self {
            Self::Little => "LITTLE",
            Self::Big => "BIG",
            Self::Prime => "PRIME",
        }
    }

    // RANK CLUSTERS BY PEAK FREQUENCY: SLOWEST IS LITTLE, FASTEST OF THREE OR
    // MORE IS PRIME, EVERYTHING IN BETWEEN IS BIG. A SINGLE CLUSTER IS LITTLE.
    pub fn from_rank(rank: usize, clusters: usize) -> Self {
        if rank == 0 {
            Self::Little
        } else if clusters >= 3 && rank == clusters - 1 {
            Self::Prime
        } else {
            Self::Big
        }
    }
}

// CAPACITY TABLE
// STATIC PER-CPU CAPACITY IN 0..=1024 UNITS. NEVER ZERO, SO NO DIVISOR IS.

#[derive(Clone, Debug)]
pub struct CapacityTable {
    caps: Vec<u64>,
}

impl CapacityTable {
    pub fn new(caps: Vec<u64>) -> Result<Self> {
        if caps.is_empty() {
            bail!(GovError::NotFound("cpu capacities".into()));
        }
        for (cpu, &cap) in caps.iter().enumerate() {
            if cap == 0 || cap > SCHED_CAPACITY_SCALE {
                bail!(GovError::OutOfRange {
                    attr: format!("cpu{}/cpu_capacity", cpu),
                    value: cap as i64,
                    min: 1,
                    max: SCHED_CAPACITY_SCALE as i64,
                });
            }
        }
        Ok(Self { caps })
    }

    pub fn uniform(nr_cpus: usize) -> Self {
        Self { caps: vec![SCHED_CAPACITY_SCALE; nr_cpus.max(1)] }
    }

    pub fn nr_cpus(&self) -> usize {
        self.caps.len()
    }

    // OUT-OF-RANGE CPUS READ AS FULL SCALE RATHER THAN ZERO
    pub fn get(&self, cpu: usize) -> u64 {
        self.caps.get(cpu).copied().unwrap_or(SCHED_CAPACITY_SCALE)
    }
}

// ONE CPUFREQ POLICY AS FOUND IN SYSFS

#[derive(Clone, Debug)]
pub struct PolicyInfo {
    pub cpus: Vec<usize>,
    pub table: Vec<u32>,
    pub min: u32,
    pub max: u32,
    pub cur: u32,
    pub latency_ns: u64,
    pub class: ClusterClass,
    pub dir: PathBuf,
}

pub fn parse_cpu_list(s: &str) -> Vec<usize> {
    let mut result = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(s), Ok(e)) = (start.parse::<usize>(), end.parse::<usize>()) {
                for cpu in s..=e {
                    result.push(cpu);
                }
            }
        } else if let Ok(cpu) = part.parse::<usize>() {
            result.push(cpu);
        }
    }
    result.sort();
    result.dedup();
    result
}

// WHITESPACE-SEPARATED KHZ LIST, AS IN scaling_available_frequencies
pub fn parse_freq_list(s: &str) -> Vec<u32> {
    let mut freqs: Vec<u32> = s.split_whitespace()
        .filter_map(|t| t.parse::<u32>().ok())
        .filter(|&f| f > 0)
        .collect();
    freqs.sort();
    freqs.dedup();
    freqs
}

fn read_u64(path: &Path) -> Result<u64> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    text.trim().parse::<u64>()
        .with_context(|| format!("parsing {}", path.display()))
}

fn read_policy(dir: &Path) -> Result<PolicyInfo> {
    let cpus_text = std::fs::read_to_string(dir.join("related_cpus"))
        .with_context(|| format!("reading {}/related_cpus", dir.display()))?;
    let cpus = parse_cpu_list(cpus_text.trim());
    if cpus.is_empty() {
        bail!(GovError::NotFound(format!("{}/related_cpus", dir.display())));
    }

    let min = read_u64(&dir.join("scaling_min_freq"))? as u32;
    let max = read_u64(&dir.join("scaling_max_freq"))? as u32;
    let cur = read_u64(&dir.join("scaling_cur_freq")).unwrap_or(max as u64) as u32;
    let latency_ns = read_u64(&dir.join("cpuinfo_transition_latency")).unwrap_or(0);

    // DRIVERS WITHOUT A DISCRETE TABLE (intel_pstate) EXPOSE ONLY THE RANGE
    let mut table = std::fs::read_to_string(dir.join("scaling_available_frequencies"))
        .map(|s| parse_freq_list(&s))
        .unwrap_or_default();
    if table.is_empty() {
        let lo = read_u64(&dir.join("cpuinfo_min_freq")).unwrap_or(min as u64) as u32;
        let hi = read_u64(&dir.join("cpuinfo_max_freq")).unwrap_or(max as u64) as u32;
        table = synth_table(lo, hi);
    }

    Ok(PolicyInfo {
        cpus,
        table,
        min,
        max,
        cur,
        latency_ns,
        class: ClusterClass::Little,
        dir: dir.to_path_buf(),
    })
}

// 100MHZ STEPS BETWEEN THE HARDWARE BOUNDS, ENDPOINTS INCLUDED
fn synth_table(lo: u32, hi: u32) -> Vec<u32> {
    const STEP_KHZ: u32 = 100_000;
    let mut t = Vec::new();
    let mut f = lo;
    while f < hi {
        t.push(f);
        f = f.saturating_add(STEP_KHZ);
    }
    t.push(hi);
    t.dedup();
    t
}

// ENUMERATE cpufreq/policyN DIRECTORIES AND CLASSIFY BY PEAK FREQUENCY
pub fn discover_policies(root: &Path) -> Result<Vec<PolicyInfo>> {
    let cpufreq = root.join("cpufreq");
    let entries = std::fs::read_dir(&cpufreq)
        .with_context(|| format!("reading {}", cpufreq.display()))?;

    let mut policies = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("policy") {
            continue;
        }
        policies.push(read_policy(&entry.path())?);
    }
    if policies.is_empty() {
        bail!(GovError::NotFound(format!("{}/policy*", cpufreq.display())));
    }
    policies.sort_by_key(|p| p.cpus[0]);
    classify(&mut policies);
    Ok(policies)
}

pub fn classify(policies: &mut [PolicyInfo]) {
    let mut peaks: Vec<u32> = policies.iter()
        .map(|p| p.table.last().copied().unwrap_or(p.max))
        .collect();
    peaks.sort();
    peaks.dedup();
    let clusters = peaks.len();
    for p in policies.iter_mut() {
        let peak = p.table.last().copied().unwrap_or(p.max);
        let rank = peaks.iter().position(|&f| f == peak).unwrap_or(0);
        p.class = ClusterClass::from_rank(rank, clusters);
    }
}

// cpu_capacity IS ONLY PRESENT ON ASYMMETRIC SYSTEMS; OTHERWISE FULL SCALE
pub fn read_capacities(root: &Path, nr_cpus: usize) -> Result<CapacityTable> {
    let caps = (0..nr_cpus)
        .map(|cpu| {
            read_u64(&root.join(format!("cpu{}/cpu_capacity", cpu)))
                .unwrap_or(SCHED_CAPACITY_SCALE)
                .clamp(1, SCHED_CAPACITY_SCALE)
        })
        .collect();
    CapacityTable::new(caps)
}
