// SCHEDGOV SIMULATE
// RUNS THE SYNTHETIC WORKLOAD AND PRINTS TELEMETRY. NO ROOT, NO SYSFS.

use anyhow::{bail, Result};

use schedgov::sim::{self, SimConfig};

pub fn run_simulate(cfg: &SimConfig, dump_log: bool) -> Result<()> {
    if cfg.little_cpus + cfg.big_cpus == 0 {
        bail!("simulate needs at least one cpu");
    }

    println!("SCHEDGOV SIMULATION");
    println!("CPUS:            {} little + {} big", cfg.little_cpus, cfg.big_cpus);
    println!("DURATION:        {} ms", cfg.duration_ms);
    println!("SWITCH:          {}", if cfg.fast_switch { "fast" } else { "slow (worker)" });
    println!("SHAPING:         {}", cfg.shaping.label());
    println!("TUNABLES:        {}", if cfg.per_policy_tunables { "per-policy" } else { "shared" });
    println!("SUSPEND:         {}", cfg.suspend_cooldown);
    println!();

    let report = sim::run(cfg)?;

    if dump_log {
        report.log.dump();
    }
    report.log.summary();
    println!();
    report.print();
    Ok(())
}
