// SCHEDGOV -- SCHEDULER-DRIVEN CPU FREQUENCY GOVERNOR
// UTILIZATION-TRACKING CONTROL LOOP WITH RATE LIMITING, IOWAIT BOOST,
// SHARED-POLICY AGGREGATION AND SCHEDTUNE BOOST GROUPS
//
// THE DECISION LOGIC LIVES IN THE LIBRARY. THIS BINARY WIRES IT TO A
// SYNTHETIC WORKLOAD (simulate) OR TO THE HOST'S CPUFREQ SYSFS (run).

mod cli;

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};

use schedgov::sim::SimConfig;
use schedgov::tuning::Shaping;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "schedgov")]
#[command(about = "SCHEDGOV -- SCHEDULER-DRIVEN CPU FREQUENCY GOVERNOR")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    // DUMP FULL EVENT LOG ON EXIT
    #[arg(long, global = true)]
    dump_log: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the synthetic two-cluster workload (default)
    Simulate {
        #[arg(long, default_value_t = 4)]
        little: usize,

        #[arg(long, default_value_t = 4)]
        big: usize,

        // VIRTUAL DURATION
        #[arg(long, default_value_t = 2000)]
        duration_ms: u64,

        // BLOCKING DRIVER + WORKER THREAD INSTEAD OF FAST SWITCH
        #[arg(long)]
        slow: bool,

        #[arg(long)]
        per_policy_tunables: bool,

        // SUSPEND DURING THE COOLDOWN PHASE
        #[arg(long)]
        suspend: bool,

        // scaled | pump
        #[arg(long, default_value = "scaled", value_parser = parse_shaping)]
        shaping: Shaping,

        // PLAIN PELT SAMPLING, NO SCHEDTUNE MARGIN
        #[arg(long)]
        no_boost: bool,

        #[arg(long, default_value_t = 0x5eed)]
        seed: u64,
    },

    /// Govern this machine's cpufreq policies (userspace governor required)
    Run {
        #[arg(long, default_value_t = 10)]
        interval_ms: u64,

        // 0 = UNTIL CTRL+C
        #[arg(long, default_value_t = 0)]
        duration_s: u64,

        // DECIDE BUT NEVER WRITE scaling_setspeed
        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        per_policy_tunables: bool,

        // KEEP THE COMMIT WORKERS AT NORMAL PRIORITY
        #[arg(long)]
        no_rt: bool,

        // TUNABLE OVERRIDE, attr=value (REPEATABLE)
        #[arg(long = "set", value_parser = parse_assignment)]
        set: Vec<(String, String)>,
    },

    /// Check kernel config and cpufreq sysfs for host mode
    Check,
}

fn parse_shaping(s: &str) -> Result<Shaping> {
    Shaping::parse(s).ok_or_else(|| anyhow!("unknown shaping {:?} (scaled | pump)", s))
}

fn parse_assignment(s: &str) -> Result<(String, String)> {
    let (attr, value) = s.split_once('=')
        .ok_or_else(|| anyhow!("expected attr=value, got {:?}", s))?;
    Ok((attr.trim().to_string(), value.trim().to_string()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
    })?;

    let command = cli.command.unwrap_or(Command::Simulate {
        little: 4,
        big: 4,
        duration_ms: 2000,
        slow: false,
        per_policy_tunables: false,
        suspend: false,
        shaping: Shaping::Scaled,
        no_boost: false,
        seed: 0x5eed,
    });

    match command {
        Command::Simulate { little, big, duration_ms, slow, per_policy_tunables,
                            suspend, shaping, no_boost, seed } => {
            let cfg = SimConfig {
                little_cpus: little,
                big_cpus: big,
                duration_ms,
                fast_switch: !slow,
                per_policy_tunables,
                suspend_cooldown: suspend,
                shaping,
                boosted: !no_boost,
                seed,
            };
            cli::simulate::run_simulate(&cfg, cli.dump_log)?;
        }
        Command::Run { interval_ms, duration_s, dry_run, per_policy_tunables, no_rt, set } => {
            let opts = cli::run::RunOpts {
                interval_ms,
                duration_s,
                dry_run,
                per_policy_tunables,
                rt_worker: !no_rt,
                dump_log: cli.dump_log,
                tunables: set,
            };
            println!("SCHEDGOV IS ACTIVE (CTRL+C TO EXIT)");
            cli::run::run_host(&opts, &SHUTDOWN)?;
            println!("SCHEDGOV OUT.");
        }
        Command::Check => cli::check::run_check()?,
    }

    Ok(())
}
