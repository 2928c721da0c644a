use std::io::Read;
use std::path::Path;

use anyhow::Result;

use schedgov::topology::{discover_policies, SYSFS_CPU_ROOT};

// KERNEL OPTIONS HOST MODE RELIES ON
const REQUIRED_CONFIG: [&str; 2] = ["CONFIG_CPU_FREQ=y", "CONFIG_CPU_FREQ_GOV_USERSPACE=y"];

pub fn config_has(config: &str, option: &str) -> bool {
    config.lines().any(|l| l.trim() == option)
}

fn check_kernel_config() -> bool {
    let file = match std::fs::File::open("/proc/config.gz") {
        Ok(f) => f,
        Err(_) => {
            println!("  /proc/config.gz       NOT FOUND (SKIPPED)");
            return true;
        }
    };
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut config = String::new();
    if decoder.read_to_string(&mut config).is_err() {
        println!("  /proc/config.gz       UNREADABLE (SKIPPED)");
        return true;
    }

    let mut ok = true;
    for option in REQUIRED_CONFIG {
        let name = option.trim_end_matches("=y");
        if config_has(&config, option) {
            println!("  {:<32}OK", name);
        } else if config_has(&config, &option.replace("=y", "=m")) {
            println!("  {:<32}MODULE (load it before run)", name);
        } else {
            println!("  {:<32}NOT SET", name);
            ok = false;
        }
    }
    ok
}

fn check_policies() -> bool {
    let policies = match discover_policies(Path::new(SYSFS_CPU_ROOT)) {
        Ok(p) => p,
        Err(e) => {
            println!("  cpufreq               NOT AVAILABLE ({:#})", e);
            return false;
        }
    };

    let mut ok = true;
    for p in &policies {
        let governors = std::fs::read_to_string(p.dir.join("scaling_available_governors"))
            .unwrap_or_default();
        let active = std::fs::read_to_string(p.dir.join("scaling_governor"))
            .unwrap_or_default();
        let userspace = governors.split_whitespace().any(|g| g == "userspace");
        let name = p.dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();

        println!("  {:<10} CPUS {:?} {} {} ENTRIES {}-{} KHZ, GOVERNOR {}",
                 name, p.cpus, p.class.label(), p.table.len(),
                 p.table.first().copied().unwrap_or(0),
                 p.table.last().copied().unwrap_or(0),
                 active.trim());
        if !userspace {
            println!("  {:<10} userspace GOVERNOR NOT OFFERED", name);
            ok = false;
        }
    }
    ok
}

pub fn run_check() -> Result<()> {
    println!("SCHEDGOV HOST CHECK");
    println!();

    let mut ok = true;

    println!("KERNEL CONFIG:");
    if !check_kernel_config() {
        ok = false;
    }
    println!();

    println!("CPUFREQ POLICIES:");
    if !check_policies() {
        ok = false;
    }
    println!();

    if ok {
        println!("ALL CHECKS PASSED");
    } else {
        println!("SOME CHECKS FAILED");
        println!("  `schedgov simulate` RUNS WITHOUT ANY OF THE ABOVE");
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_lines_match_exactly() {
        let cfg = "CONFIG_CPU_FREQ=y\n# CONFIG_CPU_FREQ_GOV_USERSPACE is not set\n";
        assert!(config_has(cfg, "CONFIG_CPU_FREQ=y"));
        assert!(!config_has(cfg, "CONFIG_CPU_FREQ_GOV_USERSPACE=y"));
    }
}
