// SCHEDGOV SIMULATION GATE
// RUNS THE BUILT BINARY'S simulate SUBCOMMAND AND CHECKS ITS REPORT.
// NO ROOT, NO SYSFS: SAFE FOR A PLAIN `cargo test`.

use std::process::Command;

use regex::Regex;

struct PolicyLine {
    class: String,
    violations: u64,
    min: u32,
    max: u32,
    policy_max: u32,
    deadline_at_max: bool,
}

fn simulate(args: &[&str]) -> String {
    let out = Command::new(env!("CARGO_BIN_EXE_schedgov"))
        .arg("simulate")
        .args(["--duration-ms", "800"])
        .args(args)
        .output()
        .expect("spawning schedgov");
    let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
    assert!(out.status.success(), "schedgov simulate {:?} failed:\n{}\n{}",
            args, stdout, String::from_utf8_lossy(&out.stderr));
    stdout
}

fn policy_lines(report: &str) -> Vec<PolicyLine> {
    let re = Regex::new(concat!(
        r"policy\d+ (\w+) commits=\d+ failures=\d+ transitions=\d+ violations=(\d+) ",
        r"min=(\d+) max=(\d+) policy_max=(\d+) deadline_at_max=(true|false)",
    )).unwrap();
    re.captures_iter(report)
        .map(|c| PolicyLine {
            class: c[1].to_string(),
            violations: c[2].parse().unwrap(),
            min: c[3].parse().unwrap(),
            max: c[4].parse().unwrap(),
            policy_max: c[5].parse().unwrap(),
            deadline_at_max: &c[6] == "true",
        })
        .collect()
}

fn total_violations(report: &str) -> u64 {
    let re = Regex::new(r"rate_limit_violations=(\d+)").unwrap();
    let c = re.captures(report).expect("no rate_limit_violations line");
    c[1].parse().unwrap()
}

fn check(report: &str) {
    assert_eq!(total_violations(report), 0, "{}", report);
    let lines = policy_lines(report);
    assert_eq!(lines.iter().map(|p| p.class.as_str()).collect::<Vec<_>>(), vec!["little", "big"]);
    for p in &lines {
        assert_eq!(p.violations, 0);
        assert!(p.min <= p.max && p.max <= p.policy_max);
        assert!(p.deadline_at_max, "{} never reached its max under deadline work", p.class);
    }
}

// === GATES ===

#[test]
fn fast_switch_run_is_clean() {
    check(&simulate(&[]));
}

#[test]
fn worker_run_is_clean() {
    check(&simulate(&["--slow"]));
}

#[test]
fn per_policy_run_is_clean() {
    check(&simulate(&["--per-policy-tunables", "--seed", "7"]));
}

#[test]
fn runs_are_reproducible() {
    let a = simulate(&["--seed", "42"]);
    let b = simulate(&["--seed", "42"]);
    let strip = |s: &str| s.lines()
        .filter(|l| l.starts_with("policy") || l.starts_with("peak_boost"))
        .map(str::to_string)
        .collect::<Vec<_>>();
    assert_eq!(strip(&a), strip(&b));
}
