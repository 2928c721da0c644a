// SCHEDGOV FREQUENCY MAPPER TESTS
// BAND SHAPING, QUANTIZATION, SUSPEND OVERRIDES, PUMP MODE, HYSTERESIS
//
// ALL TESTS USE PURE-RUST TYPES FROM schedgov::freq AND schedgov::tuning.
// NO CLOCK, NO SYSFS. RUN OFFLINE.

use anyhow::Result;

use schedgov::driver::FreqDriver;
use schedgov::freq::{FreqTable, FrequencyMapper, MapContext, PolicyLimits};
use schedgov::topology::ClusterClass;
use schedgov::tuning::{Shaping, Tunables};

const MHZ: u32 = 1_000;

fn table() -> FreqTable {
    FreqTable::new(vec![300 * MHZ, 600 * MHZ, 900 * MHZ, 1200 * MHZ, 1500 * MHZ]).unwrap()
}

// DEFAULT QUANTIZATION: LOWEST TABLE ENTRY AT OR ABOVE THE RAW VALUE
struct Exact;

impl FreqDriver for Exact {
    fn name(&self) -> &str {
        "exact"
    }

    fn set_frequency(&self, _freq: u32) -> Result<()> {
        Ok(())
    }
}

// ROUNDS DOWN INSTEAD, LIKE HARDWARE THAT CANNOT EXCEED THE REQUEST
struct RoundDown;

impl FreqDriver for RoundDown {
    fn name(&self) -> &str {
        "round-down"
    }

    fn set_frequency(&self, _freq: u32) -> Result<()> {
        Ok(())
    }

    fn resolve_freq(&self, table: &FreqTable, limits: &PolicyLimits, raw: u64) -> u32 {
        table.floor(raw.min(u32::MAX as u64) as u32, limits)
    }
}

fn ctx<'a>(table: &'a FreqTable, limits: &'a PolicyLimits, tunables: &'a Tunables,
           class: ClusterClass, suspended: bool) -> MapContext<'a> {
    MapContext { table, driver: &Exact, limits, tunables, class, suspended, invariant: true }
}

// === END-TO-END SCENARIOS ===

#[test]
fn half_load_lands_mid_table() {
    // load 50%: BETWEEN target_load1=32 AND target_load2=73
    let t = table();
    let limits = PolicyLimits::for_table(&t);
    let tun = Tunables::default();
    assert_eq!((tun.target_load1, tun.target_load2), (32, 73));

    let f = FrequencyMapper::new().next_freq(&ctx(&t, &limits, &tun, ClusterClass::Little, false),
                                             512, 1024, None);
    assert!(f > t.lowest() && f < limits.cur, "got {}", f);
    assert!(t.contains(f));
    assert_eq!(f, 900 * MHZ);
}

#[test]
fn full_load_hits_top_entry() {
    let t = table();
    let limits = PolicyLimits::for_table(&t);
    let tun = Tunables::default();
    let f = FrequencyMapper::new().next_freq(&ctx(&t, &limits, &tun, ClusterClass::Little, false),
                                             1024, 1024, None);
    assert_eq!(f, 1500 * MHZ);
}

#[test]
fn full_load_respects_admin_max() {
    let t = table();
    let limits = PolicyLimits { min: 300 * MHZ, max: 1000 * MHZ, hw_max: 1500 * MHZ, cur: 900 * MHZ };
    let tun = Tunables::default();
    let f = FrequencyMapper::new().next_freq(&ctx(&t, &limits, &tun, ClusterClass::Little, false),
                                             1024, 1024, None);
    assert_eq!(f, 900 * MHZ);
}

#[test]
fn driver_quantizes_the_target() {
    // load 50% -> RAW 750000: EXACT ROUNDS UP, ROUND-DOWN TAKES THE ENTRY BELOW
    let t = table();
    let limits = PolicyLimits::for_table(&t);
    let tun = Tunables::default();
    let mut c = ctx(&t, &limits, &tun, ClusterClass::Little, false);
    assert_eq!(FrequencyMapper::new().next_freq(&c, 512, 1024, None), 900 * MHZ);

    c.driver = &RoundDown;
    assert_eq!(FrequencyMapper::new().next_freq(&c, 512, 1024, None), 600 * MHZ);
    assert_eq!(FrequencyMapper::new().deadline_freq(&c), 1500 * MHZ);
}

#[test]
fn deadline_goes_to_policy_max() {
    let t = table();
    let limits = PolicyLimits { min: 300 * MHZ, max: 1200 * MHZ, hw_max: 1500 * MHZ, cur: 300 * MHZ };
    let tun = Tunables::default();
    let mut m = FrequencyMapper::new();
    assert_eq!(m.deadline_freq(&ctx(&t, &limits, &tun, ClusterClass::Little, false)), 1200 * MHZ);
    assert_eq!(m.cached_raw(), None);
}

// === QUANTIZATION ===

#[test]
fn output_always_legal_table_entry() {
    let t = table();
    let tun = Tunables::default();
    let windows = [(300, 1500), (600, 900), (900, 900), (450, 1300)];
    for (lo, hi) in windows {
        let limits = PolicyLimits { min: lo * MHZ, max: hi * MHZ, hw_max: 1500 * MHZ, cur: hi * MHZ };
        for util in (0..=1024).step_by(37) {
            let mut m = FrequencyMapper::new();
            let f = m.next_freq(&ctx(&t, &limits, &tun, ClusterClass::Big, false), util, 1024, None);
            assert!(t.contains(f), "{} not in table", f);
            assert!(f >= limits.min && f <= limits.max, "{} outside [{}, {}]", f, lo, hi);
        }
    }
}

#[test]
fn mid_shift_raises_middle_band() {
    let t = table();
    let limits = PolicyLimits::for_table(&t);
    let plain = Tunables::default();
    let shifted = Tunables { mid_shift: 2, ..Tunables::default() };

    // 1.5G * 512/1024 = 750M -> 900M; WITH +25%: 937.5M -> 1200M
    let a = FrequencyMapper::new().next_freq(&ctx(&t, &limits, &plain, ClusterClass::Little, false),
                                             512, 1024, None);
    let b = FrequencyMapper::new().next_freq(&ctx(&t, &limits, &shifted, ClusterClass::Little, false),
                                             512, 1024, None);
    assert_eq!(a, 900 * MHZ);
    assert_eq!(b, 1200 * MHZ);
}

#[test]
fn boost_perc_biases_utilization() {
    let t = table();
    let limits = PolicyLimits::for_table(&t);
    let tun = Tunables { boost_perc: 50, ..Tunables::default() };
    // 400 * 1.5 = 600 -> LOAD 58%, 1.5G * 600/1024 = 878.9M -> 900M
    let f = FrequencyMapper::new().next_freq(&ctx(&t, &limits, &tun, ClusterClass::Little, false),
                                             400, 1024, None);
    assert_eq!(f, 900 * MHZ);
}

// === HYSTERESIS ===

#[test]
fn same_raw_keeps_current_target() {
    let t = table();
    let limits = PolicyLimits::for_table(&t);
    let tun = Tunables::default();
    let c = ctx(&t, &limits, &tun, ClusterClass::Little, false);
    let mut m = FrequencyMapper::new();

    let first = m.next_freq(&c, 512, 1024, None);
    assert_eq!(first, 900 * MHZ);
    assert_eq!(m.next_freq(&c, 512, 1024, Some(600 * MHZ)), 600 * MHZ);

    // A DIFFERENT RAW VALUE RE-QUANTIZES
    assert_eq!(m.next_freq(&c, 1024, 1024, Some(600 * MHZ)), 1500 * MHZ);
}

// === SUSPEND OVERRIDES ===

#[test]
fn suspended_little_capped_by_silver_ceiling() {
    let t = table();
    let limits = PolicyLimits::for_table(&t);
    let tun = Tunables::default();
    // SILVER CEILING 1113.6M -> HIGHEST ENTRY BELOW IS 900M
    let f = FrequencyMapper::new().next_freq(&ctx(&t, &limits, &tun, ClusterClass::Little, true),
                                             1024, 1024, None);
    assert_eq!(f, 900 * MHZ);
}

#[test]
fn suspended_big_capped_by_gold_ceiling() {
    let t = table();
    let limits = PolicyLimits::for_table(&t);
    let tun = Tunables::for_class(ClusterClass::Big);
    let f = FrequencyMapper::new().next_freq(&ctx(&t, &limits, &tun, ClusterClass::Big, true),
                                             1024, 1024, None);
    assert_eq!(f, 300 * MHZ);
}

#[test]
fn suspended_prime_pinned_to_min() {
    let t = table();
    let limits = PolicyLimits { min: 600 * MHZ, ..PolicyLimits::for_table(&t) };
    let tun = Tunables::for_class(ClusterClass::Prime);
    let f = FrequencyMapper::new().next_freq(&ctx(&t, &limits, &tun, ClusterClass::Prime, true),
                                             1024, 1024, None);
    assert_eq!(f, 600 * MHZ);
}

#[test]
fn suspended_low_load_below_ceiling_untouched() {
    let t = table();
    let limits = PolicyLimits::for_table(&t);
    let tun = Tunables::default();
    let f = FrequencyMapper::new().next_freq(&ctx(&t, &limits, &tun, ClusterClass::Little, true),
                                             100, 1024, None);
    assert!(f <= 600 * MHZ, "got {}", f);
}

// === PUMP SHAPING ===

fn pump() -> Tunables {
    Tunables { shaping: Shaping::Pump, ..Tunables::default() }
}

#[test]
fn pump_steps_up_fast_below_responsiveness() {
    let t = table();
    let limits = PolicyLimits { cur: 600 * MHZ, ..PolicyLimits::for_table(&t) };
    let tun = pump();
    // LOAD 50% >= UP THRESHOLD 40%: 6 ENTRIES UP, CLAMPED AT THE TOP
    let f = FrequencyMapper::new().next_freq(&ctx(&t, &limits, &tun, ClusterClass::Little, false),
                                             512, 1024, Some(600 * MHZ));
    assert_eq!(f, 1500 * MHZ);
}

#[test]
fn pump_steps_down_one_above_responsiveness() {
    let t = table();
    let limits = PolicyLimits { cur: 1200 * MHZ, ..PolicyLimits::for_table(&t) };
    let tun = pump();
    // LOAD 9% < DOWN THRESHOLD 60%
    let f = FrequencyMapper::new().next_freq(&ctx(&t, &limits, &tun, ClusterClass::Little, false),
                                             100, 1024, Some(1200 * MHZ));
    assert_eq!(f, 900 * MHZ);
}

#[test]
fn pump_holds_between_thresholds() {
    let t = table();
    let limits = PolicyLimits { cur: 900 * MHZ, ..PolicyLimits::for_table(&t) };
    let tun = pump();
    // UP 60%, DOWN 40%: LOAD 50% STAYS PUT
    let f = FrequencyMapper::new().next_freq(&ctx(&t, &limits, &tun, ClusterClass::Little, false),
                                             512, 1024, Some(900 * MHZ));
    assert_eq!(f, 900 * MHZ);
}
