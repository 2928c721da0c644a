// SCHEDGOV IOWAIT BOOST TESTS
// RAMP ON CONSECUTIVE I/O WAITS, HALVING DECAY PER EVALUATION, CLEAR ON
// IDLE OR DISABLE, AND THE BOOST REACHING THE FREQUENCY THROUGH A DOMAIN.

use std::sync::Arc;

use schedgov::domain::{DomainConfig, PolicyDomain, UpdateFlags};
use schedgov::driver::SimDriver;
use schedgov::iowait::{BoostPhase, IowaitBooster};
use schedgov::sampler::SchedContext;
use schedgov::schedtune::SchedTune;
use schedgov::topology::{CapacityTable, ClusterClass};
use schedgov::tuning::{Tunables, TICK_NS};

const MAX: u64 = 1_500_000;
const MIN: u64 = 300_000;
const MS: u64 = 1_000_000;

// ONE IOWAIT WAKEUP FOLLOWED BY ITS EVALUATION
fn io_event(b: &mut IowaitBooster, now: u64, last: u64) {
    b.update(now, last, true, true);
    b.apply(0, 1024);
}

// === RAMP ===

#[test]
fn consecutive_waits_double_to_ceiling() {
    let mut b = IowaitBooster::new(MAX, MIN);
    let mut seen = Vec::new();
    for i in 0..5u64 {
        io_event(&mut b, i * MS, i.saturating_sub(1) * MS);
        seen.push(b.value());
    }
    assert_eq!(seen, vec![MIN, 2 * MIN, 4 * MIN, MAX, MAX]);
}

#[test]
fn pending_blocks_second_doubling() {
    let mut b = IowaitBooster::new(MAX, MIN);
    b.update(0, 0, true, true);
    b.update(MS / 2, 0, true, true);
    assert_eq!(b.value(), MIN);
    assert!(b.pending());
}

// === DECAY ===

#[test]
fn decay_halves_then_drops_to_zero() {
    let mut b = IowaitBooster::new(MAX, MIN);
    for i in 0..4u64 {
        io_event(&mut b, i * MS, i.saturating_sub(1) * MS);
    }
    assert_eq!(b.value(), MAX);

    let mut last = 3 * MS;
    let mut values = vec![b.value()];
    while b.value() > 0 {
        let now = last + MS;
        b.update(now, last, false, true);
        b.apply(0, 1024);
        last = now;
        values.push(b.value());
        assert!(values.len() < 10, "boost never reached zero: {:?}", values);
    }

    // STRICTLY DECREASING, EVERY NON-ZERO STEP AT OR ABOVE THE FLOOR
    for w in values.windows(2) {
        assert!(w[1] < w[0]);
    }
    assert_eq!(values, vec![MAX, MAX / 2, MAX / 4, 0]);
    assert_eq!(b.phase(), BoostPhase::Idle);
}

#[test]
fn normal_updates_alone_never_decay() {
    let mut b = IowaitBooster::new(MAX, MIN);
    b.update(MS, 0, true, true);
    b.update(2 * MS, MS, false, true);
    b.update(3 * MS, 2 * MS, false, true);
    assert_eq!(b.value(), MIN);
    assert_eq!(b.phase(), BoostPhase::Boosting(MIN));

    // FIRST EVALUATION USES THE BOOST AS RAISED, THE NEXT ONE HALVES IT
    assert_eq!(b.apply(0, 1024), (MIN, MAX));
    assert_eq!(b.apply(0, 1024), (0, 1024));
    assert_eq!(b.value(), 0);
}

#[test]
fn long_idle_clears_boost() {
    let mut b = IowaitBooster::new(MAX, MIN);
    io_event(&mut b, 0, 0);
    io_event(&mut b, MS, 0);
    assert_eq!(b.value(), 2 * MIN);
    b.update(MS + TICK_NS + 1, MS, false, true);
    assert_eq!(b.value(), 0);
}

#[test]
fn disabled_clears_and_ignores() {
    let mut b = IowaitBooster::new(MAX, MIN);
    io_event(&mut b, 0, 0);
    b.update(MS, 0, true, false);
    assert_eq!(b.value(), 0);
    assert!(!b.pending());
}

#[test]
fn apply_substitutes_only_higher_ratio() {
    let mut b = IowaitBooster::new(MAX, MIN);
    io_event(&mut b, 0, 0);
    b.update(MS, 0, true, true);
    // BOOST RATIO 600/1500 = 0.4
    assert_eq!(b.apply(100, 1024), (2 * MIN, MAX));
    // DECAYED TO 0.2
    assert_eq!(b.apply(100, 1024), (MIN, MAX));
    assert_eq!(b.apply(800, 1024), (800, 1024));
}

// === THROUGH A DOMAIN ===

fn single(table: Vec<u32>) -> (Arc<SchedContext>, PolicyDomain) {
    let ctx = Arc::new(SchedContext::new(CapacityTable::uniform(1),
                                         Arc::new(SchedTune::new(1))).unwrap());
    let drv = Arc::new(SimDriver::new("fast", true, 300_000));
    let mut cfg = DomainConfig::new(vec![0], table, ClusterClass::Little);
    cfg.cur = Some(300_000);
    let d = PolicyDomain::new(&cfg, drv, Arc::clone(&ctx), Tunables::default(), false).unwrap();
    d.start();
    (ctx, d)
}

#[test]
fn iowait_raises_an_idle_cpu() {
    let (ctx, d) = single(vec![300_000, 600_000, 900_000, 1_200_000, 1_500_000]);

    let rq = ctx.rq(0).unwrap();
    rq.set_util_avg(10);
    let mut now = 0;
    for _ in 0..4 {
        now += 2 * MS;
        rq.enter_idle();
        d.update(0, now, UpdateFlags::IOWAIT);
    }
    assert_eq!(d.iowait_boost(0), Some(MAX));
    assert_eq!(d.last_committed(), Some(1_500_000));
}

#[test]
fn boost_raised_between_evaluations_survives_to_the_next_one() {
    let (ctx, d) = single(vec![300_000, 450_000, 600_000, 900_000, 1_200_000, 1_500_000]);
    let rq = ctx.rq(0).unwrap();
    rq.set_util_avg(0);
    let step = |now: u64, flags: UpdateFlags| {
        rq.enter_idle();
        d.update(0, now, flags);
    };

    // 0.2 OF PEAK: RESOLVES TO 450000
    step(10 * MS, UpdateFlags::IOWAIT);
    assert_eq!(d.iowait_boost(0), Some(MIN));
    assert_eq!(d.last_committed(), Some(450_000));

    // INSIDE THE 1 MS GATE: DOUBLED, NOT EVALUATED
    step(10 * MS + MS / 2, UpdateFlags::IOWAIT);
    assert_eq!(d.iowait_boost(0), Some(2 * MIN));
    assert_eq!(d.last_committed(), Some(450_000));

    // NEXT EVALUATION SEES THE FULL 0.4
    step(11 * MS + MS / 2, UpdateFlags::NONE);
    assert_eq!(d.iowait_boost(0), Some(2 * MIN));
    assert_eq!(d.last_committed(), Some(600_000));

    // THEN ONE HALVING PER EVALUATION
    step(12 * MS + MS / 2, UpdateFlags::NONE);
    assert_eq!(d.iowait_boost(0), Some(MIN));
    step(13 * MS + MS / 2, UpdateFlags::NONE);
    assert_eq!(d.iowait_boost(0), Some(0));
}
