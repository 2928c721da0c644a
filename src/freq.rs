// SCHEDGOV FREQUENCY MAPPING
// UTILIZATION -> RAW FREQUENCY -> TABLE ENTRY
//
// SHAPING IS BREAKPOINT-BANDED FREQUENCY-INVARIANT SCALING:
//   next = shape(ref) * util / max
// OR A TABLE WALK (PUMP). BOTH END IN THE SAME SUSPEND CLAMP, HYSTERESIS
// AND QUANTIZATION, SO EVERY RESULT IS A TABLE ENTRY INSIDE POLICY LIMITS.

use anyhow::{bail, Result};

use crate::driver::FreqDriver;
use crate::error::GovError;
use crate::topology::ClusterClass;
use crate::tuning::{Shaping, Tunables};

// FREQUENCY TABLE
// ASCENDING, DEDUPLICATED, ZERO-FREE. KHZ.

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FreqTable {
    entries: Vec<u32>,
}

impl FreqTable {
    pub fn new(mut entries: Vec<u32>) -> Result<Self> {
        entries.retain(|&f| f > 0);
        entries.sort();
        entries.dedup();
        if entries.is_empty() {
            bail!(GovError::EmptyTable);
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[u32] {
        &self.entries
    }

    pub fn lowest(&self) -> u32 {
        self.entries[0]
    }

    pub fn highest(&self) -> u32 {
        self.entries[self.entries.len() - 1]
    }

    pub fn contains(&self, freq: u32) -> bool {
        self.entries.binary_search(&freq).is_ok()
    }

    pub fn index_of(&self, freq: u32) -> Option<usize> {
        self.entries.binary_search(&freq).ok()
    }

    // TRUE IF AT LEAST ONE ENTRY LIES INSIDE [min, max]
    pub fn covers(&self, min: u32, max: u32) -> bool {
        min <= max && self.entries.iter().any(|&f| f >= min && f <= max)
    }

    // LOWEST ENTRY >= RAW, CLAMPED TO LIMITS. RAW ABOVE EVERY LEGAL ENTRY
    // RESOLVES TO THE HIGHEST ENTRY <= limits.max.
    pub fn resolve(&self, raw: u64, limits: &PolicyLimits) -> u32 {
        let target = raw.clamp(limits.min as u64, limits.max as u64);
        let legal = |f: &&u32| **f >= limits.min && **f <= limits.max;
        self.entries.iter()
            .filter(legal)
            .find(|&&f| f as u64 >= target)
            .or_else(|| self.entries.iter().filter(legal).last())
            .copied()
            .unwrap_or(self.entries[0])
    }

    // HIGHEST LEGAL ENTRY <= CEILING. A CEILING BELOW EVERY LEGAL ENTRY
    // RESOLVES TO THE LOWEST LEGAL ENTRY.
    pub fn floor(&self, ceiling: u32, limits: &PolicyLimits) -> u32 {
        let legal = |f: &&u32| **f >= limits.min && **f <= limits.max;
        self.entries.iter()
            .filter(legal)
            .filter(|&&f| f <= ceiling)
            .last()
            .copied()
            .unwrap_or_else(|| self.resolve(limits.min as u64, limits))
    }

    // WALK `steps` ENTRIES AWAY FROM INDEX. STOPS AT THE TABLE EDGE.
    // NONE IF THERE IS NO ENTRY IN THAT DIRECTION.
    pub fn step(&self, index: usize, steps: u32, up: bool) -> Option<u32> {
        if steps == 0 || index >= self.entries.len() {
            return None;
        }
        let steps = steps as usize;
        if up {
            if index + 1 >= self.entries.len() {
                return None;
            }
            Some(self.entries[(index + steps).min(self.entries.len() - 1)])
        } else {
            if index == 0 {
                return None;
            }
            Some(self.entries[index.saturating_sub(steps)])
        }
    }
}

// POLICY LIMITS
// min/max ARE THE ADMIN LIMITS, hw_max THE HARDWARE PEAK, cur THE LAST
// FREQUENCY THE HARDWARE ACCEPTED.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PolicyLimits {
    pub min: u32,
    pub max: u32,
    pub hw_max: u32,
    pub cur: u32,
}

impl PolicyLimits {
    pub fn for_table(table: &FreqTable) -> Self {
        Self {
            min: table.lowest(),
            max: table.highest(),
            hw_max: table.highest(),
            cur: table.highest(),
        }
    }
}

// EVERYTHING THE MAPPER READS BUT DOES NOT OWN
pub struct MapContext<'a> {
    pub table: &'a FreqTable,
    // QUANTIZES EVERY RESULT. NON-BLOCKING.
    pub driver: &'a dyn FreqDriver,
    pub limits: &'a PolicyLimits,
    pub tunables: &'a Tunables,
    pub class: ClusterClass,
    pub suspended: bool,
    // REFERENCE IS hw_max WHEN UTILIZATION IS FREQUENCY-INVARIANT, ELSE cur
    pub invariant: bool,
}

impl MapContext<'_> {
    fn reference(&self) -> u64 {
        if self.invariant { self.limits.hw_max as u64 } else { self.limits.cur as u64 }
    }

    fn resolve(&self, raw: u64) -> u32 {
        self.driver.resolve_freq(self.table, self.limits, raw)
    }
}

// FREQUENCY MAPPER
// OWNS ONLY THE HYSTERESIS CACHE. ONE PER DOMAIN.

#[derive(Clone, Debug, Default)]
pub struct FrequencyMapper {
    cached_raw: Option<u64>,
}

impl FrequencyMapper {
    pub fn new() -> Self {
        Self { cached_raw: None }
    }

    pub fn cached_raw(&self) -> Option<u64> {
        self.cached_raw
    }

    pub fn reset(&mut self) {
        self.cached_raw = None;
    }

    // DEADLINE WORK: STRAIGHT TO THE POLICY MAXIMUM, CACHE BYPASSED
    pub fn deadline_freq(&mut self, ctx: &MapContext) -> u32 {
        self.cached_raw = None;
        ctx.resolve(ctx.limits.max as u64)
    }

    // next_freq IS THE DOMAIN'S CURRENT TARGET (NONE BEFORE THE FIRST
    // REQUEST OR AFTER A FORCED RE-EVALUATION)
    pub fn next_freq(&mut self, ctx: &MapContext, util: u64, max: u64,
                     next_freq: Option<u32>) -> u32 {
        let max = max.max(1);
        let t = ctx.tunables;

        let raw = match t.shaping {
            Shaping::Scaled => scaled_raw(ctx, util, max),
            Shaping::Pump => pump_raw(ctx, util, max, next_freq),
        };

        if ctx.suspended {
            match ctx.class {
                ClusterClass::Little => {
                    let ceil = t.silver_suspend_max_freq;
                    if ceil > 0 && (ceil as u64) < raw {
                        return ctx.table.floor(ceil, ctx.limits);
                    }
                }
                ClusterClass::Big => {
                    let ceil = t.gold_suspend_max_freq;
                    if ceil > 0 && (ceil as u64) < raw {
                        return ctx.table.floor(ceil, ctx.limits);
                    }
                }
                ClusterClass::Prime => {
                    return ctx.resolve(ctx.limits.min as u64);
                }
            }
        }

        // SAME RAW VALUE AS LAST TIME: KEEP THE CURRENT TARGET
        if let Some(prev) = next_freq {
            if self.cached_raw == Some(raw) {
                return prev;
            }
        }
        self.cached_raw = Some(raw);
        ctx.resolve(raw)
    }
}

fn biased(util: u64, boost_perc: u32) -> u64 {
    util * (100 + boost_perc as u64) / 100
}

fn scaled_raw(ctx: &MapContext, util: u64, max: u64) -> u64 {
    let t = ctx.tunables;
    let util = biased(util, t.boost_perc);
    let load = 100 * util / max;

    // SUSPENDED: max GROWS BY 1/FACTOR, LOAD STAYS AS MEASURED
    let max = if ctx.suspended {
        let f = t.suspend_capacity_factor.max(1) as u64;
        max * (f + 1) / f
    } else {
        max
    };

    let r = ctx.reference();
    let shaped = if load < t.target_load1 as u64 {
        r + (r >> t.bit_shift1)
    } else if load < t.target_load2 as u64 {
        if t.mid_shift > 0 { r + (r >> t.mid_shift) } else { r }
    } else {
        r - (r >> t.bit_shift2)
    };
    shaped * util / max
}

fn pump_raw(ctx: &MapContext, util: u64, max: u64, next_freq: Option<u32>) -> u64 {
    let t = ctx.tunables;
    let limits = ctx.limits;
    let cur = limits.cur;
    let load = biased(util, t.boost_perc) * 100 / max;

    let mut chosen = None;
    if let Some(index) = ctx.table.index_of(cur) {
        let (inc, dec) = if cur < t.freq_responsiveness {
            (t.pump_inc_step_at_min_freq, t.pump_dec_step_at_min_freq)
        } else {
            (t.pump_inc_step, t.pump_dec_step)
        };
        let pmax = limits.max.max(1) as u64;
        let up_load = (cur as u64 * 100 / pmax).min(100);
        let down_load = if index > 0 {
            (ctx.table.entries()[index - 1] as u64 * 100 / pmax).min(100)
        } else {
            0
        };

        if load >= up_load && cur < limits.max {
            chosen = ctx.table.step(index, inc, true);
        } else if load < down_load && cur > limits.min {
            chosen = ctx.table.step(index, dec, false);
        }
    }

    match (chosen, next_freq) {
        (Some(f), _) => f as u64,
        // FIRST EVALUATION WITH NOTHING TO PUMP: CLASSIC 1.25x SCALING
        (None, None) => {
            let r = ctx.reference();
            (r + (r >> 2)) * util / max
        }
        (None, Some(_)) => cur as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // TABLE QUANTIZATION ONLY
    struct Exact;

    impl FreqDriver for Exact {
        fn name(&self) -> &str {
            "exact"
        }

        fn set_frequency(&self, _freq: u32) -> Result<()> {
            Ok(())
        }
    }

    fn table() -> FreqTable {
        FreqTable::new(vec![300_000, 600_000, 900_000, 1_200_000, 1_500_000]).unwrap()
    }

    #[test]
    fn table_sorted_and_deduped() {
        let t = FreqTable::new(vec![900, 300, 0, 900, 600]).unwrap();
        assert_eq!(t.entries(), &[300, 600, 900]);
        assert!(FreqTable::new(vec![0]).is_err());
    }

    #[test]
    fn resolve_rounds_up() {
        let t = table();
        let l = PolicyLimits::for_table(&t);
        assert_eq!(t.resolve(600_001, &l), 900_000);
        assert_eq!(t.resolve(600_000, &l), 600_000);
        assert_eq!(t.resolve(0, &l), 300_000);
        assert_eq!(t.resolve(u64::MAX, &l), 1_500_000);
    }

    #[test]
    fn resolve_honors_limits() {
        let t = table();
        let l = PolicyLimits { min: 500_000, max: 1_000_000, hw_max: 1_500_000, cur: 900_000 };
        assert_eq!(t.resolve(0, &l), 600_000);
        assert_eq!(t.resolve(1_400_000, &l), 900_000);
    }

    #[test]
    fn floor_picks_highest_below() {
        let t = table();
        let l = PolicyLimits::for_table(&t);
        assert_eq!(t.floor(1_113_600, &l), 900_000);
        assert_eq!(t.floor(100, &l), 300_000);
    }

    #[test]
    fn step_walks_and_stops() {
        let t = table();
        assert_eq!(t.step(1, 2, true), Some(1_200_000));
        assert_eq!(t.step(3, 6, true), Some(1_500_000));
        assert_eq!(t.step(4, 1, true), None);
        assert_eq!(t.step(2, 5, false), Some(300_000));
        assert_eq!(t.step(0, 1, false), None);
    }

    #[test]
    fn hysteresis_returns_previous_target() {
        let t = table();
        let l = PolicyLimits { cur: 1_500_000, ..PolicyLimits::for_table(&t) };
        let tun = Tunables::default();
        let ctx = MapContext {
            table: &t, driver: &Exact, limits: &l, tunables: &tun,
            class: ClusterClass::Little, suspended: false, invariant: true,
        };
        let mut m = FrequencyMapper::new();
        let f = m.next_freq(&ctx, 512, 1024, None);
        assert_eq!(f, 900_000);
        // SAME RAW, STALE TARGET: THE TARGET WINS OVER RE-QUANTIZING
        assert_eq!(m.next_freq(&ctx, 512, 1024, Some(1_200_000)), 1_200_000);
        // NO TARGET: ALWAYS RE-QUANTIZE
        assert_eq!(m.next_freq(&ctx, 512, 1024, None), 900_000);
    }
}
