// SCHEDGOV TUNING TYPES
// PURE-RUST MODULE: NO CLOCK, NO SYSFS, NO THREADS
// SHARED BY THE GOVERNOR (domain.rs, governor.rs), THE CLI AND THE TESTS

use anyhow::{bail, Result};

use crate::error::{check_range, GovError};
use crate::topology::ClusterClass;

// SCHEDULER TICK (HZ=250). THE STALENESS UNIT FOR IOWAIT AND AGGREGATION.
pub const TICK_NS: u64 = 4_000_000;

pub const NSEC_PER_USEC: u64 = 1_000;

// RATE LIMIT USED FOR BOTH DIRECTIONS WHILE THE DEVICE IS SUSPENDED
pub const RATE_LIMIT_SUSP_NS: u64 = 80_000_000;   // 80MS

// LITTLE-CLUSTER DEFAULTS

pub const UP_RATE_LIMIT_US: u32   = 1000;
pub const DOWN_RATE_LIMIT_US: u32 = 5000;
pub const BIT_SHIFT_1: u32        = 9;
pub const BIT_SHIFT_2: u32        = 9;
pub const TARGET_LOAD_1: u32      = 32;
pub const TARGET_LOAD_2: u32      = 73;

// BIG-CLUSTER DEFAULTS: LOWER FIRST BREAKPOINT, STEEPER TOP-BAND CUT

pub const UP_RATE_LIMIT_BIGC_US: u32   = 1000;
pub const DOWN_RATE_LIMIT_BIGC_US: u32 = 5000;
pub const BIT_SHIFT_1_BIGC: u32        = 10;
pub const BIT_SHIFT_2_BIGC: u32        = 6;
pub const TARGET_LOAD_1_BIGC: u32      = 24;
pub const TARGET_LOAD_2_BIGC: u32      = 71;

// SUSPEND OVERRIDES

pub const SUSPEND_MAX_FREQ_SILVER: u32 = 1_113_600;  // KHZ
pub const SUSPEND_MAX_FREQ_GOLD: u32   = 300_000;    // KHZ
pub const SUSPEND_CAPACITY_FACTOR: u32 = 10;

// PUMP SHAPING DEFAULTS

pub const FREQ_RESPONSIVENESS: u32       = 1_036_800;  // KHZ
pub const PUMP_INC_STEP_AT_MIN_FREQ: u32 = 6;
pub const PUMP_INC_STEP: u32             = 3;
pub const PUMP_DEC_STEP_AT_MIN_FREQ: u32 = 3;
pub const PUMP_DEC_STEP: u32             = 1;

pub const MAX_BIT_SHIFT: u32 = 31;

// SHAPING MODE

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Shaping {
    // BREAKPOINT BANDS + FREQUENCY-INVARIANT SCALING
    Scaled,
    // WALK THE TABLE UP/DOWN BY A FIXED NUMBER OF ENTRIES
    Pump,
}

impl Shaping {
    pub fn label(self) -> &'static str {
        match self {
            Self::Scaled => "scaled",
            Self::Pump => "pump",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scaled" => Some(Self::Scaled),
            "pump" => Some(Self::Pump),
            _ => None,
        }
    }
}

// TUNABLES
// ONE PLAIN-TEXT INTEGER PER ATTRIBUTE. ALL WRITES VALIDATE A COPY FIRST.

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Tunables {
    pub up_rate_limit_us: u32,
    pub down_rate_limit_us: u32,
    pub target_load1: u32,
    pub target_load2: u32,
    pub bit_shift1: u32,
    pub bit_shift2: u32,
    pub mid_shift: u32,          // 0 = PLAIN SCALING IN THE MIDDLE BAND
    pub boost_perc: u32,
    pub iowait_boost_enable: bool,
    pub silver_suspend_max_freq: u32,
    pub gold_suspend_max_freq: u32,
    pub suspend_capacity_factor: u32,
    pub shaping: Shaping,
    pub freq_responsiveness: u32,
    pub pump_inc_step: u32,
    pub pump_inc_step_at_min_freq: u32,
    pub pump_dec_step: u32,
    pub pump_dec_step_at_min_freq: u32,
}

pub const TUNABLE_ATTRS: &[&str] = &[
    "up_rate_limit_us",
    "down_rate_limit_us",
    "target_load1",
    "target_load2",
    "bit_shift1",
    "bit_shift2",
    "mid_shift",
    "boost_perc",
    "iowait_boost_enable",
    "silver_suspend_max_freq",
    "gold_suspend_max_freq",
    "suspend_capacity_factor",
    "shaping",
    "freq_responsiveness",
    "pump_inc_step",
    "pump_inc_step_at_min_freq",
    "pump_dec_step",
    "pump_dec_step_at_min_freq",
];

impl Default for Tunables {
    fn default() -> Self {
        Self::for_class(ClusterClass::Little)
    }
}

impl Tunables {
    pub fn for_class(class: ClusterClass) -> Self {
        let (up, down, shift1, shift2, load1, load2) = match class {
            ClusterClass::Little => (
                UP_RATE_LIMIT_US, DOWN_RATE_LIMIT_US,
                BIT_SHIFT_1, BIT_SHIFT_2, TARGET_LOAD_1, TARGET_LOAD_2,
            ),
            ClusterClass::Big | ClusterClass::Prime => (
                UP_RATE_LIMIT_BIGC_US, DOWN_RATE_LIMIT_BIGC_US,
                BIT_SHIFT_1_BIGC, BIT_SHIFT_2_BIGC, TARGET_LOAD_1_BIGC, TARGET_LOAD_2_BIGC,
            ),
        };
        Self {
            up_rate_limit_us: up,
            down_rate_limit_us: down,
            target_load1: load1,
            target_load2: load2,
            bit_shift1: shift1,
            bit_shift2: shift2,
            mid_shift: 0,
            boost_perc: 0,
            iowait_boost_enable: true,
            silver_suspend_max_freq: SUSPEND_MAX_FREQ_SILVER,
            gold_suspend_max_freq: SUSPEND_MAX_FREQ_GOLD,
            suspend_capacity_factor: SUSPEND_CAPACITY_FACTOR,
            shaping: Shaping::Scaled,
            freq_responsiveness: FREQ_RESPONSIVENESS,
            pump_inc_step: PUMP_INC_STEP,
            pump_inc_step_at_min_freq: PUMP_INC_STEP_AT_MIN_FREQ,
            pump_dec_step: PUMP_DEC_STEP,
            pump_dec_step_at_min_freq: PUMP_DEC_STEP_AT_MIN_FREQ,
        }
    }

    // SLOW TRANSITIONS STRETCH THE DEFAULT DWELL TIMES BY THE LATENCY IN US.
    // ONLY APPLIED TO FRESH DEFAULTS, NEVER TO RESTORED VALUES.
    pub fn scaled_for_latency(mut self, transition_latency_ns: u64) -> Self {
        let lat_us = u32::try_from(transition_latency_ns / NSEC_PER_USEC).unwrap_or(u32::MAX);
        if lat_us > 0 {
            self.up_rate_limit_us = self.up_rate_limit_us.saturating_mul(lat_us);
            self.down_rate_limit_us = self.down_rate_limit_us.saturating_mul(lat_us);
        }
        self
    }

    pub fn up_rate_delay_ns(&self) -> u64 {
        self.up_rate_limit_us as u64 * NSEC_PER_USEC
    }

    pub fn down_rate_delay_ns(&self) -> u64 {
        self.down_rate_limit_us as u64 * NSEC_PER_USEC
    }

    pub fn validate(&self) -> Result<()> {
        check_range("target_load1", self.target_load1 as i64, 0, 99)?;
        check_range("target_load2", self.target_load2 as i64,
                    self.target_load1 as i64 + 1, 100)?;
        check_range("bit_shift1", self.bit_shift1 as i64, 1, MAX_BIT_SHIFT as i64)?;
        check_range("bit_shift2", self.bit_shift2 as i64, 1, MAX_BIT_SHIFT as i64)?;
        check_range("mid_shift", self.mid_shift as i64, 0, MAX_BIT_SHIFT as i64)?;
        check_range("boost_perc", self.boost_perc as i64, 0, 100)?;
        check_range("suspend_capacity_factor", self.suspend_capacity_factor as i64,
                    1, u32::MAX as i64)?;
        check_range("pump_inc_step", self.pump_inc_step as i64, 1, u32::MAX as i64)?;
        check_range("pump_inc_step_at_min_freq", self.pump_inc_step_at_min_freq as i64,
                    1, u32::MAX as i64)?;
        check_range("pump_dec_step", self.pump_dec_step as i64, 1, u32::MAX as i64)?;
        check_range("pump_dec_step_at_min_freq", self.pump_dec_step_at_min_freq as i64,
                    1, u32::MAX as i64)?;
        Ok(())
    }

    pub fn show(&self, attr: &str) -> Result<String> {
        let v = match attr {
            "up_rate_limit_us" => self.up_rate_limit_us,
            "down_rate_limit_us" => self.down_rate_limit_us,
            "target_load1" => self.target_load1,
            "target_load2" => self.target_load2,
            "bit_shift1" => self.bit_shift1,
            "bit_shift2" => self.bit_shift2,
            "mid_shift" => self.mid_shift,
            "boost_perc" => self.boost_perc,
            "iowait_boost_enable" => self.iowait_boost_enable as u32,
            "silver_suspend_max_freq" => self.silver_suspend_max_freq,
            "gold_suspend_max_freq" => self.gold_suspend_max_freq,
            "suspend_capacity_factor" => self.suspend_capacity_factor,
            "shaping" => return Ok(format!("{}\n", self.shaping.label())),
            "freq_responsiveness" => self.freq_responsiveness,
            "pump_inc_step" => self.pump_inc_step,
            "pump_inc_step_at_min_freq" => self.pump_inc_step_at_min_freq,
            "pump_dec_step" => self.pump_dec_step,
            "pump_dec_step_at_min_freq" => self.pump_dec_step_at_min_freq,
            _ => bail!(GovError::UnknownAttr(attr.to_string())),
        };
        Ok(format!("{}\n", v))
    }

    // PARSE, APPLY TO A COPY, VALIDATE, THEN COMMIT. A REJECTED WRITE
    // LEAVES EVERY FIELD UNTOUCHED.
    pub fn store(&mut self, attr: &str, text: &str) -> Result<()> {
        let text = text.trim();
        let mut next = *self;

        if attr == "shaping" {
            next.shaping = Shaping::parse(text).ok_or_else(|| GovError::InvalidValue {
                attr: attr.to_string(),
                value: text.to_string(),
            })?;
        } else {
            let v: u32 = text.parse().map_err(|_| GovError::InvalidValue {
                attr: attr.to_string(),
                value: text.to_string(),
            })?;
            match attr {
                "up_rate_limit_us" => next.up_rate_limit_us = v,
                "down_rate_limit_us" => next.down_rate_limit_us = v,
                "target_load1" => next.target_load1 = v,
                "target_load2" => next.target_load2 = v,
                "bit_shift1" => next.bit_shift1 = v,
                "bit_shift2" => next.bit_shift2 = v,
                "mid_shift" => next.mid_shift = v,
                "boost_perc" => next.boost_perc = v,
                "iowait_boost_enable" => {
                    check_range(attr, v as i64, 0, 1)?;
                    next.iowait_boost_enable = v == 1;
                }
                "silver_suspend_max_freq" => next.silver_suspend_max_freq = v,
                "gold_suspend_max_freq" => next.gold_suspend_max_freq = v,
                "suspend_capacity_factor" => next.suspend_capacity_factor = v,
                "freq_responsiveness" => next.freq_responsiveness = v,
                "pump_inc_step" => next.pump_inc_step = v,
                "pump_inc_step_at_min_freq" => next.pump_inc_step_at_min_freq = v,
                "pump_dec_step" => next.pump_dec_step = v,
                "pump_dec_step_at_min_freq" => next.pump_dec_step_at_min_freq = v,
                _ => bail!(GovError::UnknownAttr(attr.to_string())),
            }
        }

        next.validate()?;
        *self = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_defaults_validate() {
        Tunables::for_class(ClusterClass::Little).validate().unwrap();
        Tunables::for_class(ClusterClass::Big).validate().unwrap();
        Tunables::for_class(ClusterClass::Prime).validate().unwrap();
    }

    #[test]
    fn latency_scaling_multiplies() {
        let t = Tunables::for_class(ClusterClass::Little).scaled_for_latency(20_000);
        assert_eq!(t.up_rate_limit_us, UP_RATE_LIMIT_US * 20);
        assert_eq!(t.down_rate_limit_us, DOWN_RATE_LIMIT_US * 20);

        // SUB-MICROSECOND LATENCY LEAVES DEFAULTS ALONE
        let t = Tunables::default().scaled_for_latency(999);
        assert_eq!(t.up_rate_limit_us, UP_RATE_LIMIT_US);
    }

    #[test]
    fn huge_latency_saturates() {
        // 2^32 US WOULD WRAP TO ZERO AS A u32
        let t = Tunables::default().scaled_for_latency((u32::MAX as u64 + 1) * NSEC_PER_USEC);
        assert_eq!(t.up_rate_limit_us, u32::MAX);
        assert_eq!(t.down_rate_limit_us, u32::MAX);
        let t = Tunables::default().scaled_for_latency(u64::MAX);
        assert_eq!(t.up_rate_limit_us, u32::MAX);
    }

    #[test]
    fn every_attr_round_trips_through_show() {
        let t = Tunables::default();
        for attr in TUNABLE_ATTRS {
            let shown = t.show(attr).unwrap();
            let mut copy = t;
            copy.store(attr, &shown).unwrap();
            assert_eq!(copy, t, "attr {}", attr);
        }
    }

    #[test]
    fn delays_in_ns() {
        let t = Tunables::default();
        assert_eq!(t.up_rate_delay_ns(), 1_000_000);
        assert_eq!(t.down_rate_delay_ns(), 5_000_000);
    }
}
