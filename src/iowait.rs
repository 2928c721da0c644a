// SCHEDGOV IOWAIT BOOST
// TRANSIENT UTILIZATION INFLATION AFTER A CPU BLOCKS ON I/O.
//
// BOOST IS A FREQUENCY-EQUIVALENT PAIR (value, ceiling) COMPARED AGAINST
// (util, max) BY CROSS-MULTIPLICATION. IO-WAIT EVENTS DOUBLE IT AND
// EVALUATIONS WITHOUT A FRESH IO-WAIT HALVE IT. ONE IDLE TICK CLEARS IT.
// DECAY HAPPENS ONLY IN apply(): UPDATES SKIPPED BY THE RATE GATE LEAVE IT
// UNTOUCHED.
//
//   IDLE --iowait--> BOOSTING(min) --iowait+apply--> BOOSTING(2v, capped)
//                        |                              |
//                      apply                          apply
//                        v                              v
//                   DECAYING(v) --apply--> v/2 ... v < min --> IDLE

use crate::tuning::TICK_NS;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BoostPhase {
    Idle,
    Boosting(u64),
    Decaying(u64),
}

#[derive(Clone, Debug)]
pub struct IowaitBooster {
    value: u64,
    ceiling: u64,
    floor: u64,
    // SET BY AN IO-WAIT EVENT, CONSUMED BY THE NEXT APPLY.
    // BLOCKS REPEATED DOUBLING AND SHIELDS A FRESH BOOST FROM ONE DECAY.
    pending: bool,
}

impl IowaitBooster {
    // ceiling: HARDWARE MAX FREQUENCY, floor: POLICY MIN FREQUENCY
    pub fn new(ceiling: u64, floor: u64) -> Self {
        Self { value: 0, ceiling, floor: floor.min(ceiling), pending: false }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub fn pending(&self) -> bool {
        self.pending
    }

    pub fn phase(&self) -> BoostPhase {
        match (self.value, self.pending) {
            (0, _) => BoostPhase::Idle,
            (v, true) => BoostPhase::Boosting(v),
            (v, false) => BoostPhase::Decaying(v),
        }
    }

    // POLICY MIN CHANGED (LIMITS WRITE)
    pub fn set_floor(&mut self, floor: u64) {
        self.floor = floor.min(self.ceiling);
    }

    pub fn clear(&mut self) {
        self.value = 0;
        self.pending = false;
    }

    // CALLED ON EVERY UTILIZATION UPDATE FOR THIS CPU, BEFORE last_update
    // IS ADVANCED TO now
    pub fn update(&mut self, now: u64, last_update: u64, iowait: bool, enabled: bool) {
        if !enabled {
            self.clear();
            return;
        }

        if iowait {
            if self.pending {
                return;
            }
            self.pending = true;
            self.value = if self.value > 0 {
                (self.value << 1).min(self.ceiling)
            } else {
                self.floor
            };
            return;
        }

        // IDLE FOR LONGER THAN A TICK: THE I/O BURST IS OVER
        if self.value > 0 && now.saturating_sub(last_update) > TICK_NS {
            self.clear();
        }
    }

    // CALLED ONCE PER EVALUATION. A PENDING BOOST IS USED AS IS AND THE MARK
    // CONSUMED, OTHERWISE IT DECAYS FIRST. THEN SUBSTITUTE (value, ceiling)
    // WHEN IT REPRESENTS A HIGHER RATIO THAN (util, max).
    pub fn apply(&mut self, util: u64, max: u64) -> (u64, u64) {
        if self.value == 0 {
            return (util, max);
        }
        if self.pending {
            self.pending = false;
        } else {
            self.value >>= 1;
            if self.value < self.floor {
                self.value = 0;
                return (util, max);
            }
        }
        if util * self.ceiling < max * self.value {
            (self.value, self.ceiling)
        } else {
            (util, max)
        }
    }
}
