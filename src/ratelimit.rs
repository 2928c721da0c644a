// SCHEDGOV RATE LIMITING
// MINIMUM DWELL BETWEEN FREQUENCY CHANGES, SEPARATELY FOR UP AND DOWN.
//
// TWO STAGES:
//   GATE:   COARSE. NOTHING IS EVALUATED UNTIL min(up, down) HAS PASSED.
//   COMMIT: FINE. A CANDIDATE ABOVE THE LAST COMMITTED FREQUENCY WAITS FOR
//           up_delay, ONE BELOW WAITS FOR down_delay.
// COMPARING AGAINST THE COMMITTED VALUE (NOT THE LAST SAMPLE) MEANS
// ALTERNATING SAMPLES CANNOT WALK AROUND THE LIMIT.

use crate::tuning::RATE_LIMIT_SUSP_NS;

// PER-DOMAIN UPDATE BOOKKEEPING, GUARDED BY THE DOMAIN LOCK

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FreqState {
    pub last_update_time: u64,
    // CURRENT TARGET. NONE = UNSET, FORCES A FRESH COMPUTE.
    pub next_freq: Option<u32>,
    // TUNABLES OR LIMITS CHANGED SINCE THE LAST EVALUATION
    pub need_freq_update: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Gate {
    Skip,
    Evaluate,
    // FORCED BY need_freq_update. BYPASSES THE UP/DOWN CHECK.
    Forced,
}

#[derive(Clone, Debug)]
pub struct RateLimiter {
    up_delay_ns: u64,
    down_delay_ns: u64,
    min_delay_ns: u64,
    // AWAKE DELAYS, PARKED WHILE SUSPENDED
    saved: Option<(u64, u64)>,
}

impl RateLimiter {
    pub fn new(up_delay_ns: u64, down_delay_ns: u64) -> Self {
        Self {
            up_delay_ns,
            down_delay_ns,
            min_delay_ns: up_delay_ns.min(down_delay_ns),
            saved: None,
        }
    }

    pub fn up_delay_ns(&self) -> u64 {
        self.up_delay_ns
    }

    pub fn down_delay_ns(&self) -> u64 {
        self.down_delay_ns
    }

    pub fn min_delay_ns(&self) -> u64 {
        self.min_delay_ns
    }

    pub fn suspended(&self) -> bool {
        self.saved.is_some()
    }

    // NEW AWAKE DELAYS. WHILE SUSPENDED THEY ARE PARKED UNTIL RESUME.
    pub fn set_delays(&mut self, up_delay_ns: u64, down_delay_ns: u64) {
        if self.saved.is_some() {
            self.saved = Some((up_delay_ns, down_delay_ns));
            return;
        }
        self.up_delay_ns = up_delay_ns;
        self.down_delay_ns = down_delay_ns;
        self.min_delay_ns = up_delay_ns.min(down_delay_ns);
    }

    pub fn enter_suspend(&mut self) {
        if self.saved.is_some() {
            return;
        }
        self.saved = Some((self.up_delay_ns, self.down_delay_ns));
        self.up_delay_ns = RATE_LIMIT_SUSP_NS;
        self.down_delay_ns = RATE_LIMIT_SUSP_NS;
        self.min_delay_ns = RATE_LIMIT_SUSP_NS;
    }

    pub fn exit_suspend(&mut self) {
        if let Some((up, down)) = self.saved.take() {
            self.set_delays(up, down);
        }
    }

    // SHOULD THIS UPDATE EVALUATE AT ALL?
    pub fn should_update(&self, now: u64, st: &mut FreqState, in_progress: bool) -> Gate {
        if in_progress {
            return Gate::Skip;
        }

        if st.need_freq_update {
            st.need_freq_update = false;
            st.next_freq = None;
            return Gate::Forced;
        }

        if now.saturating_sub(st.last_update_time) >= self.min_delay_ns {
            Gate::Evaluate
        } else {
            Gate::Skip
        }
    }

    // TRUE IF THE CANDIDATE MUST WAIT FOR ITS DIRECTION'S DWELL TIME
    pub fn up_down_limited(&self, now: u64, st: &FreqState, candidate: u32,
                           committed: Option<u32>) -> bool {
        let Some(committed) = committed else {
            return false;
        };
        let delta = now.saturating_sub(st.last_update_time);

        if candidate > committed && delta < self.up_delay_ns {
            return true;
        }
        if candidate < committed && delta < self.down_delay_ns {
            return true;
        }
        false
    }

    // FULL COMMIT DECISION FOR ONE CANDIDATE
    pub fn should_commit(&self, now: u64, st: &FreqState, candidate: u32,
                         committed: Option<u32>, gate: Gate) -> bool {
        match gate {
            Gate::Skip => false,
            Gate::Forced => true,
            Gate::Evaluate => !self.up_down_limited(now, st, candidate, committed),
        }
    }
}
