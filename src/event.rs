// SCHEDGOV EVENT LOG
// RECORDS PER-DOMAIN FREQUENCY SNAPSHOTS WHILE THE GOVERNOR RUNS
// PRE-ALLOCATED RING BUFFER. NO HEAP ALLOCATION WHILE RECORDING.
// WRAPS AROUND AT CAPACITY -- OLDEST ENTRIES OVERWRITTEN.

const MAX_SNAPSHOTS: usize = 8192;

#[derive(Clone, Copy, Default)]
pub struct Snapshot {
    pub ts_ns:     u64,
    pub policy:    usize,
    pub util:      u64,
    pub max:       u64,
    pub freq_khz:  u32,
    pub cpu_boost: i32,
    pub commits:   u64,
    pub failures:  u64,
}

pub struct EventLog {
    snapshots: Vec<Snapshot>,
    head:      usize,
    len:       usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            snapshots: vec![Snapshot::default(); MAX_SNAPSHOTS],
            head: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    // RECORD ONE SNAPSHOT. OVERWRITES OLDEST ENTRY WHEN FULL.
    pub fn record(&mut self, snap: Snapshot) {
        self.snapshots[self.head] = snap;
        self.head = (self.head + 1) % MAX_SNAPSHOTS;
        if self.len < MAX_SNAPSHOTS {
            self.len += 1;
        }
    }

    // ITERATE SNAPSHOTS IN CHRONOLOGICAL ORDER
    pub fn iter_chronological(&self) -> impl Iterator<Item = &Snapshot> {
        let start = if self.len < MAX_SNAPSHOTS { 0 } else { self.head };
        (0..self.len).map(move |i| {
            &self.snapshots[(start + i) % MAX_SNAPSHOTS]
        })
    }

    // DUMP THE TIME SERIES
    pub fn dump(&self) {
        let mut iter = self.iter_chronological();
        let Some(first) = iter.next() else {
            return;
        };
        let base_ts = first.ts_ns;

        println!("\n{:<10} {:<8} {:<8} {:<8} {:<10} {:<7} {:<9} {:<8}",
            "TIME_MS", "POLICY", "UTIL", "MAX", "FREQ_KHZ", "BOOST", "COMMITS", "FAILED");
        println!("{}", "-".repeat(76));

        for s in std::iter::once(first).chain(iter) {
            let elapsed_ms = s.ts_ns.saturating_sub(base_ts) as f64 / 1_000_000.0;
            println!("{:<10.1} {:<8} {:<8} {:<8} {:<10} {:<7} {:<9} {:<8}",
                elapsed_ms, s.policy, s.util, s.max, s.freq_khz,
                s.cpu_boost, s.commits, s.failures);
        }

        if self.len == MAX_SNAPSHOTS {
            println!("\n(RING BUFFER WRAPPED -- SHOWING MOST RECENT {} SNAPSHOTS)", MAX_SNAPSHOTS);
        }
        println!("TOTAL SNAPSHOTS: {}", self.len);
    }

    // FREQUENCY TRANSITIONS OBSERVED PER POLICY, IN FIRST-SEEN ORDER
    pub fn transitions(&self) -> Vec<(usize, u64)> {
        let mut out: Vec<(usize, u64, u32)> = Vec::new();
        for s in self.iter_chronological() {
            match out.iter_mut().find(|(p, _, _)| *p == s.policy) {
                Some((_, n, last)) => {
                    if *last != s.freq_khz {
                        *n += 1;
                        *last = s.freq_khz;
                    }
                }
                None => out.push((s.policy, 0, s.freq_khz)),
            }
        }
        out.into_iter().map(|(p, n, _)| (p, n)).collect()
    }

    // SUMMARY STATISTICS
    pub fn summary(&self) {
        if self.len < 2 {
            return;
        }

        let snapshots: Vec<&Snapshot> = self.iter_chronological().collect();
        let (Some(first), Some(last)) = (snapshots.first(), snapshots.last()) else {
            return;
        };
        let elapsed_s = last.ts_ns.saturating_sub(first.ts_ns) as f64 / 1_000_000_000.0;

        println!("\n{}", "=".repeat(50));
        println!("SCHEDGOV SUMMARY");
        println!("{}", "=".repeat(50));

        for (policy, transitions) in self.transitions() {
            let mine: Vec<&&Snapshot> = snapshots.iter().filter(|s| s.policy == policy).collect();
            let peak = mine.iter().map(|s| s.freq_khz).max().unwrap_or(0);
            let low = mine.iter().map(|s| s.freq_khz).min().unwrap_or(0);
            let avg = mine.iter().map(|s| s.freq_khz as u64).sum::<u64>() / mine.len().max(1) as u64;
            let (commits, failures) = mine.last().map(|s| (s.commits, s.failures)).unwrap_or((0, 0));
            println!("  POLICY{:<3} FREQ MIN/AVG/MAX: {}/{}/{} KHZ", policy, low, avg, peak);
            println!("  POLICY{:<3} TRANSITIONS: {}  COMMITS: {}  FAILED: {}",
                policy, transitions, commits, failures);
        }

        let peak_boost = snapshots.iter().map(|s| s.cpu_boost).max().unwrap_or(0);
        println!("  PEAK CPU BOOST:    {}%", peak_boost);
        println!("  ELAPSED:           {:.3}s", elapsed_s);
        println!("  SAMPLES:           {}", self.len);
    }
}

pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
}
