// SCHEDGOV SHARED-POLICY AGGREGATION
// ONE FREQUENCY FOR SEVERAL CPUS: MAX OF NORMALIZED UTILIZATIONS.
//
// (util, max) PAIRS ARE COMPARED BY CROSS-MULTIPLICATION SO A BIG CORE'S
// RAW CAPACITY NEVER OUTWEIGHS A LITTLE CORE THAT IS PROPORTIONALLY BUSIER.
// CPUS THAT HAVE NOT REPORTED SINCE ONE TICK BEFORE THE LAST FREQUENCY
// UPDATE ARE PRESUMED IDLE: SKIPPED, IOWAIT BOOST DROPPED.

use crate::domain::PerCpuState;
use crate::tuning::TICK_NS;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Aggregate {
    Util { util: u64, max: u64 },
    // SOME SIBLING HAS DEADLINE WORK: DOMAIN GOES TO POLICY MAX
    Deadline,
}

// TRUE IF cpu's LAST REPORT IS OLDER THAN last_freq_update - TICK
pub fn is_stale(cpu: &PerCpuState, last_freq_update: u64) -> bool {
    last_freq_update.saturating_sub(cpu.last_update) > TICK_NS
}

// cpus: EVERY PerCpuState OF THE DOMAIN. requester: INDEX OF THE CALLING CPU,
// WHOSE (util, max) ARE ALREADY STORED IN ITS ENTRY.
pub fn aggregate(cpus: &mut [PerCpuState], requester: usize, last_freq_update: u64) -> Aggregate {
    let (mut util, mut max) = {
        let me = &mut cpus[requester];
        me.iowait.apply(me.util, me.max)
    };

    for (j, cpu) in cpus.iter_mut().enumerate() {
        if j == requester {
            continue;
        }

        if is_stale(cpu, last_freq_update) {
            cpu.iowait.clear();
            continue;
        }

        // NEVER REPORTED SINCE THE DOMAIN STARTED
        if cpu.max == 0 {
            continue;
        }

        if cpu.flags.deadline() {
            return Aggregate::Deadline;
        }

        if cpu.util * max >= cpu.max * util {
            util = cpu.util;
            max = cpu.max;
        }

        (util, max) = cpu.iowait.apply(util, max);
    }

    Aggregate::Util { util, max }
}
