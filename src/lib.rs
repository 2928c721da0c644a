// SCHEDGOV -- SCHEDULER-DRIVEN CPU FREQUENCY GOVERNOR
// UTILIZATION-TRACKING FEEDBACK LOOP: SAMPLE -> BOOST -> AGGREGATE -> MAP -> LIMIT -> COMMIT
//
// PURE-RUST LIBRARY. TIME IS ALWAYS PASSED IN EXPLICITLY (NANOSECONDS),
// SO EVERY MODULE IS TESTABLE OFFLINE WITHOUT A CLOCK OR A KERNEL.

#[macro_use]
pub mod log;

pub mod aggregate;
pub mod commit;
pub mod domain;
pub mod driver;
pub mod error;
pub mod event;
pub mod freq;
pub mod governor;
pub mod iowait;
pub mod ratelimit;
pub mod sampler;
pub mod schedtune;
pub mod sim;
pub mod topology;
pub mod tuning;

use std::sync::{Mutex, MutexGuard, PoisonError};

// LOCK, IGNORING POISON
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
