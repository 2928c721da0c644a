// SCHEDGOV SCHEDTUNE BOOST GROUPS
// PER-CPU ACCOUNTING OF WHICH BOOST CLASSES HAVE RUNNABLE WORK, AND THE
// RESULTING cpu_boost() PERCENTAGE FED INTO THE UTILIZATION SAMPLER.
//
// LAYOUT:
//   REGISTRY (ONE MUTEX):  NAMES, CONFIGURED BOOST, prefer_idle, DYNAMIC SLOTS
//   PER CPU (ATOMICS):     boost/tasks/ts PER GROUP + CACHED (boost_max, boost_ts)
// WRITERS TAKE THE PER-CPU MUTEX. cpu_boost() TAKES NOTHING: A CACHE OLDER
// THAN THE HOLD WINDOW IS RECOMPUTED IN PLACE. A RACING WRITER CAN ONLY
// MAKE THAT READ STALE FOR ONE HOLD WINDOW.
//
// A GROUP AFFECTS A CPU WHILE IT HAS RUNNABLE TASKS THERE AND FOR
// SCHEDTUNE_BOOST_HOLD_NS AFTER THE LAST ONE LEFT.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};

use crate::error::{check_range, GovError};
use crate::lock;

pub const BOOSTGROUPS_COUNT: usize = 6;
pub const SCHEDTUNE_BOOST_HOLD_NS: u64 = 50_000_000;   // 50MS
pub const DYNAMIC_BOOST_SLOTS_COUNT: usize = 5;

pub const ROOT_GROUP: GroupId = GroupId(0);
pub const ROOT_NAME: &str = "root";
pub const TOP_APP: &str = "top-app";

// "NEVER STAMPED" / "CACHE INVALID"
const TS_NONE: u64 = u64::MAX;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct GroupId(usize);

impl GroupId {
    pub fn index(self) -> usize {
        self.0
    }
}

// THE SLICE OF A TASK THAT BOOST ACCOUNTING NEEDS

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Task {
    pub pid: u32,
    pub group: GroupId,
    pub rt: bool,
}

impl Task {
    pub fn new(pid: u32, group: GroupId) -> Self {
        Self { pid, group, rt: false }
    }

    pub fn rt(pid: u32, group: GroupId) -> Self {
        Self { pid, group, rt: true }
    }
}

// PER-CPU STATE

struct GroupCounters {
    boost: AtomicI32,
    tasks: AtomicU32,
    ts: AtomicU64,
}

impl GroupCounters {
    fn new() -> Self {
        Self {
            boost: AtomicI32::new(0),
            tasks: AtomicU32::new(0),
            ts: AtomicU64::new(TS_NONE),
        }
    }
}

struct BoostGroups {
    group: [GroupCounters; BOOSTGROUPS_COUNT],
    boost_max: AtomicI32,
    boost_ts: AtomicU64,
    lock: Mutex<()>,
}

impl BoostGroups {
    fn new() -> Self {
        Self {
            group: std::array::from_fn(|_| GroupCounters::new()),
            boost_max: AtomicI32::new(0),
            boost_ts: AtomicU64::new(TS_NONE),
            lock: Mutex::new(()),
        }
    }

    fn group_active(&self, idx: usize, now: u64) -> bool {
        if idx == 0 {
            return true;
        }
        let g = &self.group[idx];
        if g.tasks.load(Ordering::Relaxed) > 0 {
            return true;
        }
        !boost_timeout(now, g.ts.load(Ordering::Relaxed))
    }

    // FULL RESCAN. ROOT IS ALWAYS ACTIVE; TIES GO TO THE LATER GROUP.
    fn recompute(&self, now: u64) {
        let mut boost_max = self.group[0].boost.load(Ordering::Relaxed);
        let mut boost_ts = now;
        for idx in 1..BOOSTGROUPS_COUNT {
            if !self.group_active(idx, now) {
                continue;
            }
            let b = self.group[idx].boost.load(Ordering::Relaxed);
            if boost_max > b {
                continue;
            }
            boost_max = b;
            boost_ts = self.group[idx].ts.load(Ordering::Relaxed);
        }
        self.boost_max.store(boost_max.max(0), Ordering::Relaxed);
        self.boost_ts.store(boost_ts, Ordering::Relaxed);
    }
}

fn boost_timeout(now: u64, ts: u64) -> bool {
    ts == TS_NONE || now.saturating_sub(ts) > SCHEDTUNE_BOOST_HOLD_NS
}

// REGISTRY STATE

struct Group {
    name: String,
    boost: i32,
    // LAST ADMIN-WRITTEN BOOST. DYNAMIC BOOSTS NEVER OVERWRITE IT.
    boost_default: i32,
    prefer_idle: bool,
    sched_boost: i32,
    slot_boost: [i32; DYNAMIC_BOOST_SLOTS_COUNT],
    available: VecDeque<usize>,
    active: VecDeque<usize>,
}

impl Group {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            boost: 0,
            boost_default: 0,
            prefer_idle: false,
            sched_boost: 0,
            slot_boost: [0; DYNAMIC_BOOST_SLOTS_COUNT],
            available: (0..DYNAMIC_BOOST_SLOTS_COUNT).collect(),
            active: VecDeque::new(),
        }
    }

    fn max_active_boost(&self) -> i32 {
        self.active.iter()
            .map(|&s| self.slot_boost[s])
            .fold(self.boost_default, i32::max)
    }
}

type Registry = [Option<Group>; BOOSTGROUPS_COUNT];

pub struct SchedTune {
    cpus: Vec<BoostGroups>,
    registry: Mutex<Registry>,
    hold_all: AtomicBool,
}

impl SchedTune {
    pub fn new(nr_cpus: usize) -> Self {
        let mut registry: Registry = std::array::from_fn(|_| None);
        registry[0] = Some(Group::new(ROOT_NAME));
        Self {
            cpus: (0..nr_cpus.max(1)).map(|_| BoostGroups::new()).collect(),
            registry: Mutex::new(registry),
            hold_all: AtomicBool::new(true),
        }
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    // HOLD TIMESTAMPS FOR EVERY TASK (DEFAULT) OR ONLY FOR RT TASKS
    pub fn set_hold_all(&self, on: bool) {
        self.hold_all.store(on, Ordering::Relaxed);
    }

    fn update_timestamp(&self, task: &Task) -> bool {
        self.hold_all.load(Ordering::Relaxed) || task.rt
    }

    // --- REGISTRY ---

    // ONLY ONE LEVEL BELOW ROOT. AT MOST BOOSTGROUPS_COUNT GROUPS INCLUDING ROOT.
    pub fn create(&self, parent: GroupId, name: &str) -> Result<GroupId> {
        if parent != ROOT_GROUP {
            bail!(GovError::Nested);
        }
        if name.is_empty() {
            bail!(GovError::InvalidValue { attr: "name".into(), value: String::new() });
        }
        let mut reg = lock(&self.registry);
        if reg.iter().flatten().any(|g| g.name == name) {
            bail!(GovError::AlreadyExists(name.to_string()));
        }
        let Some(idx) = (1..BOOSTGROUPS_COUNT).find(|&i| reg[i].is_none()) else {
            bail!(GovError::NoSpace("boost groups"));
        };

        for bg in &self.cpus {
            let _g = lock(&bg.lock);
            let c = &bg.group[idx];
            c.boost.store(0, Ordering::Relaxed);
            c.tasks.store(0, Ordering::Relaxed);
            c.ts.store(TS_NONE, Ordering::Relaxed);
        }
        reg[idx] = Some(Group::new(name));
        log_info!("schedtune: created boost group {} ({})", idx, name);
        Ok(GroupId(idx))
    }

    pub fn destroy(&self, id: GroupId, now: u64) -> Result<()> {
        if id == ROOT_GROUP {
            bail!(GovError::RootGroup);
        }
        let mut reg = lock(&self.registry);
        let name = match reg.get(id.0).and_then(|g| g.as_ref()) {
            Some(g) => g.name.clone(),
            None => bail!(GovError::NotFound(format!("boost group {}", id.0))),
        };
        if self.cpus.iter().any(|bg| bg.group[id.0].tasks.load(Ordering::Relaxed) > 0) {
            bail!(GovError::InUse(name));
        }
        self.boostgroup_update(id.0, 0, now);
        reg[id.0] = None;
        log_info!("schedtune: removed boost group {} ({})", id.0, name);
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<GroupId> {
        let reg = lock(&self.registry);
        reg.iter()
            .position(|g| g.as_ref().is_some_and(|g| g.name == name))
            .map(GroupId)
    }

    pub fn name(&self, id: GroupId) -> Result<String> {
        self.with_group(id, |g| g.name.clone())
    }

    pub fn groups(&self) -> Vec<(GroupId, String)> {
        let reg = lock(&self.registry);
        reg.iter()
            .enumerate()
            .filter_map(|(i, g)| g.as_ref().map(|g| (GroupId(i), g.name.clone())))
            .collect()
    }

    fn with_group<T>(&self, id: GroupId, f: impl FnOnce(&Group) -> T) -> Result<T> {
        let reg = lock(&self.registry);
        match reg.get(id.0).and_then(|g| g.as_ref()) {
            Some(g) => Ok(f(g)),
            None => bail!(GovError::NotFound(format!("boost group {}", id.0))),
        }
    }

    pub fn boost(&self, id: GroupId) -> Result<i32> {
        self.with_group(id, |g| g.boost)
    }

    pub fn boost_default(&self, id: GroupId) -> Result<i32> {
        self.with_group(id, |g| g.boost_default)
    }

    // ADMIN WRITE: 0..=100, ALSO BECOMES THE DEFAULT DYNAMIC BOOSTS FALL BACK TO
    pub fn set_boost(&self, id: GroupId, boost: i64, now: u64) -> Result<()> {
        check_range("boost", boost, 0, 100)?;
        let mut reg = lock(&self.registry);
        let Some(g) = reg.get_mut(id.0).and_then(|g| g.as_mut()) else {
            bail!(GovError::NotFound(format!("boost group {}", id.0)));
        };
        g.boost = boost as i32;
        g.boost_default = boost as i32;
        self.boostgroup_update(id.0, boost as i32, now);
        Ok(())
    }

    pub fn prefer_idle(&self, id: GroupId) -> Result<bool> {
        self.with_group(id, |g| g.prefer_idle)
    }

    pub fn set_prefer_idle(&self, id: GroupId, on: bool) -> Result<()> {
        let mut reg = lock(&self.registry);
        let Some(g) = reg.get_mut(id.0).and_then(|g| g.as_mut()) else {
            bail!(GovError::NotFound(format!("boost group {}", id.0)));
        };
        g.prefer_idle = on;
        Ok(())
    }

    pub fn sched_boost(&self, id: GroupId) -> Result<i32> {
        self.with_group(id, |g| g.sched_boost)
    }

    pub fn set_sched_boost(&self, id: GroupId, value: i64) -> Result<()> {
        check_range("sched_boost", value, 0, 100)?;
        let mut reg = lock(&self.registry);
        let Some(g) = reg.get_mut(id.0).and_then(|g| g.as_mut()) else {
            bail!(GovError::NotFound(format!("boost group {}", id.0)));
        };
        g.sched_boost = value as i32;
        Ok(())
    }

    pub fn task_boost(&self, task: &Task) -> i32 {
        self.boost(task.group).unwrap_or(0)
    }

    pub fn task_prefer_idle(&self, task: &Task) -> bool {
        self.prefer_idle(task.group).unwrap_or(false)
    }

    // PUSH A GROUP'S NEW BOOST TO EVERY CPU. CHEAP WHEN IT CAN ONLY RAISE
    // THE CACHED MAX, RESCAN WHEN IT LOWERED THE GROUP THAT WAS THE MAX.
    fn boostgroup_update(&self, idx: usize, boost: i32, now: u64) {
        for bg in &self.cpus {
            let _g = lock(&bg.lock);
            let cur_max = bg.boost_max.load(Ordering::Relaxed);
            let old = bg.group[idx].boost.swap(boost, Ordering::Relaxed);

            if boost > cur_max && bg.group_active(idx, now) {
                bg.boost_max.store(boost, Ordering::Relaxed);
                bg.boost_ts.store(bg.group[idx].ts.load(Ordering::Relaxed), Ordering::Relaxed);
                continue;
            }

            if cur_max == old && old > boost {
                bg.recompute(now);
            }
        }
    }

    // --- TASK ACCOUNTING ---

    fn tasks_update(&self, task: &Task, cpu: usize, delta: i32, now: u64) {
        let Some(bg) = self.cpus.get(cpu) else {
            return;
        };
        let idx = task.group.0;
        if idx >= BOOSTGROUPS_COUNT {
            return;
        }
        let _g = lock(&bg.lock);
        let c = &bg.group[idx];
        let tasks = (c.tasks.load(Ordering::Relaxed) as i64 + delta as i64).max(0) as u32;
        c.tasks.store(tasks, Ordering::Relaxed);

        if delta > 0 {
            if self.update_timestamp(task) {
                c.ts.store(now, Ordering::Relaxed);
            }
            // GROUP JUST BECAME ACTIVE ON THIS CPU
            if tasks == 1 {
                bg.recompute(now);
            }
        } else if tasks == 0 && self.update_timestamp(task) {
            // HOLD RUNS FROM THE MOMENT THE LAST TASK LEFT
            c.ts.store(now, Ordering::Relaxed);
        }
    }

    pub fn enqueue(&self, task: &Task, cpu: usize, now: u64) {
        self.tasks_update(task, cpu, 1, now);
    }

    pub fn dequeue(&self, task: &Task, cpu: usize, now: u64) {
        self.tasks_update(task, cpu, -1, now);
    }

    // REASSIGN A TASK TO ANOTHER GROUP. A RUNNABLE TASK (on_rq = Some(cpu))
    // MOVES ITS COUNT ATOMICALLY UNDER THAT CPU'S LOCK AND INVALIDATES THE
    // CPU'S CACHED MAX.
    pub fn attach(&self, task: &mut Task, dst: GroupId, on_rq: Option<usize>, now: u64) -> Result<()> {
        let reg = lock(&self.registry);
        if reg.get(dst.0).and_then(|g| g.as_ref()).is_none() {
            bail!(GovError::NotFound(format!("boost group {}", dst.0)));
        }
        let src = task.group;
        if src == dst {
            return Ok(());
        }

        if let Some(bg) = on_rq.and_then(|cpu| self.cpus.get(cpu)) {
            let _g = lock(&bg.lock);
            let s = &bg.group[src.0];
            let left = s.tasks.load(Ordering::Relaxed).saturating_sub(1);
            s.tasks.store(left, Ordering::Relaxed);
            if left == 0 && self.update_timestamp(task) {
                s.ts.store(now, Ordering::Relaxed);
            }
            let d = &bg.group[dst.0];
            d.tasks.fetch_add(1, Ordering::Relaxed);
            d.ts.store(now, Ordering::Relaxed);
            bg.boost_ts.store(TS_NONE, Ordering::Relaxed);
        }

        task.group = dst;
        Ok(())
    }

    // SCHEDULER-SIDE MIGRATION: OPTIONAL GROUP CHANGE, THEN CPU CHANGE
    pub fn migrate(&self, task: &mut Task, src_cpu: usize, dst_cpu: usize,
                   dst_group: GroupId, now: u64) -> Result<()> {
        self.attach(task, dst_group, Some(src_cpu), now)?;
        if src_cpu != dst_cpu {
            self.dequeue(task, src_cpu, now);
            self.enqueue(task, dst_cpu, now);
        }
        Ok(())
    }

    pub fn group_tasks(&self, id: GroupId, cpu: usize) -> u32 {
        self.cpus.get(cpu)
            .and_then(|bg| bg.group.get(id.0))
            .map(|c| c.tasks.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // --- HOT READ PATH ---

    // EFFECTIVE BOOST PERCENT ON cpu. LOCK-FREE.
    pub fn cpu_boost(&self, cpu: usize, now: u64) -> i32 {
        let Some(bg) = self.cpus.get(cpu) else {
            return 0;
        };
        if boost_timeout(now, bg.boost_ts.load(Ordering::Relaxed)) {
            bg.recompute(now);
        }
        bg.boost_max.load(Ordering::Relaxed)
    }

    // --- DYNAMIC BOOST SLOTS ---

    fn find_dynamic(reg: &Registry, name: &str) -> Result<usize> {
        (1..BOOSTGROUPS_COUNT)
            .find(|&i| reg[i].as_ref().is_some_and(|g| g.name == name))
            .ok_or_else(|| GovError::NotFound(format!("boost group {}", name)).into())
    }

    // RAISE THE GROUP'S LIVE BOOST WITHOUT TOUCHING boost_default
    fn dynamic_boost(&self, reg: &mut Registry, idx: usize, boost: i32, now: u64) {
        if let Some(g) = reg[idx].as_mut() {
            g.boost = boost;
        }
        self.boostgroup_update(idx, boost, now);
    }

    fn activate(&self, reg: &mut Registry, idx: usize, boost: i32, now: u64) -> Result<usize> {
        let Some(g) = reg[idx].as_mut() else {
            bail!(GovError::NotFound(format!("boost group {}", idx)));
        };
        let Some(slot) = g.available.pop_front() else {
            bail!(GovError::NoSpace("dynamic boost slots"));
        };
        g.slot_boost[slot] = boost;
        g.active.push_back(slot);
        if boost > g.boost {
            self.dynamic_boost(reg, idx, boost, now);
        }
        Ok(slot)
    }

    pub fn do_stune_boost(&self, name: &str, boost: i64, now: u64) -> Result<usize> {
        check_range("boost", boost, 0, 100)?;
        let mut reg = lock(&self.registry);
        let idx = Self::find_dynamic(&reg, name)?;
        self.activate(&mut reg, idx, boost as i32, now)
    }

    pub fn do_stune_sched_boost(&self, name: &str, now: u64) -> Result<usize> {
        let mut reg = lock(&self.registry);
        let idx = Self::find_dynamic(&reg, name)?;
        let boost = reg[idx].as_ref().map(|g| g.sched_boost).unwrap_or(0);
        self.activate(&mut reg, idx, boost, now)
    }

    // RELEASE A SLOT AND FALL BACK TO THE NEXT LARGEST ACTIVE BOOST OR DEFAULT
    pub fn reset_stune_boost(&self, name: &str, slot: usize, now: u64) -> Result<()> {
        let mut reg = lock(&self.registry);
        let idx = Self::find_dynamic(&reg, name)?;
        let Some(g) = reg[idx].as_mut() else {
            bail!(GovError::NotFound(format!("boost group {}", name)));
        };
        let Some(pos) = g.active.iter().position(|&s| s == slot) else {
            bail!(GovError::NotFound(format!("{} boost slot {}", name, slot)));
        };
        g.active.remove(pos);
        g.slot_boost[slot] = 0;
        g.available.push_back(slot);

        let boost = g.max_active_boost();
        if boost != g.boost {
            self.dynamic_boost(&mut reg, idx, boost, now);
        }
        Ok(())
    }

    pub fn active_slots(&self, name: &str) -> Result<Vec<usize>> {
        let reg = lock(&self.registry);
        let idx = Self::find_dynamic(&reg, name)?;
        Ok(reg[idx].as_ref().map(|g| g.active.iter().copied().collect()).unwrap_or_default())
    }
}

// SCHED BOOST SWITCH
// 0/1 KNOB. TURNING IT ON HOLDS A sched_boost SLOT ON THE TARGET GROUP,
// TURNING IT OFF RELEASES IT. WRITING THE CURRENT STATE IS REJECTED.

struct SwitchState {
    value: u32,
    slot: Option<usize>,
}

pub struct SchedBoostSwitch {
    target: String,
    state: Mutex<SwitchState>,
}

impl SchedBoostSwitch {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            state: Mutex::new(SwitchState { value: 0, slot: None }),
        }
    }

    pub fn value(&self) -> u32 {
        lock(&self.state).value
    }

    pub fn set(&self, st: &SchedTune, value: u32, now: u64) -> Result<()> {
        let mut s = lock(&self.state);
        let (from, to) = (s.value != 0, value != 0);
        if from == to {
            bail!(GovError::InvalidTransition { from, to });
        }

        if to {
            s.slot = Some(st.do_stune_sched_boost(&self.target, now)?);
        } else if let Some(slot) = s.slot.take() {
            st.reset_stune_boost(&self.target, slot, now)?;
        }
        s.value = value;
        Ok(())
    }
}
