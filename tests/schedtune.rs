// SCHEDGOV SCHEDTUNE TESTS
// HOLD WINDOW AFTER DEQUEUE, DYNAMIC BOOST SLOTS, SCHED BOOST SWITCH,
// REGISTRY RULES, ATTACH / MIGRATE ACCOUNTING

use schedgov::error::GovError;
use schedgov::schedtune::{
    SchedBoostSwitch, SchedTune, Task, DYNAMIC_BOOST_SLOTS_COUNT, ROOT_GROUP,
    SCHEDTUNE_BOOST_HOLD_NS, TOP_APP,
};

const MS: u64 = 1_000_000;

fn gov_err(e: &anyhow::Error) -> Option<&GovError> {
    e.downcast_ref::<GovError>()
}

// === HOLD WINDOW ===

#[test]
fn boost_outlives_dequeue_by_hold_window() {
    let st = SchedTune::new(4);
    let g = st.create(ROOT_GROUP, "g").unwrap();
    let h = st.create(ROOT_GROUP, "h").unwrap();
    st.set_boost(g, 50, 0).unwrap();
    st.set_boost(h, 20, 0).unwrap();

    st.enqueue(&Task::new(1, h), 3, 90 * MS);
    let t = Task::new(2, g);
    st.enqueue(&t, 3, 100 * MS);
    assert_eq!(st.cpu_boost(3, 100 * MS), 50);

    let left = 110 * MS;
    st.dequeue(&t, 3, left);
    assert_eq!(st.cpu_boost(3, left), 50);
    assert_eq!(st.cpu_boost(3, left + SCHEDTUNE_BOOST_HOLD_NS), 50);

    // HOLD RUNS FROM THE DEQUEUE, NOT FROM THE ENQUEUE
    assert_eq!(st.cpu_boost(3, 155 * MS), 50);

    // THEN THE NEXT-HIGHEST ACTIVE GROUP
    assert_eq!(st.cpu_boost(3, left + SCHEDTUNE_BOOST_HOLD_NS + 1), 20);
}

#[test]
fn boost_falls_to_zero_with_no_other_group() {
    let st = SchedTune::new(1);
    let g = st.create(ROOT_GROUP, "g").unwrap();
    st.set_boost(g, 50, 0).unwrap();
    let t = Task::new(1, g);
    st.enqueue(&t, 0, 10 * MS);
    st.dequeue(&t, 0, 20 * MS);
    assert_eq!(st.cpu_boost(0, 20 * MS + SCHEDTUNE_BOOST_HOLD_NS), 50);
    assert_eq!(st.cpu_boost(0, 20 * MS + SCHEDTUNE_BOOST_HOLD_NS + 1), 0);
}

#[test]
fn rt_only_hold_drops_normal_tasks_immediately() {
    let st = SchedTune::new(1);
    st.set_hold_all(false);
    let g = st.create(ROOT_GROUP, "g").unwrap();
    st.set_boost(g, 40, 0).unwrap();

    let normal = Task::new(1, g);
    st.enqueue(&normal, 0, 10 * MS);
    assert_eq!(st.cpu_boost(0, 10 * MS), 40);
    st.dequeue(&normal, 0, 11 * MS);
    assert_eq!(st.cpu_boost(0, 11 * MS), 0);

    let rt = Task::rt(2, g);
    st.enqueue(&rt, 0, 20 * MS);
    st.dequeue(&rt, 0, 21 * MS);
    assert_eq!(st.cpu_boost(0, 30 * MS), 40);
}

// === DYNAMIC SLOTS ===

#[test]
fn dynamic_slots_fall_back_to_next_largest() {
    let st = SchedTune::new(1);
    let g = st.create(ROOT_GROUP, "fg").unwrap();
    st.set_boost(g, 10, 0).unwrap();
    st.enqueue(&Task::new(1, g), 0, 0);
    assert_eq!(st.cpu_boost(0, 0), 10);

    let s30 = st.do_stune_boost("fg", 30, 0).unwrap();
    let s60 = st.do_stune_boost("fg", 60, 0).unwrap();
    assert_eq!(st.boost(g).unwrap(), 60);
    assert_eq!(st.cpu_boost(0, 0), 60);
    assert_eq!(st.active_slots("fg").unwrap(), vec![s30, s60]);

    // A LOWER REQUEST NEVER LOWERS THE LIVE BOOST
    let s5 = st.do_stune_boost("fg", 5, 0).unwrap();
    assert_eq!(st.boost(g).unwrap(), 60);

    st.reset_stune_boost("fg", s60, 0).unwrap();
    assert_eq!(st.boost(g).unwrap(), 30);
    assert_eq!(st.cpu_boost(0, 0), 30);

    st.reset_stune_boost("fg", s30, 0).unwrap();
    st.reset_stune_boost("fg", s5, 0).unwrap();
    assert_eq!(st.boost(g).unwrap(), 10);
    assert_eq!(st.boost_default(g).unwrap(), 10);
    assert_eq!(st.cpu_boost(0, 0), 10);
}

#[test]
fn dynamic_slots_are_bounded() {
    let st = SchedTune::new(1);
    st.create(ROOT_GROUP, "fg").unwrap();
    for _ in 0..DYNAMIC_BOOST_SLOTS_COUNT {
        st.do_stune_boost("fg", 20, 0).unwrap();
    }
    let err = st.do_stune_boost("fg", 20, 0).unwrap_err();
    assert_eq!(gov_err(&err), Some(&GovError::NoSpace("dynamic boost slots")));
}

#[test]
fn dynamic_boost_on_unknown_group() {
    let st = SchedTune::new(1);
    assert!(matches!(gov_err(&st.do_stune_boost("nope", 10, 0).unwrap_err()),
                     Some(GovError::NotFound(_))));
    st.create(ROOT_GROUP, "fg").unwrap();
    assert!(st.reset_stune_boost("fg", 0, 0).is_err());
    assert!(st.do_stune_boost("fg", 101, 0).is_err());
}

// === SCHED BOOST SWITCH ===

#[test]
fn switch_holds_one_slot_while_on() {
    let st = SchedTune::new(1);
    let g = st.create(ROOT_GROUP, TOP_APP).unwrap();
    st.set_boost(g, 10, 0).unwrap();
    st.set_sched_boost(g, 40).unwrap();
    assert!(st.set_sched_boost(g, 101).is_err());
    assert_eq!(st.sched_boost(g).unwrap(), 40);

    let sw = SchedBoostSwitch::new(TOP_APP);
    sw.set(&st, 1, 0).unwrap();
    assert_eq!(st.active_slots(TOP_APP).unwrap().len(), 1);
    assert_eq!(st.boost(g).unwrap(), 40);

    sw.set(&st, 0, 0).unwrap();
    assert!(st.active_slots(TOP_APP).unwrap().is_empty());
    assert_eq!(st.boost(g).unwrap(), 10);
}

// === REGISTRY ===

#[test]
fn registry_rules() {
    let st = SchedTune::new(1);
    let g = st.create(ROOT_GROUP, "fg").unwrap();
    let err = st.create(ROOT_GROUP, "fg").unwrap_err();
    assert_eq!(gov_err(&err), Some(&GovError::AlreadyExists("fg".into())));
    assert!(st.create(ROOT_GROUP, "").is_err());

    let t = Task::new(1, g);
    st.enqueue(&t, 0, 0);
    let err = st.destroy(g, 0).unwrap_err();
    assert_eq!(gov_err(&err), Some(&GovError::InUse("fg".into())));

    st.dequeue(&t, 0, 0);
    st.destroy(g, 0).unwrap();
    assert!(st.boost(g).is_err());

    // THE FREED INDEX IS REUSED
    assert_eq!(st.create(ROOT_GROUP, "bg").unwrap(), g);
    assert_eq!(st.name(g).unwrap(), "bg");
    assert_eq!(st.groups().len(), 2);
}

#[test]
fn prefer_idle_is_per_group() {
    let st = SchedTune::new(1);
    let g = st.create(ROOT_GROUP, "fg").unwrap();
    st.set_prefer_idle(g, true).unwrap();
    assert!(st.task_prefer_idle(&Task::new(1, g)));
    assert!(!st.task_prefer_idle(&Task::new(2, ROOT_GROUP)));
}

// === ATTACH / MIGRATE ===

#[test]
fn attach_moves_runnable_count() {
    let st = SchedTune::new(1);
    let a = st.create(ROOT_GROUP, "a").unwrap();
    let b = st.create(ROOT_GROUP, "b").unwrap();
    st.set_boost(a, 40, 0).unwrap();
    st.set_boost(b, 10, 0).unwrap();

    let mut t = Task::new(1, a);
    st.enqueue(&t, 0, 90 * MS);
    st.attach(&mut t, b, Some(0), 100 * MS).unwrap();
    assert_eq!(t.group, b);
    assert_eq!((st.group_tasks(a, 0), st.group_tasks(b, 0)), (0, 1));

    // THE OLD GROUP IS HELD, THEN THE NEW ONE TAKES OVER
    assert_eq!(st.cpu_boost(0, 100 * MS), 40);
    assert_eq!(st.cpu_boost(0, 100 * MS + SCHEDTUNE_BOOST_HOLD_NS + 1), 10);
    assert_eq!(st.task_boost(&t), 10);
}

#[test]
fn attach_sleeping_task_touches_no_counters() {
    let st = SchedTune::new(1);
    let a = st.create(ROOT_GROUP, "a").unwrap();
    let mut t = Task::new(1, ROOT_GROUP);
    st.attach(&mut t, a, None, 0).unwrap();
    assert_eq!(t.group, a);
    assert_eq!(st.group_tasks(a, 0), 0);
}

#[test]
fn migrate_follows_task_to_new_cpu() {
    let st = SchedTune::new(2);
    let a = st.create(ROOT_GROUP, "a").unwrap();
    st.set_boost(a, 40, 0).unwrap();
    let mut t = Task::new(1, a);
    st.enqueue(&t, 0, 0);

    st.migrate(&mut t, 0, 1, a, 10 * MS).unwrap();
    assert_eq!((st.group_tasks(a, 0), st.group_tasks(a, 1)), (0, 1));
    assert_eq!(st.cpu_boost(1, 10 * MS), 40);
    assert_eq!(st.cpu_boost(0, 10 * MS + SCHEDTUNE_BOOST_HOLD_NS + 1), 0);
}
