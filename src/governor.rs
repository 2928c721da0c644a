// SCHEDGOV GOVERNOR
// REGISTRY OF ATTACHED POLICY DOMAINS, THEIR SHARED TUNABLES AND THE
// PER-CPU UPDATE HOOKS.
//
// LIFECYCLE PER POLICY:  init -> start -> (updates, limits) -> stop -> exit
// stop UNREGISTERS THE HOOKS FIRST, THEN FLUSHES IN-FLIGHT COMMITS.
// exit CACHES THE TUNABLES, THEN JOINS THE WORKER.

use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, Result};

use crate::domain::{DomainConfig, PolicyDomain, UpdateFlags};
use crate::driver::FreqDriver;
use crate::error::GovError;
use crate::lock;
use crate::sampler::SchedContext;
use crate::schedtune::{GroupId, Task};
use crate::topology::ClusterClass;
use crate::tuning::Tunables;

#[derive(Clone, Copy, Debug)]
pub struct GovernorConfig {
    // ONE TUNABLES OBJECT PER POLICY INSTEAD OF ONE PER CLUSTER CLASS
    pub per_policy_tunables: bool,
    // RAISE SLOW-SWITCH WORKERS TO SCHED_FIFO
    pub rt_worker: bool,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self { per_policy_tunables: false, rt_worker: true }
    }
}

// SHARED TUNABLES
// THE VALUES AND THE DOMAINS USING THEM, UNDER ONE MUTEX. A STORE
// VALIDATES, COMMITS AND PROPAGATES TO EVERY USER BEFORE RELEASING IT.

struct TunablesInner {
    values: Tunables,
    users: Vec<Arc<PolicyDomain>>,
}

pub struct TunablesSet {
    class: ClusterClass,
    inner: Mutex<TunablesInner>,
}

impl TunablesSet {
    fn new(class: ClusterClass, values: Tunables) -> Self {
        Self { class, inner: Mutex::new(TunablesInner { values, users: Vec::new() }) }
    }

    pub fn class(&self) -> ClusterClass {
        self.class
    }

    pub fn values(&self) -> Tunables {
        lock(&self.inner).values
    }

    pub fn users(&self) -> usize {
        lock(&self.inner).users.len()
    }

    fn attach(&self, domain: Arc<PolicyDomain>) {
        lock(&self.inner).users.push(domain);
    }

    // REMAINING USER COUNT
    fn detach(&self, first_cpu: usize) -> usize {
        let mut inner = lock(&self.inner);
        inner.users.retain(|d| d.first_cpu() != first_cpu);
        inner.users.len()
    }

    fn show(&self, attr: &str) -> Result<String> {
        lock(&self.inner).values.show(attr)
    }

    fn store(&self, attr: &str, text: &str) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.values.store(attr, text)?;
        let values = inner.values;
        for d in &inner.users {
            d.apply_tunables(&values);
        }
        Ok(())
    }

    fn replace(&self, values: Tunables) -> Result<()> {
        values.validate()?;
        let mut inner = lock(&self.inner);
        inner.values = values;
        for d in &inner.users {
            d.apply_tunables(&values);
        }
        Ok(())
    }
}

struct Attached {
    domain: Arc<PolicyDomain>,
    tunables: Arc<TunablesSet>,
    started: bool,
}

#[derive(Default)]
struct Registry {
    policies: Vec<Attached>,
    // SHARED MODE: ONE SET PER CLUSTER CLASS
    shared: Vec<Arc<TunablesSet>>,
    // TUNABLES SURVIVING exit, KEYED BY THE POLICY'S FIRST CPU
    cache: Vec<Option<Tunables>>,
}

impl Registry {
    fn find(&self, first_cpu: usize) -> Result<&Attached> {
        self.policies.iter()
            .find(|a| a.domain.first_cpu() == first_cpu)
            .ok_or_else(|| GovError::NotFound(format!("policy{}", first_cpu)).into())
    }

    fn position(&self, first_cpu: usize) -> Result<usize> {
        self.policies.iter()
            .position(|a| a.domain.first_cpu() == first_cpu)
            .ok_or_else(|| GovError::NotFound(format!("policy{}", first_cpu)).into())
    }
}

pub struct Governor {
    cfg: GovernorConfig,
    ctx: Arc<SchedContext>,
    // UPDATE HOOKS, ONE SLOT PER CPU. READ ON EVERY UPDATE.
    hooks: RwLock<Vec<Option<Arc<PolicyDomain>>>>,
    registry: Mutex<Registry>,
}

impl Governor {
    pub fn new(ctx: Arc<SchedContext>, cfg: GovernorConfig) -> Self {
        let nr = ctx.nr_cpus();
        Self {
            cfg,
            ctx,
            hooks: RwLock::new(vec![None; nr]),
            registry: Mutex::new(Registry { cache: vec![None; nr], ..Default::default() }),
        }
    }

    pub fn ctx(&self) -> &Arc<SchedContext> {
        &self.ctx
    }

    pub fn config(&self) -> GovernorConfig {
        self.cfg
    }

    pub fn policies(&self) -> Vec<usize> {
        lock(&self.registry).policies.iter().map(|a| a.domain.first_cpu()).collect()
    }

    pub fn domain(&self, first_cpu: usize) -> Option<Arc<PolicyDomain>> {
        lock(&self.registry).find(first_cpu).ok().map(|a| Arc::clone(&a.domain))
    }

    // DOMAIN SERVING cpu, WHETHER OR NOT IT IS STARTED
    pub fn domain_of(&self, cpu: usize) -> Option<Arc<PolicyDomain>> {
        lock(&self.registry).policies.iter()
            .find(|a| a.domain.cpus().contains(&cpu))
            .map(|a| Arc::clone(&a.domain))
    }

    // --- LIFECYCLE ---

    // ATTACH A DOMAIN. FAILS WITH Busy IF ANY OF ITS CPUS ALREADY HAS ONE.
    // NOTHING IS REGISTERED UNTIL EVERY PIECE HAS BEEN BUILT.
    pub fn init(&self, cfg: &DomainConfig, driver: Arc<dyn FreqDriver>) -> Result<usize> {
        let Some(first) = cfg.first_cpu() else {
            bail!(GovError::InvalidValue { attr: "cpus".into(), value: "[]".into() });
        };
        let mut reg = lock(&self.registry);

        if let Some(&busy) = cfg.cpus.iter()
            .find(|&&c| reg.policies.iter().any(|a| a.domain.cpus().contains(&c)))
        {
            bail!(GovError::Busy(busy));
        }

        let cached = reg.cache.get(first).copied().flatten();
        let latency = driver.transition_latency_ns();
        let fresh = || Tunables::for_class(cfg.class).scaled_for_latency(latency);

        // TUNABLES: EXISTING SHARED SET, CACHE, OR FRESH DEFAULTS
        let (set, new_set) = match (self.cfg.per_policy_tunables,
                                    reg.shared.iter().find(|s| s.class() == cfg.class)) {
            (false, Some(s)) => (Arc::clone(s), false),
            _ => {
                let values = match cached {
                    Some(t) => {
                        log_info!("policy{}: tunables restored from cache", first);
                        t
                    }
                    None => {
                        let t = fresh();
                        log_info!("policy{}: {} tunables up={}us down={}us",
                                  first, cfg.class.label(), t.up_rate_limit_us, t.down_rate_limit_us);
                        t
                    }
                };
                (Arc::new(TunablesSet::new(cfg.class, values)), true)
            }
        };

        let domain = match PolicyDomain::new(cfg, driver, Arc::clone(&self.ctx),
                                             set.values(), self.cfg.rt_worker) {
            Ok(d) => Arc::new(d),
            Err(e) => {
                // new_set WAS NEVER PUBLISHED: DROPPING IT RELEASES IT
                log_warn!("policy{}: init failed: {:#}", first, e);
                return Err(e);
            }
        };

        set.attach(Arc::clone(&domain));
        if new_set && !self.cfg.per_policy_tunables {
            reg.shared.push(Arc::clone(&set));
        }
        reg.policies.push(Attached { domain: Arc::clone(&domain), tunables: set, started: false });

        log_info!("policy{}: attached cpus {:?} ({} switch)",
                  first, domain.cpus(), if domain.is_fast() { "fast" } else { "slow" });
        Ok(first)
    }

    // RESET DOMAIN STATE, THEN REGISTER ITS UPDATE HOOKS
    pub fn start(&self, first_cpu: usize) -> Result<()> {
        let mut reg = lock(&self.registry);
        let idx = reg.position(first_cpu)?;
        let a = &mut reg.policies[idx];
        if a.started {
            return Ok(());
        }
        a.domain.start();

        let mut hooks = self.hooks.write().unwrap_or_else(|e| e.into_inner());
        for &cpu in a.domain.cpus() {
            hooks[cpu] = Some(Arc::clone(&a.domain));
        }
        a.started = true;
        Ok(())
    }

    // UNREGISTER THE HOOKS, THEN WAIT FOR IN-FLIGHT COMMITS
    pub fn stop(&self, first_cpu: usize) -> Result<()> {
        let domain = {
            let mut reg = lock(&self.registry);
            let idx = reg.position(first_cpu)?;
            let a = &mut reg.policies[idx];
            if !a.started {
                return Ok(());
            }
            a.started = false;
            Arc::clone(&a.domain)
        };

        {
            let mut hooks = self.hooks.write().unwrap_or_else(|e| e.into_inner());
            for &cpu in domain.cpus() {
                hooks[cpu] = None;
            }
        }
        domain.flush();
        Ok(())
    }

    // DETACH. A STARTED DOMAIN IS STOPPED FIRST.
    pub fn exit(&self, first_cpu: usize) -> Result<()> {
        self.stop(first_cpu)?;

        let a = {
            let mut reg = lock(&self.registry);
            let idx = reg.position(first_cpu)?;
            let a = reg.policies.remove(idx);

            let values = a.tunables.values();
            if let Some(slot) = reg.cache.get_mut(first_cpu) {
                *slot = Some(values);
            }
            if a.tunables.detach(first_cpu) == 0 {
                reg.shared.retain(|s| !Arc::ptr_eq(s, &a.tunables));
            }
            a
        };

        a.domain.stop_worker();
        log_info!("policy{}: detached", first_cpu);
        Ok(())
    }

    // STOP AND DETACH EVERY POLICY
    pub fn shutdown(&self) {
        for first in self.policies() {
            if let Err(e) = self.exit(first) {
                log_warn!("policy{}: exit failed: {:#}", first, e);
            }
        }
    }

    pub fn limits(&self, first_cpu: usize, min: u32, max: u32) -> Result<()> {
        let domain = lock(&self.registry).find(first_cpu).map(|a| Arc::clone(&a.domain))?;
        domain.set_limits(min, max)
    }

    // --- HOT PATH ---

    pub fn on_util_update(&self, cpu: usize, now: u64, flags: UpdateFlags) {
        let domain = {
            let hooks = self.hooks.read().unwrap_or_else(|e| e.into_inner());
            match hooks.get(cpu) {
                Some(Some(d)) => Arc::clone(d),
                _ => return,
            }
        };
        domain.update(cpu, now, flags);
    }

    // --- TUNABLES ---

    pub fn show_tunable(&self, first_cpu: usize, attr: &str) -> Result<String> {
        let set = self.tunables_of(first_cpu)?;
        set.show(attr)
    }

    pub fn store_tunable(&self, first_cpu: usize, attr: &str, text: &str) -> Result<()> {
        let set = self.tunables_of(first_cpu)?;
        if let Err(e) = set.store(attr, text) {
            log_warn!("policy{}: rejected {}={:?}: {:#}", first_cpu, attr, text.trim(), e);
            return Err(e);
        }
        Ok(())
    }

    pub fn set_tunables(&self, first_cpu: usize, values: Tunables) -> Result<()> {
        self.tunables_of(first_cpu)?.replace(values)
    }

    pub fn tunables(&self, first_cpu: usize) -> Result<Tunables> {
        Ok(self.tunables_of(first_cpu)?.values())
    }

    // NUMBER OF DOMAINS SHARING first_cpu's TUNABLES
    pub fn tunables_users(&self, first_cpu: usize) -> Result<usize> {
        Ok(self.tunables_of(first_cpu)?.users())
    }

    pub fn cached_tunables(&self, first_cpu: usize) -> Option<Tunables> {
        lock(&self.registry).cache.get(first_cpu).copied().flatten()
    }

    fn tunables_of(&self, first_cpu: usize) -> Result<Arc<TunablesSet>> {
        lock(&self.registry).find(first_cpu).map(|a| Arc::clone(&a.tunables))
    }

    // --- SYSTEM STATE ---

    pub fn set_suspended(&self, suspended: bool) {
        self.ctx.set_suspended(suspended);
        for a in lock(&self.registry).policies.iter() {
            a.domain.set_suspended(suspended);
        }
    }

    // --- TASK EVENTS (BOOST-GROUP ACCOUNTING) ---

    pub fn on_task_enqueue(&self, task: &Task, cpu: usize, now: u64) {
        self.ctx.schedtune().enqueue(task, cpu, now);
    }

    pub fn on_task_dequeue(&self, task: &Task, cpu: usize, now: u64) {
        self.ctx.schedtune().dequeue(task, cpu, now);
    }

    pub fn on_task_migrate(&self, task: &mut Task, src_cpu: usize, dst_cpu: usize,
                           dst_group: GroupId, now: u64) -> Result<()> {
        self.ctx.schedtune().migrate(task, src_cpu, dst_cpu, dst_group, now)
    }
}

impl Drop for Governor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
