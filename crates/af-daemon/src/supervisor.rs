//! The instance set and one polling pass over it.
//!
//! Both the detached daemon and the foreground `af watch` loop drive a
//! [`Supervisor`]; [`PollMode`] captures the two differences between them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use af_agents::instance::{branch_for, Instance, InstanceContext, InstanceOptions};
use af_agents::state_machine::InstanceStatus;
use af_agents::storage::{InstanceRecord, InstanceStore};
use tracing::{debug, info, warn};

use crate::error::{DaemonError, Result};

/// One log line per instance per this interval for repeated failures.
pub const FAILURE_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Headless: auto-accept forced on, diff stats refreshed only after an
    /// auto-accepted prompt.
    Daemon,
    /// Attached: persisted auto-accept flags apply, diff stats refreshed
    /// for every live instance.
    Foreground,
}

impl fmt::Display for PollMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollMode::Daemon => f.write_str("daemon"),
            PollMode::Foreground => f.write_str("foreground"),
        }
    }
}

/// What one [`Supervisor::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub polled: usize,
    pub confirmed: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// LogThrottle
// ---------------------------------------------------------------------------

/// Rate limit for per-key log lines.
#[derive(Debug)]
pub struct LogThrottle {
    every: Duration,
    last: HashMap<String, Instant>,
}

impl LogThrottle {
    pub fn new(every: Duration) -> Self {
        Self {
            every,
            last: HashMap::new(),
        }
    }

    /// Whether `key` may log at `now`; records the attempt when it may.
    pub fn allow(&mut self, key: &str, now: Instant) -> bool {
        match self.last.get(key) {
            Some(prev) if now.duration_since(*prev) < self.every => false,
            _ => {
                self.last.insert(key.to_string(), now);
                true
            }
        }
    }

    pub fn forget(&mut self, key: &str) {
        self.last.remove(key);
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct Supervisor {
    ctx: Arc<InstanceContext>,
    store: InstanceStore,
    mode: PollMode,
    instances: Vec<Instance>,
    /// Persisted auto-accept flags, so a daemon's forced flag never leaks
    /// into the state file.
    persisted_auto_yes: HashMap<String, bool>,
    /// Records that failed to restore. Saved back untouched.
    unrestored: Vec<InstanceRecord>,
    throttle: LogThrottle,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("mode", &self.mode)
            .field("instances", &self.instances)
            .field("unrestored", &self.unrestored.len())
            .finish()
    }
}

impl Supervisor {
    /// Load every persisted instance and reattach to its worktree and session.
    ///
    /// A corrupt state file is fatal. An instance that fails to restore is
    /// logged and kept on disk as-is.
    pub fn load(ctx: Arc<InstanceContext>, store: InstanceStore, mode: PollMode) -> Result<Self> {
        let records = store.load()?;
        let mut instances = Vec::with_capacity(records.len());
        let mut persisted_auto_yes = HashMap::new();
        let mut unrestored = Vec::new();

        for record in records {
            let title = record.title.clone();
            let auto_yes = record.auto_yes;
            match Instance::from_record(record.clone(), Arc::clone(&ctx)) {
                Ok(mut inst) => {
                    if mode == PollMode::Daemon {
                        inst.set_auto_yes(true);
                    }
                    persisted_auto_yes.insert(title, auto_yes);
                    instances.push(inst);
                }
                Err(e) => {
                    warn!(title = %title, error = %e, class = %e.class(), "failed to restore instance");
                    unrestored.push(record);
                }
            }
        }

        info!(
            mode = %mode,
            restored = instances.len(),
            unrestored = unrestored.len(),
            "instances loaded"
        );
        Ok(Self {
            ctx,
            store,
            mode,
            instances,
            persisted_auto_yes,
            unrestored,
            throttle: LogThrottle::new(FAILURE_LOG_INTERVAL),
        })
    }

    pub fn mode(&self) -> PollMode {
        self.mode
    }

    pub fn store(&self) -> &InstanceStore {
        &self.store
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn unrestored(&self) -> &[InstanceRecord] {
        &self.unrestored
    }

    pub fn get(&self, title: &str) -> Result<&Instance> {
        self.instances
            .iter()
            .find(|i| i.title() == title)
            .ok_or_else(|| DaemonError::UnknownInstance(title.to_string()))
    }

    pub fn get_mut(&mut self, title: &str) -> Result<&mut Instance> {
        self.instances
            .iter_mut()
            .find(|i| i.title() == title)
            .ok_or_else(|| DaemonError::UnknownInstance(title.to_string()))
    }

    /// Create, start and persist a new instance, optionally typing an
    /// initial prompt into it.
    ///
    /// Once started, the instance belongs to the set even if persisting it
    /// or sending the prompt fails, so a later [`save`](Self::save) keeps it.
    pub fn create(&mut self, opts: InstanceOptions, prompt: Option<&str>) -> Result<&Instance> {
        let branch = branch_for(&self.ctx.branch_prefix, &opts.title);
        self.store.check_available(&opts.title, &branch)?;

        let mut inst = Instance::new(opts, Arc::clone(&self.ctx))?;
        inst.start()?;
        self.persisted_auto_yes
            .insert(inst.title().to_string(), inst.auto_yes());
        self.instances.push(inst);
        let idx = self.instances.len() - 1;

        let inst = &self.instances[idx];
        self.store.upsert(inst.to_record())?;
        if let Some(text) = prompt.filter(|t| !t.trim().is_empty()) {
            if let Err(e) = inst.send_prompt(text) {
                warn!(title = %inst.title(), error = %e, "instance started but the initial prompt was not sent");
                return Err(e.into());
            }
        }
        Ok(&self.instances[idx])
    }

    /// Kill `title` and forget it. The instance stays in the set if the
    /// kill is refused or fails, so it can be retried.
    pub fn kill(&mut self, title: &str) -> Result<()> {
        let idx = self
            .instances
            .iter()
            .position(|i| i.title() == title)
            .ok_or_else(|| DaemonError::UnknownInstance(title.to_string()))?;
        self.instances[idx].kill(&self.store)?;
        self.instances.remove(idx);
        self.persisted_auto_yes.remove(title);
        self.throttle.forget(title);
        Ok(())
    }

    /// Poll every live instance once, in order.
    pub fn tick(&mut self) -> TickReport {
        let Self {
            instances,
            throttle,
            mode,
            ..
        } = self;
        let now = Instant::now();
        let mut report = TickReport::default();

        for inst in instances.iter_mut() {
            if !matches!(inst.status(), InstanceStatus::Running | InstanceStatus::Ready) {
                continue;
            }
            report.polled += 1;

            let decision = match inst.poll() {
                Ok(decision) => decision,
                Err(e) => {
                    report.failed += 1;
                    if throttle.allow(inst.title(), now) {
                        warn!(title = %inst.title(), error = %e, "poll failed");
                    }
                    continue;
                }
            };
            if decision.inject_confirm {
                report.confirmed += 1;
            }

            let refresh = match mode {
                PollMode::Daemon => decision.inject_confirm,
                PollMode::Foreground => true,
            };
            if refresh {
                if let Err(e) = inst.update_diff_stats() {
                    report.failed += 1;
                    if throttle.allow(inst.title(), now) {
                        warn!(title = %inst.title(), error = %e, "diff stats failed");
                    }
                }
            }
        }

        debug!(
            polled = report.polled,
            confirmed = report.confirmed,
            failed = report.failed,
            "tick"
        );
        report
    }

    /// Persist the whole set, restored instances first.
    pub fn save(&self) -> Result<()> {
        let mut records: Vec<InstanceRecord> = self
            .instances
            .iter()
            .map(|inst| {
                let mut record = inst.to_record();
                if let Some(flag) = self.persisted_auto_yes.get(inst.title()) {
                    record.auto_yes = *flag;
                }
                record
            })
            .collect();
        records.extend(self.unrestored.iter().cloned());
        self.store.save(&records)?;
        debug!(count = records.len(), "instances saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_allows_one_line_per_interval() {
        let mut t = LogThrottle::new(Duration::from_secs(60));
        let start = Instant::now();

        assert!(t.allow("a", start));
        assert!(!t.allow("a", start + Duration::from_secs(59)));
        assert!(t.allow("b", start + Duration::from_secs(1)));
        assert!(t.allow("a", start + Duration::from_secs(60)));
    }

    #[test]
    fn forgotten_keys_log_again() {
        let mut t = LogThrottle::new(Duration::from_secs(60));
        let now = Instant::now();
        assert!(t.allow("a", now));
        t.forget("a");
        assert!(t.allow("a", now));
    }
}
