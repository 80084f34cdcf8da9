//! Ordered job queue with dependency-aware, single-active-job scheduling.
//!
//! The manager owns every [`Job`]. It is not thread-safe on purpose: the engine
//! loop is its only caller, and everything asynchronous reaches it as a
//! [`JobSignal`]. Commands that cannot be applied immediately (pausing a job
//! that is still writing, deleting a job that is being aborted) are recorded as
//! tickets and retried after every step until the job reaches a state where
//! they are legal.

use crate::events::{JobEvent, ServerEvent};
use crate::job::{Job, JobEnvironment, JobError};
use crate::jobs::{DependenciesState, EncodingPreset, JobProperties, JobState};
use crate::signal::JobSignal;
use crate::store::{SettingsStore, StoreError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("Job {id} cannot be changed while it is {state}")]
    NotModifiable { id: Uuid, state: JobState },

    #[error("Job {id} is paused, its {field} cannot change until it is reset")]
    LockedWhilePaused { id: Uuid, field: &'static str },

    #[error("A job with id {0} already exists")]
    DuplicateId(Uuid),

    #[error("Job {0} cannot depend on itself")]
    SelfDependency(Uuid),

    #[error("Job {id} depends on unknown job {dependency}")]
    UnknownDependency { id: Uuid, dependency: Uuid },

    #[error("Dependencies of job {0} would form a cycle")]
    DependencyCycle(Uuid),

    #[error("Cannot load jobs while jobs are active")]
    ActiveJobsPresent,

    #[error("Preset '{0}' not found")]
    PresetNotFound(String),

    #[error("Preset name must not be empty")]
    EmptyPresetName,

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Transition a ticket is waiting to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TicketAction {
    /// Reschedule the queue once the job has settled.
    Run,
    /// Resume this paused job as soon as no other job is active.
    RunNext,
    Pause,
    Abort,
    Nothing,
}

/// What happens to the job once its ticket has nothing left to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum FollowUp {
    Nothing,
    Reset,
    Delete,
}

#[derive(Debug, Clone, Copy)]
struct JobTicket {
    job_id: Uuid,
    want: TicketAction,
    when_done: FollowUp,
}

pub struct JobsManager {
    jobs: Vec<Job>,
    env: JobEnvironment,
    store: Arc<dyn SettingsStore>,
    tickets: Vec<JobTicket>,
    presets: Vec<EncodingPreset>,
    events: Vec<ServerEvent>,
    dirty: bool,
    reschedule: bool,
}

impl JobsManager {
    pub fn new(env: JobEnvironment, store: Arc<dyn SettingsStore>) -> Self {
        Self {
            jobs: Vec::new(),
            env,
            store,
            tickets: Vec::new(),
            presets: Vec::new(),
            events: Vec::new(),
            dirty: false,
            reschedule: false,
        }
    }

    // --- queries ---

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn jobs_info(&self) -> Vec<JobProperties> {
        self.jobs.iter().map(|j| j.properties().clone()).collect()
    }

    pub fn job(&self, id: Uuid) -> Option<&JobProperties> {
        self.jobs
            .iter()
            .find(|j| j.id() == id)
            .map(|j| j.properties())
    }

    pub fn index_of(&self, id: Uuid) -> Option<usize> {
        self.jobs.iter().position(|j| j.id() == id)
    }

    /// Whether some job occupies the execution slot. Paused jobs do not.
    pub fn has_active_job(&self) -> bool {
        self.jobs.iter().any(|j| j.state().is_active())
    }

    /// Whether every job is in a state that needs no further signals.
    pub fn is_idle(&self) -> bool {
        !self.has_active_job()
    }

    /// Events produced since the last call, in mutation order.
    pub fn take_events(&mut self) -> Vec<ServerEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Aggregate state of the dependencies of the job at `index`.
    ///
    /// A dependency that no longer exists counts as failed.
    pub fn dependencies_state(&self, index: usize) -> DependenciesState {
        let Some(job) = self.jobs.get(index) else {
            return DependenciesState::Complete;
        };
        let mut incomplete = false;
        for dep in job.depends_on() {
            match self.jobs.iter().find(|j| j.id() == *dep).map(Job::state) {
                None => return DependenciesState::Failed,
                Some(JobState::Completed) => {}
                Some(state) if state.blocks_dependents() => return DependenciesState::Failed,
                Some(_) => incomplete = true,
            }
        }
        if incomplete {
            DependenciesState::Incomplete
        } else {
            DependenciesState::Complete
        }
    }

    // --- queue edits ---

    /// Append a job to the queue and return its stored properties.
    pub fn create_job(&mut self, props: JobProperties) -> Result<JobProperties, ManagerError> {
        let mut props = props.normalized_for_load();
        if props.id.is_nil() {
            props.id = Uuid::new_v4();
        }
        if self.index_of(props.id).is_some() {
            return Err(ManagerError::DuplicateId(props.id));
        }
        props.depends_on_job_ids = dedup(&props.depends_on_job_ids);
        self.validate_dependencies(props.id, &props.depends_on_job_ids)?;
        if props.job_state == JobState::Waiting {
            props.frames_processed = 0;
            props.frames_total = props.configured_frames_total().unwrap_or(0);
        }

        info!(job_id = %props.id, job_type = %props.job_type, "Job created");
        let job = Job::new(props, self.env.clone());
        let snapshot = job.properties().clone();
        self.jobs.push(job);
        self.events.push(ServerEvent::JobCreated {
            index: self.jobs.len() - 1,
            job: snapshot.clone(),
        });
        self.dirty = true;
        Ok(snapshot)
    }

    /// Replace the settings of an existing job.
    pub fn change_job(&mut self, props: JobProperties) -> Result<(), ManagerError> {
        let index = self
            .index_of(props.id)
            .ok_or(ManagerError::JobNotFound(props.id))?;
        let state = self.jobs[index].state();
        if !state.is_modifiable() {
            return Err(ManagerError::NotModifiable {
                id: props.id,
                state,
            });
        }
        if let Some(field) = self.jobs[index].locked_setting_change(&props) {
            return Err(ManagerError::LockedWhilePaused { id: props.id, field });
        }
        let mut props = props;
        props.depends_on_job_ids = dedup(&props.depends_on_job_ids);
        self.validate_dependencies(props.id, &props.depends_on_job_ids)?;

        let job = &mut self.jobs[index];
        job.apply_settings(&props);
        debug!(job_id = %props.id, "Job changed");
        self.events.push(ServerEvent::JobChanged {
            index,
            job: job.properties().clone(),
        });
        self.dirty = true;
        Ok(())
    }

    /// Exchange the queue positions of two jobs.
    pub fn swap_jobs(&mut self, first: Uuid, second: Uuid) -> Result<(), ManagerError> {
        let a = self
            .index_of(first)
            .ok_or(ManagerError::JobNotFound(first))?;
        let b = self
            .index_of(second)
            .ok_or(ManagerError::JobNotFound(second))?;
        self.jobs.swap(a, b);
        self.events.push(ServerEvent::JobsSwapped { first, second });
        self.dirty = true;
        Ok(())
    }

    /// Delete jobs; running or paused ones are aborted first.
    pub fn delete_jobs(&mut self, ids: &[Uuid]) -> Result<(), ManagerError> {
        self.require_all(ids)?;
        let mut immediate = Vec::new();
        for id in dedup(ids) {
            if self.needs_abort(id) {
                self.push_ticket(id, TicketAction::Abort, FollowUp::Delete);
            } else {
                immediate.push(id);
            }
        }
        self.remove_jobs(&immediate);
        self.settle();
        Ok(())
    }

    /// Return jobs to `Waiting`; running or paused ones are aborted first.
    pub fn reset_jobs(&mut self, ids: &[Uuid]) -> Result<(), ManagerError> {
        self.require_all(ids)?;
        for id in dedup(ids) {
            if self.needs_abort(id) {
                self.push_ticket(id, TicketAction::Abort, FollowUp::Reset);
                continue;
            }
            if let Some(index) = self.index_of(id) {
                if let Err(e) = self.jobs[index].reset() {
                    // transitional jobs settle on their own, retry then
                    debug!(job_id = %id, error = %e, "Reset deferred");
                    self.push_ticket(id, TicketAction::Nothing, FollowUp::Reset);
                }
            }
        }
        self.settle();
        Ok(())
    }

    // --- scheduling ---

    /// Start the first eligible waiting job.
    pub fn start_waiting_jobs(&mut self) {
        if let Some(job) = self.jobs.iter().find(|j| j.state().is_transitional()) {
            // the slot is about to free up
            let id = job.id();
            self.push_ticket(id, TicketAction::Run, FollowUp::Nothing);
        }
        self.start_first_ready_job(0);
        self.settle();
    }

    /// Scan the queue from `from` and start at most one job.
    ///
    /// Waiting jobs whose dependencies can no longer complete are marked
    /// `DependencyNotMet` on the way.
    pub fn start_first_ready_job(&mut self, from: usize) {
        if self.has_active_job() {
            return;
        }
        for index in from..self.jobs.len() {
            if self.jobs[index].state() != JobState::Waiting {
                continue;
            }
            match self.dependencies_state(index) {
                DependenciesState::Complete => {
                    if let Err(e) = self.jobs[index].start() {
                        warn!(job_id = %self.jobs[index].id(), error = %e, "Failed to start job");
                    }
                    self.collect_events();
                    return;
                }
                DependenciesState::Failed => {
                    self.jobs[index].set_dependency_not_met();
                }
                DependenciesState::Incomplete => {}
            }
        }
        self.collect_events();
    }

    pub fn abort_active_jobs(&mut self) {
        for ticket in &mut self.tickets {
            if matches!(ticket.want, TicketAction::Run | TicketAction::RunNext) {
                ticket.want = TicketAction::Nothing;
            }
        }
        let ids: Vec<Uuid> = self
            .jobs
            .iter()
            .filter(|j| j.state().is_active() || j.state() == JobState::Paused)
            .map(Job::id)
            .collect();
        for id in ids {
            self.push_ticket(id, TicketAction::Abort, FollowUp::Nothing);
        }
        self.settle();
    }

    pub fn pause_active_jobs(&mut self) {
        for ticket in &mut self.tickets {
            if ticket.want == TicketAction::RunNext {
                ticket.want = TicketAction::Nothing;
            }
        }
        let ids: Vec<Uuid> = self
            .jobs
            .iter()
            .filter(|j| j.state() == JobState::Running)
            .map(Job::id)
            .collect();
        for id in ids {
            self.push_ticket(id, TicketAction::Pause, FollowUp::Nothing);
        }
        self.settle();
    }

    /// Queue every paused job for resumption, in queue order.
    pub fn resume_paused_jobs(&mut self) {
        let ids: Vec<Uuid> = self
            .jobs
            .iter()
            .filter(|j| matches!(j.state(), JobState::Paused | JobState::Pausing))
            .map(Job::id)
            .collect();
        for id in ids {
            self.push_ticket(id, TicketAction::RunNext, FollowUp::Nothing);
        }
        self.settle();
    }

    /// Route an asynchronous result to its job and react to the outcome.
    pub fn handle_signal(&mut self, signal: JobSignal) {
        match self.jobs.iter_mut().find(|j| j.id() == signal.job_id) {
            Some(job) => job.handle_signal(signal.run, signal.kind),
            None => {
                debug!(job_id = %signal.job_id, "Signal for a deleted job");
                return;
            }
        }
        self.settle();
    }

    /// Drain job outboxes, apply tickets and reschedule until nothing changes.
    pub fn settle(&mut self) {
        loop {
            self.collect_events();
            self.process_tickets();
            self.collect_events();
            if !std::mem::take(&mut self.reschedule) {
                break;
            }
            self.start_first_ready_job(0);
        }
    }

    // --- persistence ---

    pub fn save_jobs(&mut self) -> Result<(), ManagerError> {
        self.store.save_jobs(&self.jobs_info())?;
        self.dirty = false;
        Ok(())
    }

    /// Replace the queue with the persisted job list.
    ///
    /// Interrupted states are normalized, duplicate ids skipped, unknown and
    /// self dependencies dropped, and jobs on a dependency cycle lose their
    /// dependencies.
    pub fn load_jobs(&mut self) -> Result<usize, ManagerError> {
        if self.has_active_job() {
            return Err(ManagerError::ActiveJobsPresent);
        }
        let loaded = self.store.load_jobs()?;

        let mut seen = HashSet::new();
        let mut props: Vec<JobProperties> = Vec::with_capacity(loaded.len());
        for p in loaded {
            let mut p = p.normalized_for_load();
            if p.id.is_nil() {
                p.id = Uuid::new_v4();
            }
            if !seen.insert(p.id) {
                warn!(job_id = %p.id, "Skipping job with duplicate id");
                continue;
            }
            props.push(p);
        }

        for p in &mut props {
            let id = p.id;
            let before = p.depends_on_job_ids.len();
            let kept: Vec<Uuid> = dedup(&p.depends_on_job_ids)
                .into_iter()
                .filter(|dep| *dep != id && seen.contains(dep))
                .collect();
            if kept.len() != before {
                warn!(job_id = %id, dropped = before - kept.len(), "Dropped invalid dependencies");
            }
            p.depends_on_job_ids = kept;
        }

        let graph: HashMap<Uuid, Vec<Uuid>> = props
            .iter()
            .map(|p| (p.id, p.depends_on_job_ids.clone()))
            .collect();
        for p in &mut props {
            if !p.depends_on_job_ids.is_empty() && reaches(&graph, &p.depends_on_job_ids, p.id) {
                warn!(job_id = %p.id, "Job is on a dependency cycle, clearing its dependencies");
                p.depends_on_job_ids.clear();
            }
        }

        self.tickets.clear();
        self.jobs = props
            .into_iter()
            .map(|p| Job::new(p, self.env.clone()))
            .collect();
        self.dirty = false;
        info!(jobs = self.jobs.len(), "Jobs loaded");
        Ok(self.jobs.len())
    }

    pub fn presets(&self) -> &[EncodingPreset] {
        &self.presets
    }

    pub fn load_presets(&mut self) -> Result<usize, ManagerError> {
        self.presets = self.store.load_presets()?;
        Ok(self.presets.len())
    }

    /// Add a preset or replace the one with the same name.
    pub fn save_preset(&mut self, preset: EncodingPreset) -> Result<(), ManagerError> {
        if preset.name.trim().is_empty() {
            return Err(ManagerError::EmptyPresetName);
        }
        match self.presets.iter_mut().find(|p| p.name == preset.name) {
            Some(existing) => *existing = preset,
            None => self.presets.push(preset),
        }
        self.store.save_presets(&self.presets)?;
        Ok(())
    }

    pub fn delete_preset(&mut self, name: &str) -> Result<(), ManagerError> {
        let index = self
            .presets
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| ManagerError::PresetNotFound(name.to_string()))?;
        self.presets.remove(index);
        self.store.save_presets(&self.presets)?;
        Ok(())
    }

    // --- internals ---

    fn require_all(&self, ids: &[Uuid]) -> Result<(), ManagerError> {
        match ids.iter().find(|id| self.index_of(**id).is_none()) {
            Some(id) => Err(ManagerError::JobNotFound(*id)),
            None => Ok(()),
        }
    }

    fn needs_abort(&self, id: Uuid) -> bool {
        self.job(id)
            .map(|p| p.job_state.is_active() || p.job_state == JobState::Paused)
            .unwrap_or(false)
    }

    fn validate_dependencies(&self, id: Uuid, deps: &[Uuid]) -> Result<(), ManagerError> {
        for dep in deps {
            if *dep == id {
                return Err(ManagerError::SelfDependency(id));
            }
            if self.index_of(*dep).is_none() {
                return Err(ManagerError::UnknownDependency {
                    id,
                    dependency: *dep,
                });
            }
        }
        let graph: HashMap<Uuid, Vec<Uuid>> = self
            .jobs
            .iter()
            .filter(|j| j.id() != id)
            .map(|j| (j.id(), j.depends_on().to_vec()))
            .collect();
        if reaches(&graph, deps, id) {
            return Err(ManagerError::DependencyCycle(id));
        }
        Ok(())
    }

    /// At most one ticket per job; a new request replaces the pending
    /// action and keeps the stronger follow-up.
    fn push_ticket(&mut self, job_id: Uuid, want: TicketAction, when_done: FollowUp) {
        match self.tickets.iter_mut().find(|t| t.job_id == job_id) {
            Some(ticket) => {
                ticket.want = want;
                ticket.when_done = ticket.when_done.max(when_done);
            }
            None => self.tickets.push(JobTicket {
                job_id,
                want,
                when_done,
            }),
        }
    }

    fn process_tickets(&mut self) {
        let mut i = 0;
        while i < self.tickets.len() {
            let ticket = self.tickets[i];
            let Some(index) = self.index_of(ticket.job_id) else {
                self.tickets.remove(i);
                continue;
            };

            let state = self.jobs[index].state();
            let want = match ticket.want {
                TicketAction::Abort => {
                    self.jobs[index].abort();
                    TicketAction::Nothing
                }
                TicketAction::Pause if state == JobState::Running => {
                    if let Err(e) = self.jobs[index].pause() {
                        warn!(job_id = %ticket.job_id, error = %e, "Cannot pause job");
                    }
                    TicketAction::Nothing
                }
                TicketAction::RunNext if state == JobState::Paused => {
                    if self.has_active_job() {
                        TicketAction::RunNext
                    } else {
                        self.resume_paused(index);
                        TicketAction::Nothing
                    }
                }
                TicketAction::Run if !state.is_transitional() => {
                    self.reschedule = true;
                    TicketAction::Nothing
                }
                other if state.is_transitional() => other,
                _ => TicketAction::Nothing,
            };
            self.tickets[i].want = want;
            self.collect_events();

            if want != TicketAction::Nothing || self.jobs[index].state().is_transitional() {
                i += 1;
                continue;
            }

            self.tickets.remove(i);
            match ticket.when_done {
                FollowUp::Nothing => {}
                FollowUp::Reset => {
                    if let Err(e) = self.jobs[index].reset() {
                        warn!(job_id = %ticket.job_id, error = %e, "Cannot reset job");
                    }
                    self.collect_events();
                }
                FollowUp::Delete => self.remove_jobs(&[ticket.job_id]),
            }
        }
    }

    /// Resume a paused job whose dependencies allow it to run.
    fn resume_paused(&mut self, index: usize) {
        let id = self.jobs[index].id();
        match self.dependencies_state(index) {
            DependenciesState::Complete => {
                if let Err(e) = self.jobs[index].start() {
                    warn!(job_id = %id, error = %e, "Cannot resume job");
                }
            }
            DependenciesState::Incomplete => {
                info!(job_id = %id, "Dependencies not complete, job stays paused");
            }
            DependenciesState::Failed => {
                warn!(job_id = %id, "Dependency failed, aborting paused job");
                self.jobs[index].abort();
            }
        }
    }

    /// Remove jobs and detach them from every dependent.
    fn remove_jobs(&mut self, ids: &[Uuid]) {
        if ids.is_empty() {
            return;
        }
        let doomed: HashSet<Uuid> = ids.iter().copied().collect();
        self.jobs.retain(|j| !doomed.contains(&j.id()));
        self.tickets.retain(|t| !doomed.contains(&t.job_id));

        for (index, job) in self.jobs.iter_mut().enumerate() {
            if !job.depends_on().iter().any(|d| doomed.contains(d)) {
                continue;
            }
            let kept: Vec<Uuid> = job
                .depends_on()
                .iter()
                .copied()
                .filter(|d| !doomed.contains(d))
                .collect();
            job.set_dependencies(kept);
            self.events.push(ServerEvent::JobChanged {
                index,
                job: job.properties().clone(),
            });
        }

        info!(count = ids.len(), "Jobs deleted");
        self.events.push(ServerEvent::JobsDeleted { ids: ids.to_vec() });
        self.dirty = true;
    }

    fn collect_events(&mut self) {
        for (index, job) in self.jobs.iter_mut().enumerate() {
            for event in job.take_events() {
                let id = job.id();
                match event {
                    JobEvent::StateChanged {
                        state,
                        encoding_state,
                    } => {
                        if matches!(state, JobState::Completed | JobState::Failed) {
                            self.reschedule = true;
                        }
                        if !state.is_active() {
                            self.dirty = true;
                        }
                        self.events.push(ServerEvent::JobStateChanged {
                            index,
                            id,
                            state,
                            encoding_state,
                        });
                    }
                    JobEvent::Progress => {
                        self.events
                            .push(ServerEvent::progress(index, job.properties()));
                    }
                    JobEvent::Log { level, message } => {
                        self.events.push(ServerEvent::JobLog {
                            id,
                            level,
                            text: message,
                        });
                    }
                }
            }
        }
    }
}

/// Unique ids in first-seen order.
fn dedup(ids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

/// Whether `target` is reachable from any of `starts` along dependency edges.
fn reaches(graph: &HashMap<Uuid, Vec<Uuid>>, starts: &[Uuid], target: Uuid) -> bool {
    let mut stack: Vec<Uuid> = starts.to_vec();
    let mut visited = HashSet::new();
    while let Some(id) = stack.pop() {
        if id == target {
            return true;
        }
        if !visited.insert(id) {
            continue;
        }
        if let Some(next) = graph.get(&id) {
            stack.extend(next.iter().copied());
        }
    }
    false
}
