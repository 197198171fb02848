use crate::bus::{ControlMessage, MessageBus, StageId};
use crate::config::PipelineConfig;
use crate::data::DataRef;
use crate::error::{PipelineError, Result};
use crate::metrics::StageMetrics;
use crate::pool::{TaskHandle, WorkerPool};
use crate::stage::{PipelineStage, Stage, StageContext, StageStatus};
use crossbeam::channel::bounded;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Configuring,
    Initialised,
    Running,
}

/// How each stage's run loop ended, collected by [`Pipeline::stop`]
#[derive(Debug, Clone, Default)]
pub struct StopReport {
    /// Final status of every scheduled stage
    pub outcomes: BTreeMap<StageId, StageStatus>,
}

impl StopReport {
    /// Whether every stage that ran returned `Ok`
    pub fn all_completed(&self) -> bool {
        self.outcomes.values().all(|status| *status == StageStatus::Completed)
    }

    /// Stages whose run loop returned an error or panicked
    pub fn failed(&self) -> impl Iterator<Item = (StageId, &str)> + '_ {
        self.outcomes.iter().filter_map(|(id, status)| match status {
            StageStatus::Failed(reason) => Some((*id, reason.as_str())),
            _ => None,
        })
    }
}

/// A linear chain of stages, each running on its own worker thread.
///
/// Register stages with [`add_stage`](Self::add_stage), then
/// [`initialise`](Self::initialise) and [`start`](Self::start). Feed the
/// first stage with [`inject_data`](Self::inject_data). [`stop`](Self::stop)
/// tears everything down and releases the stages, after which the same
/// pipeline can be configured again from identity 1.
pub struct Pipeline<T: Send + Sync + 'static> {
    name: String,
    next_id: Option<StageId>,
    stages: BTreeMap<StageId, PipelineStage<T>>,
    links: Vec<(StageId, StageId)>,
    bus: Option<Arc<MessageBus<T>>>,
    pool: Option<WorkerPool>,
    handles: BTreeMap<StageId, TaskHandle<StageStatus>>,
    state: PipelineState,
}

impl<T: Send + Sync + 'static> Pipeline<T> {
    /// Create an empty pipeline
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next_id: Some(StageId::FIRST),
            stages: BTreeMap::new(),
            links: Vec::new(),
            bus: None,
            pool: None,
            handles: BTreeMap::new(),
            state: PipelineState::Configuring,
        }
    }

    /// Build a pipeline from config, creating one stage per `[[stages]]` entry
    pub fn from_config<F>(config: &PipelineConfig, mut stage_factory: F) -> Result<Self>
    where
        F: FnMut(usize) -> Box<dyn Stage<T>>,
    {
        let mut pipeline = Self::new(config.name.clone());
        for index in 0..config.stages.len() {
            if let Some(stage_config) = config.resolved_stage(index) {
                let stage = PipelineStage::from_config(stage_factory(index), &stage_config)?;
                pipeline.add_stage(stage)?;
            }
        }
        Ok(pipeline)
    }

    /// Get the pipeline name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn thread_prefix(&self) -> &str {
        if self.name.is_empty() {
            "pipeline"
        } else {
            &self.name
        }
    }

    /// Register a stage and assign it the next identity.
    ///
    /// The stage is chained after the previously registered one. Fails with
    /// `TooManyStages` once every `u16` identity has been handed out.
    pub fn add_stage(&mut self, stage: PipelineStage<T>) -> Result<StageId> {
        if self.state != PipelineState::Configuring {
            return Err(PipelineError::AlreadyInitialised);
        }

        let id = self.next_id.ok_or(PipelineError::TooManyStages)?;
        if let Some((&previous, _)) = self.stages.last_key_value() {
            self.links.push((previous, id));
        }
        tracing::debug!(
            pipeline = %self.name,
            stage = %stage.name(),
            stage_id = %id,
            "stage added"
        );
        self.stages.insert(id, stage);
        self.next_id = id.next();
        Ok(id)
    }

    /// Create the bus and a worker pool with one slot per stage, then bind
    /// every stage to its identity and the bus
    pub fn initialise(&mut self) -> Result<()> {
        if self.state != PipelineState::Configuring {
            return Err(PipelineError::AlreadyInitialised);
        }
        if self.stages.is_empty() {
            return Err(PipelineError::NoStages);
        }

        let bus = Arc::new(MessageBus::new(self.thread_prefix())?);
        let pool = WorkerPool::new(self.thread_prefix(), self.stages.len())?;
        if pool.size() < self.stages.len() {
            return Err(PipelineError::PoolTooSmall {
                slots: pool.size(),
                stages: self.stages.len(),
            });
        }

        for (&id, stage) in &self.stages {
            stage.context().initialise(id, &bus);
        }
        for &(from, to) in &self.links {
            bus.link(from, to);
        }

        tracing::info!(pipeline = %self.name, stages = self.stages.len(), "pipeline initialised");
        self.bus = Some(bus);
        self.pool = Some(pool);
        self.state = PipelineState::Initialised;
        Ok(())
    }

    /// Submit every stage's run loop to the worker pool.
    ///
    /// Returns once each loop has been picked up by a worker, so a `stop`
    /// that follows never finds a stage still sitting in the pool queue.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Configuring => return Err(PipelineError::NotInitialised),
            PipelineState::Running => return Err(PipelineError::AlreadyStarted),
            PipelineState::Initialised => {}
        }
        let pool = self.pool.as_ref().ok_or(PipelineError::NotInitialised)?;

        let mut pickups = Vec::with_capacity(self.stages.len());
        for (&id, stage) in self.stages.iter_mut() {
            let runner = stage.runner().ok_or(PipelineError::AlreadyStarted)?;
            let (picked_tx, picked_rx) = bounded::<()>(1);
            let handle = pool.submit(move || {
                let _ = picked_tx.send(());
                runner.run()
            })?;
            self.handles.insert(id, handle);
            pickups.push(picked_rx);
        }
        // One worker per stage, so every job is taken without waiting on another.
        for picked in pickups {
            let _ = picked.recv();
        }

        self.state = PipelineState::Running;
        tracing::info!(pipeline = %self.name, "pipeline started");
        Ok(())
    }

    /// Stop every stage and tear the pipeline down.
    ///
    /// With `wait_for_stages`, returns only after every run loop has exited
    /// and reports how each one ended. Afterwards the stage set is empty and
    /// the next registered stage gets identity 1 again.
    pub fn stop(&mut self, wait_for_stages: bool) -> StopReport {
        tracing::info!(pipeline = %self.name, wait_for_stages, "waiting for stages to stop");

        if let Some(pool) = &self.pool {
            pool.clear_queue();
        }
        for stage in self.stages.values() {
            stage.stop_stage();
        }

        let mut report = StopReport::default();
        let handles = std::mem::take(&mut self.handles);
        if wait_for_stages {
            for (id, handle) in handles {
                let status = handle.wait().unwrap_or_else(|_| self.stage_status_or_idle(id));
                report.outcomes.insert(id, status);
            }
        } else {
            for id in handles.keys() {
                report.outcomes.insert(*id, self.stage_status_or_idle(*id));
            }
        }

        if let Some(mut pool) = self.pool.take() {
            pool.shutdown(wait_for_stages);
        }
        if let Some(bus) = self.bus.take() {
            bus.shutdown();
        }

        for (id, reason) in report.failed() {
            tracing::warn!(
                pipeline = %self.name,
                stage_id = %id,
                reason,
                "stage ended with failure"
            );
        }

        self.stages.clear();
        self.links.clear();
        self.next_id = Some(StageId::FIRST);
        self.state = PipelineState::Configuring;
        tracing::info!(pipeline = %self.name, "pipeline stopped");
        report
    }

    fn stage_status_or_idle(&self, id: StageId) -> StageStatus {
        self.stages
            .get(&id)
            .map(|stage| stage.context().status())
            .unwrap_or_default()
    }

    /// Push an item into the first stage's buffer
    pub fn inject_data(&self, data: DataRef<T>) -> Result<()> {
        let first = self.stages.values().next().ok_or(PipelineError::NoStages)?;
        first.inject_data(data);
        Ok(())
    }

    /// Ask one stage to park its run loop
    pub fn pause_stage(&self, id: StageId) -> Result<()> {
        self.control(ControlMessage::pause(id))
    }

    /// Resume a paused stage or cancel a pending pause
    pub fn resume_stage(&self, id: StageId) -> Result<()> {
        self.control(ControlMessage::restart(id))
    }

    fn control(&self, message: ControlMessage) -> Result<()> {
        let bus = self.bus.as_ref().ok_or(PipelineError::NotInitialised)?;
        bus.publish(message);
        Ok(())
    }

    /// The bus stages and controllers share, once initialised
    pub fn bus(&self) -> Option<&Arc<MessageBus<T>>> {
        self.bus.as_ref()
    }

    /// Get the runtime state of a registered stage
    pub fn stage(&self, id: StageId) -> Option<&Arc<StageContext<T>>> {
        self.stages.get(&id).map(PipelineStage::context)
    }

    /// Get the identities of all registered stages, in chain order
    pub fn stage_ids(&self) -> Vec<StageId> {
        self.stages.keys().copied().collect()
    }

    /// Get a stage's run loop status
    pub fn stage_status(&self, id: StageId) -> Option<StageStatus> {
        self.stage(id).map(|ctx| ctx.status())
    }

    /// Get a stage's counters
    pub fn stage_metrics(&self, id: StageId) -> Option<&StageMetrics> {
        self.stage(id).map(|ctx| ctx.metrics())
    }

    /// Get the number of registered stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Check if no stages are registered
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Check if pipeline is running
    pub fn is_running(&self) -> bool {
        self.state == PipelineState::Running
    }

    /// Get a summary of all metrics
    pub fn metrics_summary(&self) -> String {
        let mut summary = format!("Pipeline '{}' Metrics Summary:\n", self.name);
        for (id, stage) in &self.stages {
            let snapshot = stage.context().metrics().snapshot();
            summary.push_str(&format!(
                "  Stage {} ({}): {}\n",
                id.0,
                stage.name(),
                snapshot.format()
            ));
        }
        summary
    }
}

impl<T: Send + Sync + 'static> Drop for Pipeline<T> {
    fn drop(&mut self) {
        if self.state != PipelineState::Configuring || !self.handles.is_empty() {
            self.stop(true);
        }
    }
}
