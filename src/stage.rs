use crate::buffer::{new_buffer, BufferKind, StageBuffer};
use crate::bus::{
    BusMessage, ControlCommand, DataAvailableMessage, MessageBus, StageId, Subscriber, Subscription,
};
use crate::config::StageConfig;
use crate::control::{PauseExit, PauseState, StageControl};
use crate::data::{DataRef, StageData};
use crate::error::Result;
use crate::metrics::StageMetrics;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// How long `next_data` waits for an item unless configured otherwise
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A unit of work in the pipeline.
///
/// `run` is called once, on its own worker thread, and should loop until
/// [`StageContext::should_stop`] returns `true`. Use
/// [`StageContext::next_data`] to wait for input (it times out so the stop
/// flag gets re-checked) and [`StageContext::data_complete`] to hand a
/// finished item to the next stage.
pub trait Stage<T: Send + Sync + 'static>: Send + 'static {
    /// The processing loop
    fn run(&mut self, ctx: &StageContext<T>) -> Result<()>;

    /// Called on the worker thread before `run`
    fn on_start(&mut self, _ctx: &StageContext<T>) -> Result<()> {
        Ok(())
    }

    /// Called on the worker thread after `run` returns, even with an error
    fn on_stop(&mut self, _ctx: &StageContext<T>) -> Result<()> {
        Ok(())
    }

    /// Get a human-readable name for this stage
    fn name(&self) -> &str {
        "stage"
    }
}

impl<T: Send + Sync + 'static> Stage<T> for Box<dyn Stage<T>> {
    fn run(&mut self, ctx: &StageContext<T>) -> Result<()> {
        (**self).run(ctx)
    }

    fn on_start(&mut self, ctx: &StageContext<T>) -> Result<()> {
        (**self).on_start(ctx)
    }

    fn on_stop(&mut self, ctx: &StageContext<T>) -> Result<()> {
        (**self).on_stop(ctx)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Lifecycle of a stage's run loop
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StageStatus {
    /// Not scheduled yet
    #[default]
    Idle,
    /// `run` is executing on a worker
    Running,
    /// `run` returned `Ok`
    Completed,
    /// `run` returned an error or panicked
    Failed(String),
}

impl StageStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, StageStatus::Failed(_))
    }
}

struct Binding<T: Send + Sync + 'static> {
    id: StageId,
    bus: Option<Arc<MessageBus<T>>>,
    subscription: Option<Subscription<T>>,
}

/// Runtime state a stage uses from inside its run loop.
///
/// Owns the stage's buffer and control state and is shared with the bus,
/// which pushes incoming items and control verbs into it.
pub struct StageContext<T: Send + Sync + 'static> {
    name: String,
    binding: RwLock<Binding<T>>,
    control: StageControl,
    buffer: Box<dyn StageBuffer<DataRef<T>>>,
    poll_interval_nanos: AtomicU64,
    metrics: StageMetrics,
    status: Mutex<StageStatus>,
}

impl<T: Send + Sync + 'static> StageContext<T> {
    fn new(name: String, kind: BufferKind) -> Self {
        Self {
            name,
            binding: RwLock::new(Binding {
                id: StageId::UNBOUND,
                bus: None,
                subscription: None,
            }),
            control: StageControl::new(),
            buffer: new_buffer(kind),
            poll_interval_nanos: AtomicU64::new(DEFAULT_POLL_INTERVAL.as_nanos() as u64),
            metrics: StageMetrics::new(),
            status: Mutex::new(StageStatus::Idle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity assigned by the pipeline, `StageId::UNBOUND` before `initialise`
    pub fn id(&self) -> StageId {
        self.binding.read().id
    }

    /// Bind identity and bus, and subscribe for messages addressed to `id`.
    ///
    /// Calling it again rebinds; the previous subscription is released.
    pub fn initialise(self: &Arc<Self>, id: StageId, bus: &Arc<MessageBus<T>>) {
        let weak_self: Weak<Self> = Arc::downgrade(self);
        let subscriber: Weak<dyn Subscriber<T>> = weak_self;

        // Held across subscribe so a delivery never sees the old identity.
        let mut binding = self.binding.write();
        drop(binding.subscription.take());
        binding.id = id;
        binding.bus = Some(Arc::clone(bus));
        binding.subscription = Some(bus.subscribe(id, subscriber));
        drop(binding);

        tracing::debug!(stage = %self.name, stage_id = %id, bus = %bus.name(), "stage initialised");
    }

    /// Whether the run loop should exit
    pub fn should_stop(&self) -> bool {
        self.control.should_stop()
    }

    /// Set the stop flag and wake the run loop if it is paused. Idempotent.
    pub fn stop_stage(&self) {
        if self.control.stop() {
            tracing::debug!(stage = %self.name, stage_id = %self.id(), "stop requested");
        }
    }

    pub fn is_pause_requested(&self) -> bool {
        self.control.is_pause_requested()
    }

    pub fn pause_state(&self) -> PauseState {
        self.control.pause_state()
    }

    /// Park the run loop until restarted or stopped, if a pause is pending
    pub fn enter_pause(&self) -> PauseExit {
        if !self.control.is_pause_requested() {
            return self.control.enter_pause();
        }
        self.metrics.record_pause();
        tracing::debug!(stage = %self.name, stage_id = %self.id(), "paused");
        let exit = self.control.enter_pause();
        tracing::debug!(stage = %self.name, stage_id = %self.id(), ?exit, "leaving pause");
        exit
    }

    /// Push an item straight into this stage's buffer
    pub fn inject_data(&self, data: DataRef<T>) {
        self.buffer.push(data);
        self.metrics.record_received();
    }

    /// Hand a finished item to the next stage in the chain.
    ///
    /// Items completed by the last stage, or by an unbound stage, are dropped.
    pub fn data_complete(&self, data: DataRef<T>) {
        self.metrics.record_completed();

        let binding = self.binding.read();
        let Some(bus) = binding.bus.as_ref() else {
            self.metrics.record_unroutable();
            tracing::trace!(stage = %self.name, "stage not bound to a bus, dropping item");
            return;
        };

        match bus.successor(binding.id) {
            Some(target) => bus.publish(DataAvailableMessage {
                target,
                sender: binding.id,
                data,
            }),
            None => {
                self.metrics.record_unroutable();
                tracing::trace!(
                    stage = %self.name,
                    stage_id = %binding.id,
                    "no downstream stage, dropping item"
                );
            }
        }
    }

    /// Wait up to the poll interval for the next item
    pub fn next_data(&self) -> Option<DataRef<T>> {
        self.next_data_timeout(self.poll_interval())
    }

    /// Wait up to `timeout` for the next item
    pub fn next_data_timeout(&self, timeout: Duration) -> Option<DataRef<T>> {
        self.buffer.pop(timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_nanos(self.poll_interval_nanos.load(Ordering::Relaxed))
    }

    /// Change how long `next_data` waits. Bounds worst-case stop latency.
    pub fn set_poll_interval(&self, interval: Duration) {
        let nanos = u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX);
        self.poll_interval_nanos.store(nanos, Ordering::Relaxed);
    }

    pub fn has_data(&self) -> bool {
        self.buffer.has_data()
    }

    /// Number of items waiting in the buffer
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    pub fn status(&self) -> StageStatus {
        self.status.lock().clone()
    }

    fn set_status(&self, status: StageStatus) {
        *self.status.lock() = status;
    }
}

impl<T: Send + Sync + 'static> Subscriber<T> for StageContext<T> {
    fn on_message(&self, message: BusMessage<T>) {
        let id = self.id();
        if message.target() != id {
            return;
        }

        match message {
            BusMessage::DataAvailable(msg) => self.inject_data(msg.data),
            BusMessage::Control(msg) => match msg.command {
                ControlCommand::Pause => {
                    if self.control.request_pause() {
                        tracing::debug!(stage = %self.name, stage_id = %id, "pause requested");
                    }
                }
                ControlCommand::Restart => {
                    if self.control.restart() {
                        tracing::debug!(stage = %self.name, stage_id = %id, "restart requested");
                    }
                }
            },
        }
    }
}

impl<T: Send + Sync + 'static> Drop for StageContext<T> {
    fn drop(&mut self) {
        // Unsubscribe before the buffer goes away.
        let binding = self.binding.get_mut();
        binding.subscription.take();
        binding.bus.take();
    }
}

/// A stage implementation paired with its runtime state, ready to be added
/// to a [`Pipeline`](crate::Pipeline)
pub struct PipelineStage<T: Send + Sync + 'static> {
    context: Arc<StageContext<T>>,
    stage: Option<Box<dyn Stage<T>>>,
}

impl<T: Send + Sync + 'static> PipelineStage<T> {
    /// Wrap a stage with a queue buffer and the default poll interval
    pub fn new(stage: impl Stage<T>) -> Self {
        Self::with_kind(Box::new(stage), BufferKind::default())
    }

    /// Wrap a stage with a buffer named by `kind`.
    ///
    /// Fails with [`PipelineError::UnsupportedBuffer`](crate::PipelineError::UnsupportedBuffer)
    /// for unknown kinds.
    pub fn with_buffer(stage: impl Stage<T>, kind: &str) -> Result<Self> {
        Ok(Self::with_kind(Box::new(stage), kind.parse()?))
    }

    /// Wrap a stage using name, buffer kind and poll interval from config
    pub fn from_config(stage: impl Stage<T>, config: &StageConfig) -> Result<Self> {
        let kind: BufferKind = config.buffer.parse()?;
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| stage.name().to_string());
        let context = StageContext::new(name, kind);
        if let Some(interval) = config.poll_interval() {
            context.set_poll_interval(interval);
        }
        Ok(Self {
            context: Arc::new(context),
            stage: Some(Box::new(stage)),
        })
    }

    fn with_kind(stage: Box<dyn Stage<T>>, kind: BufferKind) -> Self {
        let context = StageContext::new(stage.name().to_string(), kind);
        Self {
            context: Arc::new(context),
            stage: Some(stage),
        }
    }

    pub fn with_poll_interval(self, interval: Duration) -> Self {
        self.context.set_poll_interval(interval);
        self
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    pub fn id(&self) -> StageId {
        self.context.id()
    }

    /// Shared runtime state, for control and inspection from other threads
    pub fn context(&self) -> &Arc<StageContext<T>> {
        &self.context
    }

    pub fn inject_data(&self, data: DataRef<T>) {
        self.context.inject_data(data);
    }

    pub fn stop_stage(&self) {
        self.context.stop_stage();
    }

    /// Take the stage implementation for scheduling. `None` once taken.
    pub(crate) fn runner(&mut self) -> Option<StageRunner<T>> {
        self.stage.take().map(|stage| StageRunner {
            context: Arc::clone(&self.context),
            stage,
        })
    }
}

/// Drives one stage's `run` on a worker thread and contains its failures
pub struct StageRunner<T: Send + Sync + 'static> {
    context: Arc<StageContext<T>>,
    stage: Box<dyn Stage<T>>,
}

impl<T: Send + Sync + 'static> StageRunner<T> {
    /// Run the stage to completion.
    ///
    /// An error or panic from the stage is logged and recorded in its status;
    /// it never propagates to the caller.
    pub fn run(mut self) -> StageStatus {
        let ctx = &*self.context;
        let stage = &mut self.stage;
        ctx.set_status(StageStatus::Running);
        tracing::info!(stage = %ctx.name(), stage_id = %ctx.id(), "stage running");

        let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<()> {
            stage.on_start(ctx)?;
            let run = stage.run(ctx);
            let stop = stage.on_stop(ctx);
            run.and(stop)
        }));

        let status = match outcome {
            Ok(Ok(())) => {
                tracing::info!(stage = %ctx.name(), stage_id = %ctx.id(), "stage finished");
                StageStatus::Completed
            }
            Ok(Err(e)) => {
                tracing::error!(
                    stage = %ctx.name(),
                    stage_id = %ctx.id(),
                    error = %e,
                    "stage failed"
                );
                StageStatus::Failed(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    stage = %ctx.name(),
                    stage_id = %ctx.id(),
                    panic = %message,
                    "stage panicked"
                );
                StageStatus::Failed(message)
            }
        };
        ctx.set_status(status.clone());
        status
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Forwards every item unchanged
#[derive(Debug, Default)]
pub struct PassthroughStage;

impl<T: Send + Sync + 'static> Stage<T> for PassthroughStage {
    fn run(&mut self, ctx: &StageContext<T>) -> Result<()> {
        while !ctx.should_stop() {
            if ctx.is_pause_requested() {
                ctx.enter_pause();
                continue;
            }
            if let Some(item) = ctx.next_data() {
                ctx.data_complete(item);
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// Forwards items matching a predicate. Final items always pass so the
/// end-of-stream marker reaches downstream stages.
pub struct FilterStage<F> {
    name: String,
    predicate: F,
}

impl<F> FilterStage<F> {
    /// Create a new filter stage
    pub fn new(name: impl Into<String>, predicate: F) -> Self {
        Self {
            name: name.into(),
            predicate,
        }
    }
}

impl<T, F> Stage<T> for FilterStage<F>
where
    T: Send + Sync + 'static,
    F: FnMut(&T) -> bool + Send + 'static,
{
    fn run(&mut self, ctx: &StageContext<T>) -> Result<()> {
        while !ctx.should_stop() {
            if ctx.is_pause_requested() {
                ctx.enter_pause();
                continue;
            }
            if let Some(item) = ctx.next_data() {
                if item.is_final() || (self.predicate)(item.payload()) {
                    ctx.data_complete(item);
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Transforms each payload into a new one, keeping the final marker.
///
/// Items the mapper rejects are dropped, except a final item, which is
/// forwarded unchanged so the end-of-stream marker still reaches
/// downstream stages.
pub struct MapStage<F> {
    name: String,
    mapper: F,
}

impl<F> MapStage<F> {
    /// Create a new map stage
    pub fn new(name: impl Into<String>, mapper: F) -> Self {
        Self {
            name: name.into(),
            mapper,
        }
    }
}

impl<T, F> Stage<T> for MapStage<F>
where
    T: Send + Sync + 'static,
    F: FnMut(&T) -> Result<T> + Send + 'static,
{
    fn run(&mut self, ctx: &StageContext<T>) -> Result<()> {
        while !ctx.should_stop() {
            if ctx.is_pause_requested() {
                ctx.enter_pause();
                continue;
            }
            let Some(item) = ctx.next_data() else {
                continue;
            };
            match (self.mapper)(item.payload()) {
                Ok(mapped) => {
                    let out = StageData::new(mapped);
                    out.set_final(item.is_final());
                    ctx.data_complete(out);
                }
                Err(e) if item.is_final() => {
                    tracing::warn!(
                        stage = %self.name,
                        error = %e,
                        "map failed, forwarding final item unchanged"
                    );
                    ctx.data_complete(item);
                }
                Err(e) => {
                    tracing::warn!(stage = %self.name, error = %e, "map failed, dropping item");
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
