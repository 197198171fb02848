//! Three-stage demo: a generator, a relay and a logger.
//!
//! The generator produces a numbered item every 100ms, the relay forwards
//! it and the logger prints it. Halfway through, the relay is paused for a
//! second and then resumed. An interval timer prints per-stage counters.
//!
//! Usage: RUST_LOG=info cargo run --example three_stage

use stage_pipeline::{
    init_logging, IntervalTimer, PassthroughStage, Pipeline, PipelineStage,
    Result as PipelineResult, Stage, StageContext, StageData, StageId,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug)]
struct Frame {
    index: u64,
}

struct Generator {
    next: u64,
}

impl Stage<Frame> for Generator {
    fn run(&mut self, ctx: &StageContext<Frame>) -> PipelineResult<()> {
        while !ctx.should_stop() {
            self.next += 1;
            ctx.data_complete(StageData::new(Frame { index: self.next }));
            thread::sleep(Duration::from_millis(100));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "generator"
    }
}

struct Logger;

impl Stage<Frame> for Logger {
    fn run(&mut self, ctx: &StageContext<Frame>) -> PipelineResult<()> {
        while !ctx.should_stop() {
            if let Some(frame) = ctx.next_data() {
                tracing::info!(stage = %ctx.name(), index = frame.index, "frame received");
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "logger"
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging("info");

    let mut pipeline: Pipeline<Frame> = Pipeline::new("demo");
    pipeline.add_stage(PipelineStage::new(Generator { next: 0 }))?;
    let poll = Duration::from_millis(200);
    let relay = pipeline.add_stage(PipelineStage::new(PassthroughStage).with_poll_interval(poll))?;
    let logger = pipeline.add_stage(PipelineStage::new(Logger).with_poll_interval(poll))?;
    pipeline.initialise()?;
    pipeline.start()?;

    let watched: Vec<(StageId, Arc<StageContext<Frame>>)> = [relay, logger]
        .into_iter()
        .filter_map(|id| pipeline.stage(id).map(|ctx| (id, Arc::clone(ctx))))
        .collect();
    let mut monitor = IntervalTimer::new(Duration::from_millis(500));
    monitor.start(move || {
        for (id, ctx) in &watched {
            println!("{} {}: {}", id, ctx.name(), ctx.metrics().snapshot().format());
        }
    })?;

    thread::sleep(Duration::from_secs(1));
    tracing::info!("pausing relay");
    pipeline.pause_stage(relay)?;
    thread::sleep(Duration::from_secs(1));
    tracing::info!("resuming relay");
    pipeline.resume_stage(relay)?;
    thread::sleep(Duration::from_secs(1));

    monitor.stop();
    let report = pipeline.stop(true);
    for (id, status) in &report.outcomes {
        println!("{id}: {status:?}");
    }

    Ok(())
}
