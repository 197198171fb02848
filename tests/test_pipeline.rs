use parking_lot::Mutex;
use stage_pipeline::{
    ControlMessage, MapStage, PassthroughStage, PauseState, Pipeline, PipelineConfig,
    PipelineError, PipelineStage, Result as PipelineResult, Stage, StageContext, StageData,
    StageId, StageStatus,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
enum Record {
    Number(u64),
    Text(String),
}

type Seen = Arc<Mutex<Vec<(Record, bool)>>>;

/// Last stage: remembers every payload and its final flag
struct Recorder {
    seen: Seen,
}

impl Stage<Record> for Recorder {
    fn run(&mut self, ctx: &StageContext<Record>) -> PipelineResult<()> {
        while !ctx.should_stop() {
            if ctx.is_pause_requested() {
                ctx.enter_pause();
                continue;
            }
            if let Some(item) = ctx.next_data() {
                self.seen.lock().push((item.payload().clone(), item.is_final()));
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "recorder"
    }
}

/// Counts run loops that have returned
struct Exits<S> {
    inner: S,
    exited: Arc<AtomicUsize>,
}

impl<S: Stage<Record>> Stage<Record> for Exits<S> {
    fn run(&mut self, ctx: &StageContext<Record>) -> PipelineResult<()> {
        let result = self.inner.run(ctx);
        self.exited.fetch_add(1, Ordering::SeqCst);
        result
    }
}

fn recorder() -> (PipelineStage<Record>, Seen) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let stage = PipelineStage::new(Recorder {
        seen: Arc::clone(&seen),
    })
    .with_poll_interval(Duration::from_millis(20));
    (stage, seen)
}

fn forwarder() -> PipelineStage<Record> {
    PipelineStage::new(PassthroughStage).with_poll_interval(Duration::from_millis(20))
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_item_reaches_last_of_three_stages() {
    let mut pipeline: Pipeline<Record> = Pipeline::new("three");
    let (sink, seen) = recorder();
    pipeline.add_stage(forwarder()).unwrap();
    pipeline.add_stage(forwarder()).unwrap();
    pipeline.add_stage(sink).unwrap();
    pipeline.initialise().expect("initialise failed");
    pipeline.start().expect("start failed");

    pipeline
        .inject_data(StageData::new(Record::Text("hello".into())))
        .unwrap();

    assert!(wait_until(|| seen.lock().len() == 1));
    assert_eq!(seen.lock()[0], (Record::Text("hello".into()), false));

    let report = pipeline.stop(true);
    assert_eq!(report.outcomes.len(), 3);
    assert!(report.all_completed());
}

#[test]
fn test_two_stage_scenario_preserves_order_and_final_flag() {
    let mut pipeline: Pipeline<Record> = Pipeline::new("scenario");
    let (sink, seen) = recorder();
    pipeline.add_stage(forwarder()).unwrap();
    pipeline.add_stage(sink).unwrap();
    pipeline.initialise().unwrap();
    pipeline.start().unwrap();

    for i in 0..3 {
        pipeline.inject_data(StageData::new(Record::Number(i))).unwrap();
    }
    pipeline
        .inject_data(StageData::final_item(Record::Number(3)))
        .unwrap();

    assert!(wait_until(|| seen.lock().len() == 4));
    pipeline.stop(true);

    let seen = seen.lock();
    let expected: Vec<(Record, bool)> = vec![
        (Record::Number(0), false),
        (Record::Number(1), false),
        (Record::Number(2), false),
        (Record::Number(3), true),
    ];
    assert_eq!(*seen, expected);
}

#[test]
fn test_stop_waits_for_every_run_loop() {
    let exited = Arc::new(AtomicUsize::new(0));
    let mut pipeline: Pipeline<Record> = Pipeline::new("wait");
    for _ in 0..4 {
        let stage = PipelineStage::new(Exits {
            inner: PassthroughStage,
            exited: Arc::clone(&exited),
        })
        .with_poll_interval(Duration::from_millis(150));
        pipeline.add_stage(stage).unwrap();
    }
    pipeline.initialise().unwrap();
    pipeline.start().unwrap();

    let stage_one = Arc::clone(pipeline.stage(StageId(1)).unwrap());
    assert!(wait_until(|| stage_one.status() == StageStatus::Running));

    let report = pipeline.stop(true);
    assert_eq!(exited.load(Ordering::SeqCst), 4);
    assert!(report.all_completed());
    assert_eq!(stage_one.status(), StageStatus::Completed);
}

#[test]
fn test_restart_after_stop_reuses_identities() {
    let mut pipeline: Pipeline<Record> = Pipeline::new("again");
    pipeline.add_stage(forwarder()).unwrap();
    pipeline.add_stage(forwarder()).unwrap();
    pipeline.initialise().unwrap();
    pipeline.start().unwrap();
    pipeline.stop(true);

    assert!(pipeline.is_empty());
    let (sink, seen) = recorder();
    assert_eq!(pipeline.add_stage(forwarder()).unwrap(), StageId(1));
    assert_eq!(pipeline.add_stage(sink).unwrap(), StageId(2));
    pipeline.initialise().unwrap();
    pipeline.start().unwrap();

    pipeline.inject_data(StageData::new(Record::Number(9))).unwrap();
    assert!(wait_until(|| seen.lock().len() == 1));
    assert!(pipeline.stop(true).all_completed());
}

#[test]
fn test_pause_holds_items_until_restart() {
    let mut pipeline: Pipeline<Record> = Pipeline::new("pause");
    let (sink, seen) = recorder();
    let first = pipeline.add_stage(forwarder()).unwrap();
    pipeline.add_stage(sink).unwrap();
    pipeline.initialise().unwrap();
    pipeline.start().unwrap();

    let ctx = Arc::clone(pipeline.stage(first).unwrap());
    pipeline.pause_stage(first).unwrap();
    assert!(wait_until(|| ctx.pause_state() == PauseState::Paused));

    pipeline.inject_data(StageData::new(Record::Number(1))).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(seen.lock().is_empty());
    assert_eq!(ctx.buffered(), 1);

    pipeline.resume_stage(first).unwrap();
    assert!(wait_until(|| seen.lock().len() == 1));
    assert_eq!(ctx.pause_state(), PauseState::PauseEnd);
    assert_eq!(ctx.metrics().total_pauses(), 1);

    pipeline.stop(true);
}

#[test]
fn test_stop_releases_paused_stage() {
    let mut pipeline: Pipeline<Record> = Pipeline::new("pause-stop");
    let id = pipeline.add_stage(forwarder()).unwrap();
    pipeline.initialise().unwrap();
    pipeline.start().unwrap();

    let ctx = Arc::clone(pipeline.stage(id).unwrap());
    pipeline.pause_stage(id).unwrap();
    assert!(wait_until(|| ctx.pause_state() == PauseState::Paused));

    let started = Instant::now();
    let report = pipeline.stop(true);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.outcomes.get(&id), Some(&StageStatus::Completed));
}

#[test]
fn test_external_controller_uses_bus() {
    let mut pipeline: Pipeline<Record> = Pipeline::new("controller");
    let id = pipeline.add_stage(forwarder()).unwrap();
    let other = pipeline.add_stage(forwarder()).unwrap();
    pipeline.initialise().unwrap();
    pipeline.start().unwrap();

    let bus = Arc::clone(pipeline.bus().unwrap());
    let ctx = Arc::clone(pipeline.stage(id).unwrap());
    let other_ctx = Arc::clone(pipeline.stage(other).unwrap());

    bus.publish(ControlMessage::pause(id));
    assert!(wait_until(|| ctx.pause_state() == PauseState::Paused));
    assert_eq!(other_ctx.pause_state(), PauseState::PauseEnd);

    bus.publish(ControlMessage::restart(id));
    assert!(wait_until(|| ctx.pause_state() == PauseState::PauseEnd));

    // Nobody listens on this identity; the bus drops it quietly.
    let dropped = bus.dropped();
    bus.publish(ControlMessage::pause(StageId(42)));
    assert!(wait_until(|| bus.dropped() == dropped + 1));

    pipeline.stop(true);
}

#[test]
fn test_stop_stage_while_waiting_for_data() {
    let mut pipeline: Pipeline<Record> = Pipeline::new("latency");
    let poll = Duration::from_millis(200);
    let stage = PipelineStage::new(PassthroughStage).with_poll_interval(poll);
    let id = pipeline.add_stage(stage).unwrap();
    pipeline.initialise().unwrap();
    pipeline.start().unwrap();

    let ctx = Arc::clone(pipeline.stage(id).unwrap());
    assert!(wait_until(|| ctx.status() == StageStatus::Running));

    let started = Instant::now();
    ctx.stop_stage();
    assert!(wait_until(|| ctx.status() == StageStatus::Completed));
    assert!(started.elapsed() < poll * 3);

    pipeline.stop(true);
}

#[test]
fn test_failing_stage_is_contained() {
    struct FailOnFirstItem;

    impl Stage<Record> for FailOnFirstItem {
        fn run(&mut self, ctx: &StageContext<Record>) -> PipelineResult<()> {
            while !ctx.should_stop() {
                if ctx.next_data().is_some() {
                    return Err(PipelineError::Stage("corrupt record".into()));
                }
            }
            Ok(())
        }

        fn name(&self) -> &str {
            "fragile"
        }
    }

    let mut pipeline: Pipeline<Record> = Pipeline::new("contained");
    let fragile = pipeline
        .add_stage(
            PipelineStage::new(FailOnFirstItem).with_poll_interval(Duration::from_millis(20)),
        )
        .unwrap();
    let (sink, seen) = recorder();
    let sink_id = pipeline.add_stage(sink).unwrap();
    pipeline.initialise().unwrap();
    pipeline.start().unwrap();

    pipeline.inject_data(StageData::new(Record::Number(1))).unwrap();
    assert!(wait_until(|| pipeline
        .stage_status(fragile)
        .is_some_and(|s| s.is_failed())));

    // The downstream stage keeps running and still accepts work.
    assert_eq!(pipeline.stage_status(sink_id), Some(StageStatus::Running));
    pipeline
        .stage(sink_id)
        .unwrap()
        .inject_data(StageData::new(Record::Number(2)));
    assert!(wait_until(|| seen.lock().len() == 1));

    let report = pipeline.stop(true);
    let failed: Vec<_> = report.failed().collect();
    assert_eq!(failed, vec![(fragile, "Stage execution failed: corrupt record")]);
}

#[test]
fn test_map_stage_in_chain() {
    let mut pipeline: Pipeline<Record> = Pipeline::new("map");
    let double = MapStage::new("double", |record: &Record| -> PipelineResult<Record> {
        match record {
            Record::Number(n) => Ok(Record::Number(n * 2)),
            Record::Text(_) => Err(PipelineError::Stage("not a number".into())),
        }
    });
    let (sink, seen) = recorder();
    pipeline
        .add_stage(PipelineStage::new(double).with_poll_interval(Duration::from_millis(20)))
        .unwrap();
    pipeline.add_stage(sink).unwrap();
    pipeline.initialise().unwrap();
    pipeline.start().unwrap();

    pipeline.inject_data(StageData::new(Record::Text("skip".into()))).unwrap();
    pipeline.inject_data(StageData::final_item(Record::Number(21))).unwrap();

    assert!(wait_until(|| seen.lock().len() == 1));
    assert_eq!(seen.lock()[0], (Record::Number(42), true));
    pipeline.stop(true);
}

#[test]
fn test_pipeline_from_config() {
    let config = PipelineConfig::from_toml_str(
        r#"
        name = "configured"
        poll_interval_ms = 30

        [[stages]]
        name = "first"

        [[stages]]
        name = "second"
        poll_interval_ms = 10
        "#,
    )
    .unwrap();

    let pipeline: Pipeline<Record> =
        Pipeline::from_config(&config, |_| Box::new(PassthroughStage)).unwrap();
    assert_eq!(pipeline.name(), "configured");
    assert_eq!(pipeline.len(), 2);

    let first = pipeline.stage(StageId(1)).unwrap();
    let second = pipeline.stage(StageId(2)).unwrap();
    assert_eq!(first.name(), "first");
    assert_eq!(first.poll_interval(), Duration::from_millis(30));
    assert_eq!(second.poll_interval(), Duration::from_millis(10));
}

#[test]
fn test_unsupported_buffer_in_config_fails() {
    let config = PipelineConfig::from_toml_str(
        r#"
        [[stages]]
        buffer = "ring"
        "#,
    )
    .unwrap();

    let result: PipelineResult<Pipeline<Record>> =
        Pipeline::from_config(&config, |_| Box::new(PassthroughStage));
    assert!(matches!(result, Err(PipelineError::UnsupportedBuffer(kind)) if kind == "ring"));
}

#[test]
fn test_drop_stops_running_pipeline() {
    let exited = Arc::new(AtomicUsize::new(0));
    {
        let mut pipeline: Pipeline<Record> = Pipeline::new("dropped");
        pipeline
            .add_stage(PipelineStage::new(Exits {
                inner: PassthroughStage,
                exited: Arc::clone(&exited),
            }))
            .unwrap();
        pipeline.initialise().unwrap();
        pipeline.start().unwrap();
    }
    assert_eq!(exited.load(Ordering::SeqCst), 1);
}
