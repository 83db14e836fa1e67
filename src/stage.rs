//! The stage contract, the chain graph that wires stages together, and the
//! push-based dispatch loop.
//!
//! Successor wiring is arena-indexed rather than a raw `next` pointer: a
//! [`Chain`] owns every stage in a `Vec`, and a separate adjacency list maps
//! each stage's index to the indices of its successors. Fan-out (Tee) is
//! then purely structural — a stage index with more than one successor —
//! with no separate "tee stage" needed in the graph itself, though
//! [`crate::tee`] still provides an explicit multi-target stage for cases
//! where the successors aren't plain graph children (e.g. echo).

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::latency::LatencyClass;
use crate::media_unit::MediaUnit;

/// `Created -> Initialized -> Running -> Stopped`.
/// `initialize()` failure returns to `Created` (after releasing whatever it
/// partially acquired); `stop()` is idempotent from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Created,
    Initialized,
    Running,
    Stopped,
}

/// The uniform contract every processing node implements.
///
/// `process` returns the zero or more units this stage emits toward its
/// successors; it must never unwind a panic out to the caller (the chain
/// driver catches one defensively, but a well-behaved stage handles its own
/// errors and never panics on a decode/encode failure).
pub trait Stage: Send {
    fn name(&self) -> &'static str;

    /// Created -> Initialized. Default: no-op success.
    fn initialize(&mut self) -> crate::error::Result<()> {
        Ok(())
    }

    /// Initialized -> Running. Default: no-op (most stages have nothing to
    /// start; only sources spawn a producer thread, and they do that
    /// through the separate [`Source`] trait, not here).
    fn start(&mut self) -> crate::error::Result<()> {
        Ok(())
    }

    /// Process one unit, returning what to forward downstream.
    fn process(&mut self, unit: MediaUnit) -> Vec<MediaUnit>;

    /// Idempotent, safe from any state.
    fn stop(&mut self);

    fn latency_class(&self) -> LatencyClass {
        LatencyClass::Standard
    }
}

/// A stage that owns its own producer thread (Demuxer, ScreenGrab). `start`
/// is handed a sink closure rather than a successor index so the source
/// never needs to know the shape of the graph downstream of it.
pub trait Source: Send {
    fn name(&self) -> &'static str;

    fn initialize(&mut self) -> crate::error::Result<()> {
        Ok(())
    }

    /// Spawn the producer thread. Every unit it produces must be handed to
    /// `sink` exactly once, in production order.
    fn start(&mut self, sink: Arc<dyn Fn(MediaUnit) + Send + Sync>) -> crate::error::Result<()>;

    /// Stop the producer loop and join its thread. Must return only after
    /// no further `sink` calls from this source can be in flight.
    fn stop(&mut self);
}

pub type StageHandle = usize;

struct StageSlot {
    stage: Box<dyn Stage>,
    state: StageState,
}

/// An assembled, running (or about to run) pipeline: one source plus an
/// arena of downstream stages wired by an adjacency list.
pub struct Chain {
    source: Box<dyn Source>,
    source_state: StageState,
    stages: Arc<Mutex<Vec<StageSlot>>>,
    /// `successors[h]` = stage handles fed by stage `h`'s output.
    successors: Arc<Vec<Vec<StageHandle>>>,
    /// Stage handles fed directly by the source.
    entry_points: Arc<Vec<StageHandle>>,
}

/// Builds a [`Chain`]: stages are added in dependency order (leaves first),
/// wiring is declared with
/// [`ChainBuilder::link`]/[`ChainBuilder::link_entry`], then [`build`]
/// initializes everything and hands back a [`Chain`] whose source has not
/// yet been started.
pub struct ChainBuilder {
    source: Box<dyn Source>,
    stages: Vec<Box<dyn Stage>>,
    successors: Vec<Vec<StageHandle>>,
    entry_points: Vec<StageHandle>,
}

impl ChainBuilder {
    pub fn new(source: Box<dyn Source>) -> Self {
        Self {
            source,
            stages: Vec::new(),
            successors: Vec::new(),
            entry_points: Vec::new(),
        }
    }

    /// Add a stage to the arena, returning its handle.
    pub fn add_stage(&mut self, stage: Box<dyn Stage>) -> StageHandle {
        self.stages.push(stage);
        self.successors.push(Vec::new());
        self.stages.len() - 1
    }

    /// Wire `from`'s output into `to`'s input.
    pub fn link(&mut self, from: StageHandle, to: StageHandle) {
        self.successors[from].push(to);
    }

    /// Feed the source's output directly into `to`.
    pub fn link_entry(&mut self, to: StageHandle) {
        self.entry_points.push(to);
    }

    /// Initialize the source, then every stage leaves-first (in the order
    /// added, which callers are expected to have chosen so that a stage's
    /// dependencies are added before it). Aborts and releases everything
    /// already initialized if any step fails, returning to `Created` with
    /// resources released.
    pub fn build(mut self) -> crate::error::Result<Chain> {
        self.source.initialize()?;

        let mut initialized = Vec::with_capacity(self.stages.len());
        for mut stage in self.stages.drain(..) {
            if let Err(e) = stage.initialize() {
                stage.stop();
                for mut s in initialized {
                    let s: Box<dyn Stage> = s;
                    s_stop(&mut s);
                }
                self.source.stop();
                return Err(e);
            }
            initialized.push(stage);
        }

        let slots = initialized
            .into_iter()
            .map(|stage| StageSlot {
                stage,
                state: StageState::Initialized,
            })
            .collect();

        Ok(Chain {
            source: self.source,
            source_state: StageState::Initialized,
            stages: Arc::new(Mutex::new(slots)),
            successors: Arc::new(self.successors),
            entry_points: Arc::new(self.entry_points),
        })
    }
}

fn s_stop(stage: &mut Box<dyn Stage>) {
    stage.stop();
}

impl Chain {
    /// Start every downstream stage, then the source last.
    pub fn start(&mut self) -> crate::error::Result<()> {
        {
            let mut stages = self.stages.lock().unwrap();
            for slot in stages.iter_mut() {
                slot.stage.start()?;
                slot.state = StageState::Running;
            }
        }

        let stages = self.stages.clone();
        let successors = self.successors.clone();
        let entry_points = self.entry_points.clone();

        let sink: Arc<dyn Fn(MediaUnit) + Send + Sync> = Arc::new(move |unit: MediaUnit| {
            for entry in entry_points.iter() {
                dispatch(&stages, &successors, *entry, unit.clone());
            }
        });

        self.source.start(sink)?;
        self.source_state = StageState::Running;
        Ok(())
    }

    /// Stop the source first (breaking its producer loop and guaranteeing
    /// no further `process()` calls arrive), then every stage in order.
    pub fn stop(&mut self) {
        self.source.stop();
        self.source_state = StageState::Stopped;

        let mut stages = self.stages.lock().unwrap();
        for slot in stages.iter_mut() {
            slot.stage.stop();
            slot.state = StageState::Stopped;
        }
    }

    pub fn stage_count(&self) -> usize {
        self.stages.lock().unwrap().len()
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run `unit` through stage `handle` and recursively through its
/// successors. A panicking `process()` is caught and logged rather than
/// unwound through the producer thread, since stages wrap FFI (GStreamer)
/// calls that are not panic-safe across an unwind.
fn dispatch(
    stages: &Arc<Mutex<Vec<StageSlot>>>,
    successors: &Arc<Vec<Vec<StageHandle>>>,
    handle: StageHandle,
    unit: MediaUnit,
) {
    let outputs = {
        let mut guard = stages.lock().unwrap();
        let slot = &mut guard[handle];
        let name = slot.stage.name();
        match panic::catch_unwind(AssertUnwindSafe(|| slot.stage.process(unit))) {
            Ok(outputs) => outputs,
            Err(_) => {
                tracing::warn!(stage = name, "process() panicked; unit dropped");
                Vec::new()
            }
        }
    };

    for out in outputs {
        for &next in &successors[handle] {
            dispatch(stages, successors, next, out.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    struct CountingSource {
        count: usize,
    }

    impl Source for CountingSource {
        fn name(&self) -> &'static str {
            "counting-source"
        }

        fn start(
            &mut self,
            sink: Arc<dyn Fn(MediaUnit) + Send + Sync>,
        ) -> crate::error::Result<()> {
            let count = self.count;
            thread::spawn(move || {
                for i in 0..count {
                    let buf = {
                        let mut b = gstreamer::Buffer::with_size(1).unwrap();
                        b.get_mut()
                            .unwrap()
                            .set_pts(gstreamer::ClockTime::from_nseconds(i as u64));
                        b
                    };
                    sink(MediaUnit::Packet(crate::media_unit::PacketUnit {
                        buffer: buf,
                        stream_index: 0,
                        time_base: gstreamer::Fraction::new(1, 1),
                        keyframe: false,
                    }));
                }
            });
            Ok(())
        }

        fn stop(&mut self) {}
    }

    struct RecordingStage {
        seen: Arc<Mutex<Vec<u64>>>,
    }

    impl Stage for RecordingStage {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn process(&mut self, unit: MediaUnit) -> Vec<MediaUnit> {
            if let Some(pts) = unit.pts() {
                self.seen.lock().unwrap().push(pts.nseconds());
            }
            vec![unit]
        }

        fn stop(&mut self) {}
    }

    #[test]
    fn units_arrive_in_production_order_with_no_duplication() {
        let _ = gstreamer::init();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut builder = ChainBuilder::new(Box::new(CountingSource { count: 20 }));
        let recorder = builder.add_stage(Box::new(RecordingStage { seen: seen.clone() }));
        builder.link_entry(recorder);

        let mut chain = builder.build().unwrap();
        chain.start().unwrap();

        // Give the producer thread time to drain into the synchronous dispatch.
        thread::sleep(Duration::from_millis(200));
        chain.stop();

        let got = seen.lock().unwrap().clone();
        let expected: Vec<u64> = (0..20).collect();
        assert_eq!(got, expected, "sequence must be a contiguous, unreordered prefix");
    }

    #[test]
    fn chain_stop_is_idempotent() {
        let _ = gstreamer::init();
        let mut builder = ChainBuilder::new(Box::new(CountingSource { count: 1 }));
        let n = builder.add_stage(Box::new(NoopStage));
        builder.link_entry(n);
        let mut chain = builder.build().unwrap();
        chain.stop();
        chain.stop();
        chain.stop();
    }

    struct NoopStage;
    impl Stage for NoopStage {
        fn name(&self) -> &'static str {
            "noop"
        }
        fn process(&mut self, unit: MediaUnit) -> Vec<MediaUnit> {
            vec![unit]
        }
        fn stop(&mut self) {}
    }

    #[test]
    fn stop_before_start_does_not_panic() {
        let _ = gstreamer::init();
        let mut builder = ChainBuilder::new(Box::new(CountingSource { count: 0 }));
        let n = builder.add_stage(Box::new(NoopStage));
        builder.link_entry(n);
        let mut chain = builder.build().unwrap();
        chain.stop();
    }
}
