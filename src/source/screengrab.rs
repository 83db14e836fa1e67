//! Live desktop capture source, grounded in the teacher's
//! `src/capture/wayland.rs` portal + `pipewiresrc` pipeline. Differs from
//! [`super::demuxer::Demuxer`] in that raw frames arrive via an `appsink`
//! `new-sample` callback firing on a GStreamer streaming thread foreign to
//! this stage — a genuinely external capture subsystem delivering frames on
//! an unknown thread — so a bounded, drop-oldest queue plus a dedicated
//! worker thread sit between that callback and `next`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use crate::error::{PipelineError, Result};
use crate::latency::LatencyClass;
use crate::media_unit::{FrameUnit, MediaUnit};
use crate::stage::Source;

/// Source pixel format as delivered by the capture subsystem: ARGB/XRGB and
/// ABGR/XBGR both normalize to RGBA, BGRA/BGRX stays BGRA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourcePixelFormat {
    Rgba,
    Bgra,
}

impl SourcePixelFormat {
    fn from_caps_format(name: &str) -> Option<Self> {
        match name {
            "ARGB" | "xRGB" | "ABGR" | "xBGR" => Some(SourcePixelFormat::Rgba),
            "BGRA" | "BGRx" => Some(SourcePixelFormat::Bgra),
            _ => None,
        }
    }

    fn as_gst_video_format(self) -> gst_video::VideoFormat {
        match self {
            SourcePixelFormat::Rgba => gst_video::VideoFormat::Rgba,
            SourcePixelFormat::Bgra => gst_video::VideoFormat::Bgra,
        }
    }
}

/// One captured, standalone raw frame: a copy of the subsystem's buffer (so
/// the producing library can recycle freely) plus its own geometry.
struct RawFrame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    stride: i32,
    format: SourcePixelFormat,
    captured_at: Instant,
}

struct RawQueue {
    frames: VecDeque<RawFrame>,
    depth: usize,
}

impl RawQueue {
    fn push(&mut self, frame: RawFrame) {
        while self.frames.len() >= self.depth {
            self.frames.pop_front(); // oldest evicted on overflow
        }
        self.frames.push_back(frame);
    }
}

/// Live desktop capture source.
pub struct ScreenGrab {
    display: Option<String>,
    latency: LatencyClass,
    fps: u32,
    pipeline: Option<gst::Pipeline>,
    running: Arc<AtomicBool>,
    capture_join: Option<JoinHandle<()>>,
    worker_join: Option<JoinHandle<()>>,
    queue: Arc<(Mutex<RawQueue>, Condvar)>,
    frame_index: Arc<AtomicU64>,
    last_callback_at: Arc<Mutex<Option<Instant>>>,
}

impl ScreenGrab {
    /// `spec` is the `screen` or `screen:<display>` source string from the
    /// command surface.
    pub fn new(spec: &str, latency: LatencyClass, fps: u32) -> Self {
        let display = spec
            .strip_prefix("screen:")
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        Self {
            display,
            latency,
            fps: fps.max(1),
            pipeline: None,
            running: Arc::new(AtomicBool::new(false)),
            capture_join: None,
            worker_join: None,
            queue: Arc::new((
                Mutex::new(RawQueue {
                    frames: VecDeque::new(),
                    depth: latency.capture_queue_depth(),
                }),
                Condvar::new(),
            )),
            frame_index: Arc::new(AtomicU64::new(0)),
            last_callback_at: Arc::new(Mutex::new(None)),
        }
    }

    /// Negotiates an XDG Desktop Portal screencast session and returns the
    /// PipeWire node id + remote fd, mirroring the teacher's
    /// `capture_gstreamer`. Run on a throwaway current-thread Tokio runtime
    /// since `Source::start` is a synchronous entry point.
    #[cfg(target_os = "linux")]
    fn negotiate_portal(&self) -> Result<(u32, std::os::fd::OwnedFd)> {
        use ashpd::desktop::screencast::{CursorMode, Screencast, SourceType};
        use ashpd::desktop::PersistMode;

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| PipelineError::init(format!("failed to start portal runtime: {e}")))?;

        rt.block_on(async {
            let proxy = Screencast::new()
                .await
                .map_err(|e| PipelineError::init(format!("portal unavailable: {e}")))?;
            let session = proxy
                .create_session()
                .await
                .map_err(|e| PipelineError::init(format!("portal session failed: {e}")))?;
            proxy
                .select_sources(
                    &session,
                    CursorMode::Embedded,
                    SourceType::Monitor.into(),
                    false,
                    None,
                    PersistMode::DoNot,
                )
                .await
                .map_err(|e| PipelineError::init(format!("select_sources failed: {e}")))?;
            let start = proxy
                .start(&session, None)
                .await
                .map_err(|e| PipelineError::init(format!("portal start failed: {e}")))?;
            let streams = start
                .response()
                .map_err(|e| PipelineError::init(format!("portal response failed: {e}")))?;
            let stream = streams
                .streams()
                .first()
                .cloned()
                .ok_or_else(|| PipelineError::init("portal returned no streams"))?;
            let node_id = stream.pipe_wire_node_id();
            let fd = proxy
                .open_pipe_wire_remote(&session)
                .await
                .map_err(|e| PipelineError::init(format!("open_pipe_wire_remote failed: {e}")))?;
            Ok((node_id, fd))
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn negotiate_portal(&self) -> Result<(u32, i32)> {
        Err(PipelineError::init(
            "screen capture via XDG portal is only implemented on Linux",
        ))
    }

    /// Lazily builds/reuses a converter targeting NV12 with BT.709
    /// coefficients, source full-range RGB, destination limited-range YUV.
    /// Reused across frames unless the source geometry/format changes.
    fn build_converter(
        src_format: SourcePixelFormat,
        width: u32,
        height: u32,
    ) -> gst_video::VideoConverter {
        let in_info = gst_video::VideoInfo::builder(
            src_format.as_gst_video_format(),
            width,
            height,
        )
        .build()
        .expect("valid source video info");

        let out_info = gst_video::VideoInfo::builder(gst_video::VideoFormat::Nv12, width, height)
            .build()
            .expect("valid NV12 video info");

        let config = gst::Structure::builder("GstVideoConverterConfig")
            .field("GstVideoColorMatrix", "bt709")
            .field("GstVideoRangeEnum.src", "full")
            .field("GstVideoRangeEnum.dest", "limited")
            .build();

        gst_video::VideoConverter::new(&in_info, &out_info, config)
            .expect("video converter construction")
    }
}

impl Source for ScreenGrab {
    fn name(&self) -> &'static str {
        "screengrab"
    }

    fn initialize(&mut self) -> Result<()> {
        gst::init().map_err(|e| PipelineError::init(format!("gst::init failed: {e}")))?;
        Ok(())
    }

    fn start(&mut self, sink: Arc<dyn Fn(MediaUnit) + Send + Sync>) -> Result<()> {
        let (node_id, pw_fd) = self.negotiate_portal()?;

        let pipeline = gst::Pipeline::new();
        let src = gst::ElementFactory::make("pipewiresrc")
            .build()
            .map_err(|_| PipelineError::init("missing element: pipewiresrc"))?;
        #[cfg(target_os = "linux")]
        {
            use std::os::fd::IntoRawFd;
            src.set_property("fd", pw_fd.into_raw_fd());
        }
        src.set_property("path", format!("{node_id}"));

        let appsink = gst_app::AppSink::builder()
            .sync(false)
            .max_buffers(1)
            .drop(true)
            .build();

        pipeline
            .add_many([&src, appsink.upcast_ref()])
            .map_err(|e| PipelineError::init(format!("failed to assemble capture pipeline: {e}")))?;
        src.link(appsink.upcast_ref())
            .map_err(|e| PipelineError::init(format!("failed to link capture pipeline: {e}")))?;

        let raw_queue = self.queue.clone();
        let min_interval = Duration::from_secs_f64((1.0 / self.fps as f64 - 0.002).max(0.0));
        let last_callback_at = self.last_callback_at.clone();
        let running = self.running.clone();

        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let caps = sample.caps().ok_or(gst::FlowError::Error)?;
                    let info = gst_video::VideoInfo::from_caps(caps).map_err(|_| gst::FlowError::Error)?;

                    let now = Instant::now();
                    let mut last = last_callback_at.lock().unwrap();
                    if let Some(prev) = *last {
                        if now.duration_since(prev) < min_interval {
                            // Frame-rate gate: drop callbacks that arrive
                            // too close to the previous one.
                            return Ok(gst::FlowSuccess::Ok);
                        }
                    }
                    *last = Some(now);
                    drop(last);

                    let Some(format) = SourcePixelFormat::from_caps_format(
                        info.format().to_str(),
                    ) else {
                        return Ok(gst::FlowSuccess::Ok);
                    };

                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                    let frame = RawFrame {
                        data: map.as_slice().to_vec(),
                        width: info.width(),
                        height: info.height(),
                        stride: info.stride()[0],
                        format,
                        captured_at: Instant::now(),
                    };
                    drop(map);

                    let (lock, cvar) = &*raw_queue;
                    let mut q = lock.lock().unwrap();
                    q.push(frame);
                    cvar.notify_one();

                    if !running.load(Ordering::SeqCst) {
                        return Err(gst::FlowError::Eos);
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| PipelineError::init(format!("failed to start capture pipeline: {e}")))?;

        self.running.store(true, Ordering::SeqCst);
        self.pipeline = Some(pipeline.clone());

        let running = self.running.clone();
        let queue = self.queue.clone();
        let frame_index = self.frame_index.clone();
        let fps = self.fps;

        self.worker_join = Some(thread::spawn(move || {
            let mut converter: Option<(SourcePixelFormat, u32, u32, gst_video::VideoConverter)> =
                None;

            while running.load(Ordering::SeqCst) {
                let frame = {
                    let (lock, cvar) = &*queue;
                    let mut q = lock.lock().unwrap();
                    while q.frames.is_empty() && running.load(Ordering::SeqCst) {
                        let (guard, timeout) = cvar
                            .wait_timeout(q, Duration::from_millis(200))
                            .unwrap();
                        q = guard;
                        if timeout.timed_out() {
                            break;
                        }
                    }
                    q.frames.pop_front()
                };

                let Some(frame) = frame else { continue };

                if converter
                    .as_ref()
                    .map(|(fmt, w, h, _)| *fmt != frame.format || *w != frame.width || *h != frame.height)
                    .unwrap_or(true)
                {
                    converter = Some((
                        frame.format,
                        frame.width,
                        frame.height,
                        ScreenGrab::build_converter(frame.format, frame.width, frame.height),
                    ));
                }

                let idx = frame_index.fetch_add(1, Ordering::SeqCst);
                let pts = gst::ClockTime::from_nseconds(idx * (1_000_000_000 / fps as u64));

                let in_info = gst_video::VideoInfo::builder(
                    frame.format.as_gst_video_format(),
                    frame.width,
                    frame.height,
                )
                .build()
                .unwrap();
                let mut src_buf = gst::Buffer::with_size(frame.data.len()).unwrap();
                {
                    let b = src_buf.get_mut().unwrap();
                    if let Ok(mut map) = b.map_writable() {
                        map.as_mut_slice().copy_from_slice(&frame.data);
                    }
                }
                let src_frame = match gst_video::VideoFrameRef::from_buffer_ref_readable(
                    &src_buf, &in_info,
                ) {
                    Ok(f) => f,
                    Err(_) => continue,
                };

                let out_info =
                    gst_video::VideoInfo::builder(gst_video::VideoFormat::Nv12, frame.width, frame.height)
                        .build()
                        .unwrap();
                let mut out_buf = gst::Buffer::with_size(out_info.size()).unwrap();
                {
                    let b = out_buf.get_mut().unwrap();
                    b.set_pts(pts);
                    let mut out_frame =
                        match gst_video::VideoFrameRef::from_buffer_ref_writable(b, &out_info) {
                            Ok(f) => f,
                            Err(_) => continue,
                        };
                    if let Some((_, _, _, conv)) = converter.as_mut() {
                        conv.frame(&src_frame, &mut out_frame);
                    }
                }

                let sample = gst::Sample::builder()
                    .buffer(&out_buf)
                    .caps(&out_info.to_caps().unwrap())
                    .build();

                let unit = MediaUnit::Frame(FrameUnit {
                    sample,
                    width: frame.width,
                    height: frame.height,
                    format: gst_video::VideoFormat::Nv12,
                    hardware_resident: false,
                });
                let _elapsed = frame.captured_at.elapsed();
                sink(unit);
            }
        }));

        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
        // Wake the worker's condvar wait so it observes `running == false`
        // promptly rather than waiting out its poll timeout.
        let (lock, cvar) = &*self.queue;
        let _ = lock.lock().unwrap();
        cvar.notify_all();
        if let Some(join) = self.worker_join.take() {
            let _ = join.join();
        }
        if let Some(join) = self.capture_join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_spec_parses_screen_and_screen_colon_display() {
        let g = ScreenGrab::new("screen", LatencyClass::Standard, 30);
        assert_eq!(g.display, None);
        let g = ScreenGrab::new("screen:1", LatencyClass::Standard, 30);
        assert_eq!(g.display, Some("1".to_string()));
    }

    #[test]
    fn source_pixel_format_mapping_normalizes_known_formats() {
        assert_eq!(
            SourcePixelFormat::from_caps_format("ARGB"),
            Some(SourcePixelFormat::Rgba)
        );
        assert_eq!(
            SourcePixelFormat::from_caps_format("BGRA"),
            Some(SourcePixelFormat::Bgra)
        );
        assert_eq!(
            SourcePixelFormat::from_caps_format("ABGR"),
            Some(SourcePixelFormat::Rgba)
        );
        assert_eq!(SourcePixelFormat::from_caps_format("NV12"), None);
    }

    #[test]
    fn queue_depth_follows_latency_class() {
        let g = ScreenGrab::new("screen", LatencyClass::UltraLow, 60);
        assert_eq!(g.queue.0.lock().unwrap().depth, 1);
        let g = ScreenGrab::new("screen", LatencyClass::Standard, 60);
        assert_eq!(g.queue.0.lock().unwrap().depth, 3);
    }
}
