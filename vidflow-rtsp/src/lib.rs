// SPDX-License-Identifier: MIT
//! On-demand RTSP dispatch for a single, already-encoded H.264 elementary stream.
//!
//! This crate hosts one RTSP subsession bound to `(port, mount)` and republishes
//! packets an upstream encoder has already produced — it does not encode, scale,
//! or otherwise touch pixels. The design mirrors `gstreamer-rtsp-server`'s
//! shared-pipeline model: one `appsrc`-fed pipeline serves every client, and a
//! bounded, drop-oldest packet queue sits between the pipeline core and the
//! GStreamer event loop so a slow or disconnected client can never grow memory.
//!
//! ## Pipeline
//!
//! ```text
//! appsrc (byte-stream H.264) ! h264parse config-interval=-1 ! rtph264pay name=pay0
//! ```
//!
//! `h264parse` with `config-interval=-1` re-emits SPS/PPS from the stream itself
//! rather than caching them once, which matters here because every IDR produced
//! upstream already carries in-band parameter sets (the encoder never uses the
//! "global header" flag) and clients may attach mid-stream.
//!
//! ## Queue discipline
//!
//! The queue is a hard cap of 10 packets (~300ms at 30fps). `push` evicts from
//! the head when full before enqueueing the new packet — the low-latency-correct
//! policy under sustained overload is to keep the newest data, not the oldest.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use glib::MainContext;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_rtsp_server::prelude::*;
use gstreamer_rtsp_server::{RTSPMediaFactory, RTSPServer};
use once_cell::sync::OnceCell;

/// Hard cap on the packet queue depth (spec: ~300ms of buffering at 30fps).
pub const MAX_QUEUE_DEPTH: usize = 10;

/// Minimum `appsrc` max-output-buffer-size: 1080p IDRs routinely exceed a few
/// hundred KB, so the default (much smaller) library buffer must be raised.
pub const MIN_OUTPUT_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// One already-encoded access unit, ready for RTP packetization.
#[derive(Clone)]
pub struct EncodedPacket {
    /// Annex-B byte-stream H.264 access unit (in-band SPS/PPS on every IDR).
    pub data: Arc<Vec<u8>>,
    /// True if this access unit starts with an IDR NAL.
    pub keyframe: bool,
}

impl EncodedPacket {
    pub fn new(data: Vec<u8>, keyframe: bool) -> Self {
        Self {
            data: Arc::new(data),
            keyframe,
        }
    }
}

/// Bounded, drop-oldest packet queue shared between the producer (pipeline
/// core) and the RTSP dispatch thread.
struct PacketQueue {
    packets: VecDeque<EncodedPacket>,
    evicted_total: u64,
}

impl PacketQueue {
    fn new() -> Self {
        Self {
            packets: VecDeque::with_capacity(MAX_QUEUE_DEPTH),
            evicted_total: 0,
        }
    }

    /// Push a packet, evicting from the head while at capacity.
    fn push(&mut self, packet: EncodedPacket) {
        while self.packets.len() >= MAX_QUEUE_DEPTH {
            self.packets.pop_front();
            self.evicted_total += 1;
        }
        self.packets.push_back(packet);
    }

    fn pop_front(&mut self) -> Option<EncodedPacket> {
        self.packets.pop_front()
    }

    fn len(&self) -> usize {
        self.packets.len()
    }
}

/// Copy `packet` into a fixed-capacity buffer, truncating (never splitting)
/// if the packet is larger than `max_len`. The receiver resynchronizes on the
/// next packet when truncation occurs, which is safe because every IDR is
/// self-contained (in-band parameter sets).
fn copy_truncated(packet: &EncodedPacket, max_len: usize) -> (&[u8], usize) {
    let data = packet.data.as_slice();
    if data.len() > max_len {
        (&data[..max_len], data.len() - max_len)
    } else {
        (data, 0)
    }
}

fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Configuration for one RTSP dispatch endpoint.
pub struct StreamServerConfig {
    pub port: u16,
    pub mount: String,
    pub max_output_buffer_size: usize,
}

impl StreamServerConfig {
    pub fn new(port: u16, stream_name: impl Into<String>) -> Self {
        let mount = {
            let name = stream_name.into();
            if name.starts_with('/') {
                name
            } else {
                format!("/{name}")
            }
        };
        Self {
            port,
            mount,
            max_output_buffer_size: MIN_OUTPUT_BUFFER_SIZE,
        }
    }
}

struct Shared {
    appsrc: Option<gst_app::AppSrc>,
    queue: PacketQueue,
}

/// A running RTSP dispatch endpoint. `process()` is the `Stage::process`
/// counterpart the pipeline core calls; `stop()` tears down the event-loop
/// thread and joins it.
pub struct StreamServer {
    shared: Arc<Mutex<Shared>>,
    watch: Arc<OnceCell<gstreamer_rtsp_server::RTSPServer>>,
    running: Arc<std::sync::atomic::AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
    url: String,
}

impl StreamServer {
    /// Bind and start serving; spawns the GLib main-loop thread.
    pub fn start(cfg: StreamServerConfig) -> Result<Self> {
        gst::init().context("gstreamer init failed")?;

        let shared = Arc::new(Mutex::new(Shared {
            appsrc: None,
            queue: PacketQueue::new(),
        }));
        let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let watch_cell: Arc<OnceCell<gstreamer_rtsp_server::RTSPServer>> = Arc::new(OnceCell::new());

        let launch = "appsrc name=src is-live=true format=time do-timestamp=true \
             caps=video/x-h264,stream-format=byte-stream,alignment=au \
             ! h264parse config-interval=-1 ! rtph264pay name=pay0 pt=96"
            .to_string();

        let max_buf = cfg.max_output_buffer_size.max(MIN_OUTPUT_BUFFER_SIZE);
        let port = cfg.port;
        let mount = cfg.mount.clone();
        let url = format!("rtsp://0.0.0.0:{port}{mount}");

        let shared_for_thread = shared.clone();
        let running_for_thread = running.clone();
        let watch_for_thread = watch_cell.clone();

        let join = thread::spawn(move || {
            let ctx = MainContext::new();
            let _guard = match ctx.acquire() {
                Ok(g) => g,
                Err(e) => {
                    tracing::error!("failed to acquire GLib main context: {e}");
                    return;
                }
            };
            let mainloop = glib::MainLoop::new(Some(&ctx), false);

            let server = RTSPServer::new();
            server.set_service(&port.to_string());
            if RTSPServerExtManual::attach(&server, Some(&ctx)).is_err() {
                tracing::error!("failed to attach RTSP server to main context");
                return;
            }

            let mounts = server.mount_points().expect("rtsp server has no mount points");
            let factory = RTSPMediaFactory::new();
            factory.set_shared(true);
            factory.set_launch(&launch);

            let shared_cb = shared_for_thread.clone();
            factory.connect_media_configure(move |_, media| {
                if let Ok(bin) = media.element().downcast::<gst::Bin>() {
                    if let Some(src) = bin.by_name("src") {
                        if let Ok(appsrc) = src.downcast::<gst_app::AppSrc>() {
                            appsrc.set_max_bytes(max_buf as u64);
                            let mut s = shared_cb.lock().unwrap();
                            s.appsrc = Some(appsrc);
                        }
                    }
                }
            });

            mounts.add_factory(&mount, factory);
            let _ = watch_for_thread.set(server.clone());

            tracing::info!(%url, "rtsp endpoint ready");

            // Dispatch loop: pull from the shared queue on a GLib timeout so the
            // main loop keeps servicing RTSP control traffic concurrently.
            let shared_poll = shared_for_thread.clone();
            let running_poll = running_for_thread.clone();
            glib::timeout_add_local(Duration::from_millis(5), move || {
                if !running_poll.load(std::sync::atomic::Ordering::Acquire) {
                    return glib::ControlFlow::Break;
                }
                let mut s = shared_poll.lock().unwrap();
                if let Some(packet) = s.queue.pop_front() {
                    if let Some(appsrc) = s.appsrc.clone() {
                        drop(s);
                        push_packet(&appsrc, &packet, max_buf);
                    }
                }
                glib::ControlFlow::Continue
            });

            mainloop.run();
        });

        Ok(Self {
            shared,
            watch: watch_cell,
            running,
            join: Some(join),
            url,
        })
    }

    /// `Stage::process` counterpart: enqueue a fully-encoded packet. Never
    /// blocks; evicts the oldest queued packet if at capacity.
    pub fn process(&self, packet: EncodedPacket) {
        let mut s = self.shared.lock().unwrap();
        s.queue.push(packet);
    }

    /// Current queue depth, for tests and telemetry.
    pub fn queue_len(&self) -> usize {
        self.shared.lock().unwrap().queue.len()
    }

    /// Total packets evicted due to overflow, for telemetry.
    pub fn evicted_total(&self) -> u64 {
        self.shared.lock().unwrap().queue.evicted_total
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Idempotent; flips the watch flag and joins the event-loop thread.
    pub fn stop(&mut self) {
        self.running
            .store(false, std::sync::atomic::Ordering::Release);
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn push_packet(appsrc: &gst_app::AppSrc, packet: &EncodedPacket, max_len: usize) {
    let (bytes, truncated) = copy_truncated(packet, max_len);
    if truncated > 0 {
        tracing::warn!(
            truncated_bytes = truncated,
            "RTSP packet exceeded max-output-buffer-size; truncated (receiver resyncs on next packet)"
        );
    }
    let mut buffer = match gst::Buffer::with_size(bytes.len()) {
        Ok(b) => b,
        Err(_) => return,
    };
    {
        let bufref = buffer.get_mut().unwrap();
        bufref.set_pts(gst::ClockTime::from_nseconds(wall_clock_ns()));
        if let Ok(mut map) = bufref.map_writable() {
            map.as_mut_slice().copy_from_slice(bytes);
        }
    }
    let _ = appsrc.push_buffer(buffer);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_evicts_oldest_past_cap() {
        let mut q = PacketQueue::new();
        for i in 0..200 {
            q.push(EncodedPacket::new(vec![i as u8], i % 30 == 0));
        }
        assert_eq!(q.len(), MAX_QUEUE_DEPTH);
        assert_eq!(q.evicted_total, 190);
    }

    #[test]
    fn queue_preserves_fifo_order_within_cap() {
        let mut q = PacketQueue::new();
        for i in 0..5u8 {
            q.push(EncodedPacket::new(vec![i], false));
        }
        let first = q.pop_front().unwrap();
        assert_eq!(first.data[0], 0);
    }

    #[test]
    fn truncation_never_splits_keeps_prefix() {
        let packet = EncodedPacket::new(vec![7u8; 100], true);
        let (bytes, truncated) = copy_truncated(&packet, 40);
        assert_eq!(bytes.len(), 40);
        assert_eq!(truncated, 60);
        assert!(bytes.iter().all(|&b| b == 7));
    }

    #[test]
    fn no_truncation_when_under_limit() {
        let packet = EncodedPacket::new(vec![1, 2, 3], false);
        let (bytes, truncated) = copy_truncated(&packet, 40);
        assert_eq!(bytes, &[1, 2, 3]);
        assert_eq!(truncated, 0);
    }

    #[test]
    fn mount_path_normalizes_leading_slash() {
        let cfg = StreamServerConfig::new(8554, "live");
        assert_eq!(cfg.mount, "/live");
        let cfg2 = StreamServerConfig::new(8554, "/live");
        assert_eq!(cfg2.mount, "/live");
    }
}
