//! Encoder stage: turns frames into compressed packets, with optional
//! hardware upload, a color-conversion pass on format mismatch, in-flight
//! resolution changes, and monotonic PTS stamping.

use std::sync::atomic::{AtomicU64, Ordering};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use crate::error::PipelineError;
use crate::hardware::HardwareAccel;
use crate::latency::LatencyClass;
use crate::media_unit::{MediaUnit, PacketUnit};
use crate::stage::Stage;

/// GOP length.
pub const GOP_SIZE: u32 = 30;
/// Bitrate cap in kbit/s, with a matching VBV buffer capacity.
pub const BITRATE_KBPS: u32 = 4_000;

/// Placeholder for a hardware frame pool (initial size ~20, software format
/// NV12). GStreamer's hardware encoder elements (`nvh264enc`, `vah264enc`) manage
/// their own device-memory pools internally; this struct records the
/// requested size for telemetry/tests rather than driving a raw pool API,
/// since the core never touches hardware memory directly once the encoder
/// element owns it.
#[derive(Debug, Clone, Copy)]
pub struct HardwareFramePool {
    pub capacity: usize,
}

impl Default for HardwareFramePool {
    fn default() -> Self {
        Self { capacity: 20 }
    }
}

struct PipelineHandles {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    converter: Option<(gst_video::VideoFormat, u32, u32, gst_video::VideoConverter)>,
}

/// Encoder stage. `expected_format` is the software pixel format the
/// encoder was configured for (NV12 when hardware is in use for the
/// upload step, I420 for the pure-software path).
pub struct Encoder {
    hw: HardwareAccel,
    width: u32,
    height: u32,
    fps: u32,
    active_hw: HardwareAccel,
    frame_pool: Option<HardwareFramePool>,
    handles: Option<PipelineHandles>,
    next_pts: AtomicU64,
    latency: LatencyClass,
}

impl Encoder {
    pub fn new(hw: HardwareAccel, width: u32, height: u32, fps: u32, latency: LatencyClass) -> Self {
        Self {
            hw,
            width,
            height,
            fps: fps.max(1),
            active_hw: HardwareAccel::None,
            frame_pool: None,
            handles: None,
            next_pts: AtomicU64::new(0),
            latency,
        }
    }

    pub fn active_hardware(&self) -> HardwareAccel {
        self.active_hw
    }

    fn expected_format(&self) -> gst_video::VideoFormat {
        if self.active_hw != HardwareAccel::None {
            gst_video::VideoFormat::Nv12
        } else {
            gst_video::VideoFormat::I420 // YUV 4:2:0 software path
        }
    }

    /// Build the encode pipeline at the given dimensions. Called both from
    /// `initialize()` and from `process()` when a screen-source resolution
    /// change is discovered on a live frame.
    fn build_pipeline(&mut self, width: u32, height: u32) -> crate::error::Result<()> {
        let pipeline = gst::Pipeline::new();

        let format = if self.hw != HardwareAccel::None && self.hw.is_available() {
            gst_video::VideoFormat::Nv12
        } else {
            gst_video::VideoFormat::I420
        };

        let appsrc = gst_app::AppSrc::builder()
            .is_live(true)
            .format(gst::Format::Time)
            .caps(
                &gst_video::VideoInfo::builder(format, width, height)
                    .fps(gst::Fraction::new(self.fps as i32, 1))
                    .build()
                    .unwrap()
                    .to_caps()
                    .unwrap(),
            )
            .build();

        let (encoder_elem, active_hw) = if self.hw != HardwareAccel::None && self.hw.is_available() {
            if let Some(name) = self.hw.encoder_element() {
                if let Ok(elem) = gst::ElementFactory::make(name).build() {
                    (Some(elem), self.hw)
                } else {
                    (None, HardwareAccel::None)
                }
            } else {
                (None, HardwareAccel::None)
            }
        } else {
            (None, HardwareAccel::None)
        };

        let encoder_elem = match encoder_elem {
            Some(elem) => {
                self.configure_hardware_encoder(&elem, active_hw);
                self.frame_pool = Some(HardwareFramePool::default());
                elem
            }
            None => {
                let elem = gst::ElementFactory::make("x264enc")
                    .build()
                    .map_err(|_| PipelineError::init("missing element: x264enc"))?;
                self.configure_x264(&elem);
                elem
            }
        };
        self.active_hw = active_hw;

        let parse = gst::ElementFactory::make("h264parse")
            .build()
            .map_err(|_| PipelineError::init("missing element: h264parse"))?;
        // config-interval=-1: re-emit SPS/PPS on every IDR. Do NOT use the
        // global header flag -- streaming servers must see SPS/PPS at
        // every IDR.
        parse.set_property_from_str("config-interval", "-1");

        let capsfilter = gst::ElementFactory::make("capsfilter")
            .build()
            .map_err(|_| PipelineError::init("missing element: capsfilter"))?;
        capsfilter.set_property(
            "caps",
            &gst::Caps::builder("video/x-h264")
                .field("stream-format", "byte-stream")
                .field("alignment", "au")
                .build(),
        );

        let appsink = gst_app::AppSink::builder().sync(false).max_buffers(8).drop(false).build();

        pipeline
            .add_many([
                appsrc.upcast_ref(),
                &encoder_elem,
                &parse,
                &capsfilter,
                appsink.upcast_ref(),
            ])
            .map_err(|e| PipelineError::init(format!("failed to assemble encoder pipeline: {e}")))?;
        gst::Element::link_many([
            appsrc.upcast_ref(),
            &encoder_elem,
            &parse,
            &capsfilter,
            appsink.upcast_ref(),
        ])
        .map_err(|e| PipelineError::init(format!("failed to link encoder pipeline: {e}")))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| PipelineError::init(format!("failed to start encoder pipeline: {e}")))?;

        self.width = width;
        self.height = height;
        self.handles = Some(PipelineHandles {
            pipeline,
            appsrc,
            appsink,
            converter: None,
        });
        Ok(())
    }

    /// Software x264: preset=ultrafast/veryfast, tune=zerolatency,
    /// repeat-headers=1, cbr, cfr. UltraLow gets the faster preset.
    fn configure_x264(&self, elem: &gst::Element) {
        let preset = if self.latency == LatencyClass::UltraLow {
            "ultrafast"
        } else {
            "veryfast"
        };
        elem.set_property_from_str("speed-preset", preset);
        elem.set_property_from_str("tune", "zerolatency");
        elem.set_property("key-int-max", GOP_SIZE);
        elem.set_property("bframes", 0u32);
        elem.set_property("bitrate", BITRATE_KBPS);
        elem.set_property("vbv-buf-capacity", BITRATE_KBPS); // matching VBV
        elem.try_set_property("cabac", true).ok();
        elem.try_set_property_from_str("rc-lookahead", "0").ok();
        // repeat-headers: every IDR carries SPS/PPS in-band.
        elem.try_set_property("repeat-headers", true).ok();
    }

    /// NVIDIA hardware encoders: ultra-low-latency preset, CBR,
    /// forced-idr=1, repeat_headers=1, zero internal delay.
    fn configure_hardware_encoder(&self, elem: &gst::Element, hw: HardwareAccel) {
        elem.set_property("bitrate", BITRATE_KBPS);
        elem.try_set_property("gop-size", GOP_SIZE as i32).ok();
        match hw {
            HardwareAccel::Nvidia => {
                elem.try_set_property_from_str("preset", "low-latency-hq").ok();
                elem.try_set_property_from_str("rc-mode", "cbr").ok();
                elem.try_set_property("zerolatency", true).ok();
                elem.try_set_property("repeat-sequence-header", true).ok();
            }
            HardwareAccel::Vaapi => {
                elem.try_set_property_from_str("rate-control", "cbr").ok();
            }
            _ => {}
        }
    }
}

impl Stage for Encoder {
    fn name(&self) -> &'static str {
        "encoder"
    }

    fn initialize(&mut self) -> crate::error::Result<()> {
        gst::init().map_err(|e| PipelineError::init(format!("gst::init failed: {e}")))?;
        if self.width == 0 || self.height == 0 {
            // Target dimensions are not yet known (e.g. a screen source
            // whose resolution is only discovered on the first captured
            // frame). Defer building the codec context to `process()`'s
            // resolution-change path, which already handles the
            // `handles == None` case.
            return Ok(());
        }
        self.build_pipeline(self.width, self.height)
    }

    fn process(&mut self, unit: MediaUnit) -> Vec<MediaUnit> {
        let Some(frame) = unit.as_frame() else {
            return Vec::new();
        };

        // Step 3: screen-source resolution change discovered on a live
        // frame -- tear down and rebuild the codec context at the new
        // size, preserving fps.
        if frame.width != self.width || frame.height != self.height {
            tracing::info!(
                old_w = self.width,
                old_h = self.height,
                new_w = frame.width,
                new_h = frame.height,
                "encoder: resolution changed, rebuilding codec context"
            );
            if let Some(handles) = self.handles.take() {
                let _ = handles.appsrc.end_of_stream();
                let _ = handles.pipeline.set_state(gst::State::Null);
            }
            if let Err(e) = self.build_pipeline(frame.width, frame.height) {
                tracing::warn!(error = %e, "encoder: failed to rebuild pipeline after resolution change");
                return Vec::new();
            }
        }

        let Some(handles) = self.handles.as_mut() else {
            return Vec::new();
        };
        let Some(mut buffer) = frame.buffer() else {
            return Vec::new();
        };

        // Step 1: color-conversion pass if the incoming format differs
        // from both the software and hardware expected formats.
        let expected = self.expected_format();
        if frame.format != expected {
            let needs_rebuild = handles
                .converter
                .as_ref()
                .map(|(fmt, w, h, _)| *fmt != frame.format || *w != frame.width || *h != frame.height)
                .unwrap_or(true);
            if needs_rebuild {
                let in_info =
                    gst_video::VideoInfo::builder(frame.format, frame.width, frame.height)
                        .build()
                        .unwrap();
                let out_info = gst_video::VideoInfo::builder(expected, frame.width, frame.height)
                    .build()
                    .unwrap();
                if let Ok(conv) = gst_video::VideoConverter::new(&in_info, &out_info, gst::Structure::new_empty("config")) {
                    handles.converter = Some((frame.format, frame.width, frame.height, conv));
                }
            }
            if let Some((_, _, _, conv)) = handles.converter.as_mut() {
                let in_info =
                    gst_video::VideoInfo::builder(frame.format, frame.width, frame.height)
                        .build()
                        .unwrap();
                let out_info = gst_video::VideoInfo::builder(expected, frame.width, frame.height)
                    .build()
                    .unwrap();
                if let (Ok(src_frame), Ok(mut out_buf)) = (
                    gst_video::VideoFrameRef::from_buffer_ref_readable(&buffer, &in_info),
                    gst::Buffer::with_size(out_info.size()),
                ) {
                    if let Some(b) = out_buf.get_mut() {
                        if let Ok(mut dst_frame) =
                            gst_video::VideoFrameRef::from_buffer_ref_writable(b, &out_info)
                        {
                            conv.frame(&src_frame, &mut dst_frame);
                        }
                    }
                    buffer = out_buf;
                }
            }
        }
        // Step 2 (hardware upload) is implicit: once the buffer above is in
        // the expected software format, pushing it into the hardware
        // encoder element's `appsrc` triggers GStreamer's own upload path
        // (`gst::Memory` feature negotiation) -- the core does not manage
        // hardware surfaces directly.

        // Step 4: stamp a monotonically increasing PTS, rejecting the
        // incoming one -- the encoder must produce a strictly ordered
        // stream independent of source jitter.
        let idx = self.next_pts.fetch_add(1, Ordering::SeqCst);
        let pts = gst::ClockTime::from_nseconds(idx * (1_000_000_000 / self.fps as u64));
        buffer.make_mut().set_pts(pts);

        // Step 5: send-and-drain.
        if handles.appsrc.push_buffer(buffer).is_err() {
            tracing::warn!("encoder: push_buffer failed, dropping frame");
            return Vec::new();
        }

        let mut out = Vec::new();
        while let Some(sample) = handles.appsink.try_pull_sample(gst::ClockTime::ZERO) {
            let Some(pkt_buffer) = sample.buffer_owned() else {
                continue;
            };
            let keyframe = !pkt_buffer.flags().contains(gst::BufferFlags::DELTA_UNIT);
            out.push(MediaUnit::Packet(PacketUnit {
                buffer: pkt_buffer,
                stream_index: 0,
                time_base: gst::Fraction::new(1, self.fps as i32),
                keyframe,
            }));
        }
        out
    }

    fn stop(&mut self) {
        if let Some(handles) = self.handles.take() {
            // Flush by sending EOS; any packets already queued are drained
            // by the pipeline's own EOS handling.
            let _ = handles.appsrc.end_of_stream();
            let _ = handles.pipeline.set_state(gst::State::Null);
        }
    }

    fn latency_class(&self) -> LatencyClass {
        self.latency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_path_defaults_to_i420() {
        let e = Encoder::new(HardwareAccel::None, 1920, 1080, 30, LatencyClass::Standard);
        assert_eq!(e.expected_format(), gst_video::VideoFormat::I420);
    }

    #[test]
    fn pts_counter_starts_at_zero_and_only_moves_forward() {
        let e = Encoder::new(HardwareAccel::None, 640, 480, 30, LatencyClass::Standard);
        let a = e.next_pts.fetch_add(1, Ordering::SeqCst);
        let b = e.next_pts.fetch_add(1, Ordering::SeqCst);
        assert!(b > a);
    }

    #[test]
    fn hardware_frame_pool_default_capacity_is_twenty() {
        assert_eq!(HardwareFramePool::default().capacity, 20);
    }
}
