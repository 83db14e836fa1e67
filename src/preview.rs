//! PreviewSink stage: converts decoded frames to a display-friendly pixel
//! format and hands them to an externally supplied surface.
//!
//! Grounded in the teacher's portal/pipewire capture path for the
//! build/rebuild-converter-on-geometry-change pattern, and in
//! `rdp-capture::frame::PixelFormat` (pack example
//! `olafkfreund-cosmic-rdp-server`) for the choice of BGRA as the
//! display-friendly 32-bit RGB layout.

use std::sync::{Mutex, Weak};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_video as gst_video;

use crate::latency::LatencyClass;
use crate::media_unit::MediaUnit;
use crate::stage::Stage;

/// The externally supplied surface the core hands decoded, display-native
/// frames to. GUI wiring of a concrete implementation is out of scope for
/// this crate — this trait is the sink's only contract with the outside
/// world.
pub trait PreviewSurface: Send + Sync {
    fn present(&self, width: u32, height: u32, stride: u32, bgra: &[u8]);
}

struct ConverterState {
    format: gst_video::VideoFormat,
    width: u32,
    height: u32,
    converter: gst_video::VideoConverter,
}

/// Converts decoded frames to BGRA and publishes them to a weakly held
/// surface. If the surface is destroyed first, the sink observes the
/// destruction event and nulls the pointer; subsequent frames are silently
/// dropped. A `Weak` reference gives us that for free: once the strong
/// owner drops the surface, `upgrade()` starts failing and we latch `lost`
/// so we stop paying for the upgrade attempt on every frame.
pub struct PreviewSink {
    surface: Mutex<Option<Weak<dyn PreviewSurface>>>,
    lost: std::sync::atomic::AtomicBool,
    converter: Mutex<Option<ConverterState>>,
}

impl PreviewSink {
    pub fn new(surface: Weak<dyn PreviewSurface>) -> Self {
        Self {
            surface: Mutex::new(Some(surface)),
            lost: std::sync::atomic::AtomicBool::new(false),
            converter: Mutex::new(None),
        }
    }

    pub fn surface_lost(&self) -> bool {
        self.lost.load(std::sync::atomic::Ordering::Acquire)
    }
}

impl Stage for PreviewSink {
    fn name(&self) -> &'static str {
        "preview_sink"
    }

    fn process(&mut self, unit: MediaUnit) -> Vec<MediaUnit> {
        if self.lost.load(std::sync::atomic::Ordering::Acquire) {
            return Vec::new();
        }
        let Some(frame) = unit.as_frame() else {
            return Vec::new();
        };

        let surface = {
            let guard = self.surface.lock().unwrap();
            guard.as_ref().and_then(Weak::upgrade)
        };
        let Some(surface) = surface else {
            // Surface destroyed: null the pointer and stop trying.
            *self.surface.lock().unwrap() = None;
            self.lost.store(true, std::sync::atomic::Ordering::Release);
            tracing::warn!("preview sink: surface lost, dropping frames from now on");
            return Vec::new();
        };

        let Some(buffer) = frame.buffer() else {
            return Vec::new();
        };

        let out_info =
            match gst_video::VideoInfo::builder(gst_video::VideoFormat::Bgra, frame.width, frame.height)
                .build()
            {
                Ok(info) => info,
                Err(_) => return Vec::new(),
            };

        if frame.format == gst_video::VideoFormat::Bgra {
            if let Ok(map) = buffer.map_readable() {
                surface.present(frame.width, frame.height, frame.width * 4, map.as_slice());
            }
            return Vec::new();
        }

        let in_info = match gst_video::VideoInfo::builder(frame.format, frame.width, frame.height).build() {
            Ok(info) => info,
            Err(_) => return Vec::new(),
        };

        let mut state = self.converter.lock().unwrap();
        let needs_rebuild = state
            .as_ref()
            .map(|s| s.format != frame.format || s.width != frame.width || s.height != frame.height)
            .unwrap_or(true);
        if needs_rebuild {
            match gst_video::VideoConverter::new(&in_info, &out_info, gst::Structure::new_empty("config")) {
                Ok(converter) => {
                    *state = Some(ConverterState {
                        format: frame.format,
                        width: frame.width,
                        height: frame.height,
                        converter,
                    });
                }
                Err(_) => return Vec::new(),
            }
        }

        let Some(state) = state.as_mut() else {
            return Vec::new();
        };

        let Ok(src_frame) = gst_video::VideoFrameRef::from_buffer_ref_readable(&buffer, &in_info) else {
            return Vec::new();
        };
        let Ok(mut out_buf) = gst::Buffer::with_size(out_info.size()) else {
            return Vec::new();
        };
        {
            let Some(out_buf_mut) = out_buf.get_mut() else {
                return Vec::new();
            };
            let Ok(mut dst_frame) =
                gst_video::VideoFrameRef::from_buffer_ref_writable(out_buf_mut, &out_info)
            else {
                return Vec::new();
            };
            state.converter.frame(&src_frame, &mut dst_frame);
        }

        if let Ok(map) = out_buf.map_readable() {
            surface.present(frame.width, frame.height, frame.width * 4, map.as_slice());
        }
        Vec::new() // terminal stage
    }

    fn stop(&mut self) {}

    fn latency_class(&self) -> LatencyClass {
        LatencyClass::UltraLow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    struct RecordingSurface {
        frames: StdMutex<Vec<(u32, u32)>>,
    }

    impl PreviewSurface for RecordingSurface {
        fn present(&self, width: u32, height: u32, _stride: u32, _bgra: &[u8]) {
            self.frames.lock().unwrap().push((width, height));
        }
    }

    fn dummy_bgra_frame(width: u32, height: u32, pts: u64) -> MediaUnit {
        let _ = gst::init();
        let out_info = gst_video::VideoInfo::builder(gst_video::VideoFormat::Bgra, width, height)
            .build()
            .unwrap();
        let mut buf = gst::Buffer::with_size(out_info.size()).unwrap();
        buf.get_mut().unwrap().set_pts(gst::ClockTime::from_nseconds(pts));
        let sample = gst::Sample::builder().buffer(&buf).caps(&out_info.to_caps().unwrap()).build();
        MediaUnit::Frame(crate::media_unit::FrameUnit {
            sample,
            width,
            height,
            format: gst_video::VideoFormat::Bgra,
            hardware_resident: false,
        })
    }

    #[test]
    fn forwards_bgra_frames_directly_to_the_surface() {
        let surface = Arc::new(RecordingSurface {
            frames: StdMutex::new(Vec::new()),
        });
        let dyn_surface: Arc<dyn PreviewSurface> = surface.clone();
        let mut sink = PreviewSink::new(Arc::downgrade(&dyn_surface));
        sink.process(dummy_bgra_frame(64, 48, 0));
        assert_eq!(surface.frames.lock().unwrap().as_slice(), &[(64, 48)]);
    }

    #[test]
    fn surface_destruction_latches_lost_and_drops_future_frames() {
        let surface: Arc<dyn PreviewSurface> = Arc::new(RecordingSurface {
            frames: StdMutex::new(Vec::new()),
        });
        let weak = Arc::downgrade(&surface);
        drop(surface);

        let mut sink = PreviewSink::new(weak);
        assert!(!sink.surface_lost());
        sink.process(dummy_bgra_frame(16, 16, 0));
        assert!(sink.surface_lost());
        // A second frame must be a cheap no-op, not another failed upgrade.
        sink.process(dummy_bgra_frame(16, 16, 1));
        assert!(sink.surface_lost());
    }
}
