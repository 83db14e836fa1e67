//! Decoder stage: turns compressed packets into frames, optionally binding
//! a hardware device context and downloading hardware surfaces to system
//! memory when required downstream.

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use crate::error::PipelineError;
use crate::hardware::HardwareAccel;
use crate::latency::LatencyClass;
use crate::media_unit::{FrameUnit, MediaUnit};
use crate::stage::Stage;

/// Decodes an H.264 elementary stream, optionally through a hardware
/// decoder element, always emitting system-memory frames -- the
/// hardware-download is mandatory here because the preview sink cannot
/// read opaque surfaces.
pub struct Decoder {
    requested_hw: HardwareAccel,
    active_hw: HardwareAccel,
    latency: LatencyClass,
    pipeline: Option<gst::Pipeline>,
    appsrc: Option<gst_app::AppSrc>,
    appsink: Option<gst_app::AppSink>,
}

impl Decoder {
    pub fn new(hw: HardwareAccel, latency: LatencyClass) -> Self {
        Self {
            requested_hw: hw,
            active_hw: HardwareAccel::None,
            latency,
            pipeline: None,
            appsrc: None,
            appsink: None,
        }
    }

    /// The hardware accelerator actually bound (`None` if the silent
    /// software fallback kicked in).
    pub fn active_hardware(&self) -> HardwareAccel {
        self.active_hw
    }

    fn select_decoder_element(&self) -> (gst::Element, HardwareAccel) {
        if self.requested_hw != HardwareAccel::None && self.requested_hw.is_available() {
            if let Some(name) = self.requested_hw.decoder_element() {
                if let Ok(elem) = gst::ElementFactory::make(name).build() {
                    return (elem, self.requested_hw);
                }
            }
        }
        // Silent software fallback.
        let elem = gst::ElementFactory::make("avdec_h264")
            .build()
            .expect("avdec_h264 must always be available as the software fallback");
        (elem, HardwareAccel::None)
    }
}

impl Stage for Decoder {
    fn name(&self) -> &'static str {
        "decoder"
    }

    fn initialize(&mut self) -> crate::error::Result<()> {
        gst::init().map_err(|e| PipelineError::init(format!("gst::init failed: {e}")))?;

        let pipeline = gst::Pipeline::new();
        let appsrc = gst_app::AppSrc::builder()
            .is_live(true)
            .format(gst::Format::Time)
            .caps(
                &gst::Caps::builder("video/x-h264")
                    .field("stream-format", "byte-stream")
                    .field("alignment", "au")
                    .build(),
            )
            .build();
        let parse = gst::ElementFactory::make("h264parse")
            .build()
            .map_err(|_| PipelineError::init("missing element: h264parse"))?;

        let (decoder_elem, active_hw) = self.select_decoder_element();

        // Download surfaces from hardware memory to system memory so any
        // downstream sink reading planes (preview) always gets CPU-visible
        // data: a hardware frame must reach system memory before it reaches
        // a plane-reading sink.
        let download = gst::ElementFactory::make("videoconvert")
            .build()
            .map_err(|_| PipelineError::init("missing element: videoconvert"))?;

        let appsink = gst_app::AppSink::builder()
            .sync(false)
            .max_buffers(if self.latency == LatencyClass::Standard { 8 } else { 2 })
            .drop(self.latency != LatencyClass::Standard)
            .build();

        pipeline
            .add_many([
                appsrc.upcast_ref(),
                &parse,
                &decoder_elem,
                &download,
                appsink.upcast_ref(),
            ])
            .map_err(|e| PipelineError::init(format!("failed to assemble decoder pipeline: {e}")))?;
        gst::Element::link_many([
            appsrc.upcast_ref(),
            &parse,
            &decoder_elem,
            &download,
            appsink.upcast_ref(),
        ])
        .map_err(|e| PipelineError::init(format!("failed to link decoder pipeline: {e}")))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| PipelineError::init(format!("failed to start decoder pipeline: {e}")))?;

        self.active_hw = active_hw;
        self.pipeline = Some(pipeline);
        self.appsrc = Some(appsrc);
        self.appsink = Some(appsink);
        Ok(())
    }

    fn process(&mut self, unit: MediaUnit) -> Vec<MediaUnit> {
        let Some(packet) = unit.as_packet() else {
            return Vec::new();
        };
        let (Some(appsrc), Some(appsink)) = (&self.appsrc, &self.appsink) else {
            return Vec::new();
        };

        if appsrc.push_buffer(packet.buffer.clone()).is_err() {
            tracing::warn!("decoder: push_buffer failed, dropping packet");
            return Vec::new();
        }

        // Send-and-drain: pull every frame the decoder has ready right now
        // without blocking past what's already buffered.
        let mut out = Vec::new();
        while let Some(sample) = appsink.try_pull_sample(gst::ClockTime::ZERO) {
            let Some(caps) = sample.caps() else { continue };
            let Ok(info) = gst_video::VideoInfo::from_caps(caps) else {
                continue;
            };
            out.push(MediaUnit::Frame(FrameUnit {
                width: info.width(),
                height: info.height(),
                format: info.format(),
                hardware_resident: false, // always downloaded, see initialize()
                sample,
            }));
        }
        out
    }

    fn stop(&mut self) {
        if let Some(appsrc) = &self.appsrc {
            let _ = appsrc.end_of_stream();
        }
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
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
    fn software_decoder_is_selected_when_no_hardware_requested() {
        let d = Decoder::new(HardwareAccel::None, LatencyClass::Standard);
        assert_eq!(d.active_hardware(), HardwareAccel::None);
    }

    #[test]
    fn falls_back_to_software_when_requested_hardware_is_unavailable() {
        // Requesting hwType=nvidia on a host without an nvh264dec plugin
        // registered must transparently fall back to software, never
        // crash. Only needs gst::init() plus the always-available
        // avdec_h264 element, not real NVIDIA hardware.
        let mut d = Decoder::new(HardwareAccel::Nvidia, LatencyClass::Standard);
        let _ = d.initialize();
        assert_eq!(d.active_hardware(), HardwareAccel::None);
    }
}
