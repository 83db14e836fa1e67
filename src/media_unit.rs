//! `MediaUnit` — the reference-counted carrier for either a compressed
//! packet or a decoded frame.
//!
//! GStreamer's `gst::Buffer` and `gst::Sample` are themselves mini-objects
//! with their own atomic refcount; `Clone` on either bumps that count and
//! `Drop` releases it, so wrapping them gives the ownership invariant that
//! the native buffer is freed exactly once, when the last reference is
//! released, for free rather than layering a second refcount on top.

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_video as gst_video;

/// A compressed access unit plus the metadata a muxer needs to route it:
/// DTS/PTS and stream index.
#[derive(Clone)]
pub struct PacketUnit {
    pub buffer: gst::Buffer,
    pub stream_index: usize,
    /// Time base of the stage that produced this packet. Timestamps inside
    /// a chain are expressed in the time base of the producing stage.
    pub time_base: gst::Fraction,
    pub keyframe: bool,
}

impl PacketUnit {
    pub fn pts(&self) -> Option<gst::ClockTime> {
        self.buffer.pts()
    }

    pub fn dts(&self) -> Option<gst::ClockTime> {
        self.buffer.dts()
    }

    /// DTS, falling back to PTS when the container/codec never set one.
    /// Pacing is based on DTS, falling back to PTS.
    pub fn dts_or_pts(&self) -> Option<gst::ClockTime> {
        self.dts().or_else(|| self.pts())
    }
}

/// A decoded frame, either system-memory (readable planes) or hardware
/// resident (opaque surface reference held inside the `gst::Buffer`'s
/// memory, e.g. a VASurface or CUDA device pointer).
#[derive(Clone)]
pub struct FrameUnit {
    pub sample: gst::Sample,
    pub width: u32,
    pub height: u32,
    pub format: gst_video::VideoFormat,
    /// True when the backing memory is a hardware surface rather than
    /// CPU-addressable planes. A hardware-resident frame MUST be converted
    /// to system memory before reaching a plane-reading sink such as the
    /// preview sink.
    pub hardware_resident: bool,
}

impl FrameUnit {
    pub fn buffer(&self) -> Option<gst::Buffer> {
        self.sample.buffer_owned()
    }

    pub fn pts(&self) -> Option<gst::ClockTime> {
        self.sample.buffer().and_then(|b| b.pts())
    }

    pub fn dts(&self) -> Option<gst::ClockTime> {
        self.sample.buffer().and_then(|b| b.dts())
    }
}

/// Either variant, as delivered between stages.
#[derive(Clone)]
pub enum MediaUnit {
    Packet(PacketUnit),
    Frame(FrameUnit),
}

impl MediaUnit {
    pub fn as_packet(&self) -> Option<&PacketUnit> {
        match self {
            MediaUnit::Packet(p) => Some(p),
            MediaUnit::Frame(_) => None,
        }
    }

    pub fn as_frame(&self) -> Option<&FrameUnit> {
        match self {
            MediaUnit::Frame(f) => Some(f),
            MediaUnit::Packet(_) => None,
        }
    }

    pub fn into_packet(self) -> Option<PacketUnit> {
        match self {
            MediaUnit::Packet(p) => Some(p),
            MediaUnit::Frame(_) => None,
        }
    }

    pub fn into_frame(self) -> Option<FrameUnit> {
        match self {
            MediaUnit::Frame(f) => Some(f),
            MediaUnit::Packet(_) => None,
        }
    }

    pub fn pts(&self) -> Option<gst::ClockTime> {
        match self {
            MediaUnit::Packet(p) => p.pts(),
            MediaUnit::Frame(f) => f.pts(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        let _ = gst::init();
    }

    fn dummy_buffer(pts_ns: u64) -> gst::Buffer {
        let mut buf = gst::Buffer::with_size(4).unwrap();
        {
            let b = buf.get_mut().unwrap();
            b.set_pts(gst::ClockTime::from_nseconds(pts_ns));
        }
        buf
    }

    #[test]
    fn packet_falls_back_to_pts_when_dts_absent() {
        init();
        let unit = PacketUnit {
            buffer: dummy_buffer(42),
            stream_index: 0,
            time_base: gst::Fraction::new(1, 90_000),
            keyframe: true,
        };
        assert_eq!(unit.dts(), None);
        assert_eq!(unit.dts_or_pts(), Some(gst::ClockTime::from_nseconds(42)));
    }

    #[test]
    fn cloning_a_unit_shares_the_underlying_buffer() {
        init();
        let buffer = dummy_buffer(1);
        let a = PacketUnit {
            buffer,
            stream_index: 0,
            time_base: gst::Fraction::new(1, 1),
            keyframe: false,
        };
        let b = a.clone();
        // Both point at the same refcounted gst::Buffer; dropping one must
        // not invalidate the other's view.
        assert_eq!(a.pts(), b.pts());
        drop(a);
        assert_eq!(b.pts(), Some(gst::ClockTime::from_nseconds(1)));
    }

    #[test]
    fn media_unit_pts_dispatches_by_variant() {
        init();
        let p = MediaUnit::Packet(PacketUnit {
            buffer: dummy_buffer(7),
            stream_index: 0,
            time_base: gst::Fraction::new(1, 1),
            keyframe: false,
        });
        assert_eq!(p.pts(), Some(gst::ClockTime::from_nseconds(7)));
        assert!(p.as_frame().is_none());
    }
}
