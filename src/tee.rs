//! Fan-out (Tee).
//!
//! Graph-level fan-out (a stage handle with more than one successor in the
//! [`crate::stage::Chain`] adjacency list) covers most branching needs
//! without an explicit element. This module exists for the one case that
//! doesn't fit that shape cleanly: `echo`, where the same decoded frame
//! must be explicitly duplicated to a sink that is not itself part of the
//! main encode chain. `Tee::process` simply returns the unit once per
//! target by cloning the reference -- no data is copied, only the refcount
//! is bumped. Targets must be non-mutating readers.

use crate::media_unit::MediaUnit;
use crate::stage::Stage;

/// Duplicates every incoming unit to `fan_out` downstream targets.
/// `Stage::process`'s caller (the [`crate::stage::Chain`] dispatcher) is
/// responsible for actually routing one copy per successor; `Tee` itself
/// just needs to report how many copies to hand out, since the cloned
/// `MediaUnit` references are cheap (refcounted).
pub struct Tee {
    fan_out: usize,
}

impl Tee {
    pub fn new(fan_out: usize) -> Self {
        assert!(fan_out > 0, "a tee with zero targets drops every unit silently");
        Self { fan_out }
    }
}

impl Stage for Tee {
    fn name(&self) -> &'static str {
        "tee"
    }

    fn process(&mut self, unit: MediaUnit) -> Vec<MediaUnit> {
        std::iter::repeat(unit).take(self.fan_out).collect()
    }

    fn stop(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use gstreamer as gst;

    #[test]
    fn emits_one_clone_per_target() {
        let _ = gst::init();
        let mut buf = gst::Buffer::with_size(1).unwrap();
        buf.get_mut().unwrap().set_pts(gst::ClockTime::ZERO);
        let unit = MediaUnit::Packet(crate::media_unit::PacketUnit {
            buffer: buf,
            stream_index: 0,
            time_base: gst::Fraction::new(1, 1),
            keyframe: false,
        });

        let mut tee = Tee::new(2);
        let outputs = tee.process(unit);
        assert_eq!(outputs.len(), 2);
    }

    #[test]
    #[should_panic]
    fn zero_fan_out_is_rejected_at_construction() {
        Tee::new(0);
    }
}
