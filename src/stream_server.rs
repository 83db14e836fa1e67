//! StreamServer stage: adapts the pipeline core's `MediaUnit`s onto the
//! `vidflow-rtsp` crate's already-encoded RTSP dispatch endpoint.
//!
//! The bounded drop-oldest queue, the `max-output-buffer-size` floor, and
//! the GLib event-loop thread all live in `vidflow-rtsp` (grounded in the
//! teacher's `cap-rtsp` crate); this module is the `Stage` adapter that
//! feeds it `MediaUnit::Packet`s instead of raw bytes and exposes the
//! queue-depth/eviction counters for observability.

use crate::latency::LatencyClass;
use crate::media_unit::MediaUnit;
use crate::stage::Stage;
use vidflow_rtsp::{EncodedPacket, StreamServer as RtspDispatch, StreamServerConfig};

/// StreamServer stage: bound to `(port, stream-name)`.
pub struct StreamServer {
    port: u16,
    name: String,
    dispatch: Option<RtspDispatch>,
}

impl StreamServer {
    pub fn new(port: u16, name: impl Into<String>) -> Self {
        Self {
            port,
            name: name.into(),
            dispatch: None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        self.dispatch.as_ref().map(|d| d.url())
    }

    /// Current queue depth; must never exceed the configured cap.
    pub fn queue_len(&self) -> usize {
        self.dispatch.as_ref().map(|d| d.queue_len()).unwrap_or(0)
    }

    pub fn evicted_total(&self) -> u64 {
        self.dispatch.as_ref().map(|d| d.evicted_total()).unwrap_or(0)
    }
}

impl Stage for StreamServer {
    fn name(&self) -> &'static str {
        "stream_server"
    }

    fn initialize(&mut self) -> crate::error::Result<()> {
        let cfg = StreamServerConfig::new(self.port, self.name.clone());
        let dispatch = RtspDispatch::start(cfg)
            .map_err(|e| crate::error::PipelineError::init(format!("{e}")))?;
        self.dispatch = Some(dispatch);
        Ok(())
    }

    fn process(&mut self, unit: MediaUnit) -> Vec<MediaUnit> {
        let Some(packet) = unit.as_packet() else {
            return Vec::new();
        };
        if let Some(dispatch) = &self.dispatch {
            let Ok(map) = packet.buffer.map_readable() else {
                return Vec::new();
            };
            let data = map.as_slice().to_vec();
            drop(map);
            dispatch.process(EncodedPacket::new(data, packet.keyframe));
        }
        Vec::new() // terminal stage
    }

    fn stop(&mut self) {
        if let Some(mut dispatch) = self.dispatch.take() {
            dispatch.stop();
        }
    }

    fn latency_class(&self) -> LatencyClass {
        LatencyClass::UltraLow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_len_is_zero_before_initialize() {
        let s = StreamServer::new(8554, "live");
        assert_eq!(s.queue_len(), 0);
        assert_eq!(s.evicted_total(), 0);
        assert!(s.url().is_none());
    }
}
