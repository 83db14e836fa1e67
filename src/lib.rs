//! # vidflow
//!
//! A low-latency video pipeline core: a graph of pluggable stages
//! (source -> decode -> optional fan-out -> encode -> sink) that moves
//! reference-counted media units between stages without copies, honors
//! back-pressure, interoperates with hardware acceleration contexts,
//! satisfies real-time pacing, and tears down cleanly while worker threads
//! may be blocked inside native library calls.
//!
//! ## Scope
//!
//! This crate covers the pipeline core only: the stage abstraction,
//! pipeline construction and lifecycle, media-unit ownership,
//! hardware-surface transfer rules, pacing logic, bounded queueing, and the
//! streaming-server dispatch path. It does not cover a GUI front-end,
//! settings persistence, or codec implementations beyond the contracts the
//! core needs — those are delegated to GStreamer elements/plugins, the
//! runtime substrate this crate configures and wires rather than
//! reimplements.
//!
//! ## Architecture
//!
//! - [`stage`] — the uniform `Stage`/`Source` contracts and the arena-based
//!   `Chain`/`ChainBuilder` graph that dispatches units push-style.
//! - [`media_unit`] — the reference-counted `MediaUnit` envelope
//!   (`Packet`/`Frame`), backed by GStreamer's own refcounted buffers.
//! - [`source`] — `Demuxer` (network/file) and `ScreenGrab` (live desktop
//!   capture), the only stages that own a producer thread.
//! - [`decoder`], [`encoder`] — compressed <-> decoded frame conversion,
//!   with optional hardware acceleration.
//! - [`muxer`], [`stream_server`], [`preview`] — the three sink kinds: a
//!   container writer, an on-demand RTSP dispatch endpoint, and a
//!   display-surface adapter.
//! - [`controller`] — [`controller::PipelineController`], which assembles
//!   one of the three public modes (`play`/`publish`/`serve`) on a detached
//!   builder thread and owns the live chain set.
//!
//! ## Non-goals
//!
//! Audio handling, seek/trickplay control, adaptive bitrate ladders, DRM,
//! multi-track transcoding, and streaming-server authentication are out of
//! scope, same as the GUI front-end and settings persistence that
//! previously lived around this core.

pub mod controller;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod hardware;
pub mod latency;
pub mod media_unit;
pub mod muxer;
pub mod preview;
pub mod source;
pub mod stage;
pub mod stream_server;
pub mod tee;
