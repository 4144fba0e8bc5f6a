//! # stream-video: low latency video decode for game streaming
//!
//! `stream-video` sits between a streaming transport and the screen.
//! The transport submits raw Annex-B buffers as they arrive; this crate reframes them,
//! feeds a hardware decoder without blocking, and presents the output on a display surface.
//!
//! ## Overview
//!
//! - **Stream**: [StreamDecoder], the entry point for the transport and the recovery logic.
//! - **Assemble**: Converts Annex-B access units into length-prefixed units.
//! - **Decoder**: The [decoder::HardwareDecoder] seam and its asynchronous output path.
//! - **Render**: Presentation strategies and the YUV to ARGB converter.
//! - **Timing**: Presentation timestamps derived from the transport's pts.
//!
//! A software [decoder::LoopbackDecoder] and a [render::HeadlessSurface] are included,
//! so the whole pipeline runs without any hardware.
mod callbacks;
mod config;
mod error;
mod format;
mod frame;
mod log;
mod status;
mod stream;
mod time;
mod timing;
mod unit;

pub mod assemble;
pub mod decoder;
pub mod nal;
pub mod render;

pub use callbacks::*;
pub use config::*;
pub use error::*;
pub use format::*;
pub use frame::*;
pub use log::*;
pub use status::*;
pub use stream::*;
pub use time::*;
pub use timing::*;
pub use unit::*;
