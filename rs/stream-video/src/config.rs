use serde::{Deserialize, Serialize};

use crate::render::RenderStrategy;
use crate::timing::PresentationTimeMode;

/// Tuning for a [crate::StreamDecoder], fixed for the sessions it runs.
#[derive(Clone, Debug, PartialEq, Eq, clap::Args, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct Config {
	/// How decoded frames reach the display surface.
	#[arg(
		id = "render-strategy",
		long = "render-strategy",
		env = "STREAM_VIDEO_RENDER_STRATEGY",
		default_value = "linked-layer"
	)]
	pub strategy: RenderStrategy,

	/// Where presentation timestamps come from.
	#[arg(
		id = "presentation-time",
		long = "presentation-time",
		env = "STREAM_VIDEO_PRESENTATION_TIME",
		default_value = "none"
	)]
	pub timing: PresentationTimeMode,

	/// The maximum number of units submitted to the decoder and not yet output.
	#[arg(
		id = "decode-queue",
		long = "decode-queue",
		env = "STREAM_VIDEO_DECODE_QUEUE",
		default_value_t = 8
	)]
	pub decode_queue: usize,

	/// The maximum number of decoded frames waiting to be presented.
	#[arg(
		id = "present-queue",
		long = "present-queue",
		env = "STREAM_VIDEO_PRESENT_QUEUE",
		default_value_t = 4
	)]
	pub present_queue: usize,

	/// Terminate the connection after this many lost frames without a successful key frame.
	///
	/// Zero never terminates.
	#[arg(
		id = "recovery-limit",
		long = "recovery-limit",
		env = "STREAM_VIDEO_RECOVERY_LIMIT",
		default_value_t = 30
	)]
	pub recovery_limit: u32,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			strategy: RenderStrategy::LinkedLayer,
			timing: PresentationTimeMode::None,
			decode_queue: 8,
			present_queue: 4,
			recovery_limit: 30,
		}
	}
}

impl Config {
	pub fn with_strategy(mut self, strategy: RenderStrategy) -> Self {
		self.strategy = strategy;
		self
	}

	pub fn with_timing(mut self, timing: PresentationTimeMode) -> Self {
		self.timing = timing;
		self
	}

	pub fn with_queues(mut self, decode: usize, present: usize) -> Self {
		self.decode_queue = decode;
		self.present_queue = present;
		self
	}

	pub fn with_recovery_limit(mut self, limit: u32) -> Self {
		self.recovery_limit = limit;
		self
	}
}
