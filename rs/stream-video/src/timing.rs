use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// The RTP video clock rate.
const RTP_CLOCK: u64 = 90_000;

/// Where presentation timestamps come from, fixed for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresentationTimeMode {
	/// Synthetic timestamps, one frame duration apart.
	#[default]
	None,

	/// The 90kHz transport timestamp, relative to the first unit.
	Rtp,

	/// An absolute millisecond timestamp carried with the unit.
	Timestamp,

	/// The local monotonic clock when the unit was submitted.
	MachTime,
}

/// Derives a non-decreasing presentation timestamp for every submitted unit.
#[derive(Debug)]
pub struct PresentationTimeResolver {
	mode: PresentationTimeMode,
	duration: Timestamp,

	count: u64,
	wrap: Unwrap,
	base: Option<u64>,
	start: Option<Instant>,

	// The last timestamp handed out, used to clamp.
	last: Option<Timestamp>,
}

impl PresentationTimeResolver {
	pub fn new(mode: PresentationTimeMode, refresh_rate: u32) -> Self {
		Self {
			mode,
			duration: Timestamp::frame_interval(refresh_rate),
			count: 0,
			wrap: Unwrap::default(),
			base: None,
			start: None,
			last: None,
		}
	}

	pub fn mode(&self) -> PresentationTimeMode {
		self.mode
	}

	/// The presentation duration of every unit: one refresh interval.
	pub fn duration(&self) -> Timestamp {
		self.duration
	}

	pub fn resolve(&mut self, pts: u32) -> Timestamp {
		self.resolve_at(pts, Instant::now())
	}

	/// Resolve the timestamp of a unit received at `now`.
	pub fn resolve_at(&mut self, pts: u32, now: Instant) -> Timestamp {
		let index = self.count;
		self.count += 1;

		let timestamp = match self.mode {
			PresentationTimeMode::None => self.duration.checked_mul(index).unwrap_or(Timestamp::MAX),
			PresentationTimeMode::Rtp => {
				let ticks = self.wrap.extend(pts);
				let base = *self.base.get_or_insert(ticks);
				Timestamp::from_timescale(ticks.saturating_sub(base), RTP_CLOCK).unwrap_or(Timestamp::MAX)
			}
			PresentationTimeMode::Timestamp => {
				let millis = self.wrap.extend(pts);
				Timestamp::from_millis(millis).unwrap_or(Timestamp::MAX)
			}
			PresentationTimeMode::MachTime => {
				let start = *self.start.get_or_insert(now);
				Timestamp::try_from(now.saturating_duration_since(start)).unwrap_or(Timestamp::MAX)
			}
		};

		let clamped = match self.last {
			Some(last) if timestamp < last => {
				tracing::trace!(?timestamp, ?last, mode = ?self.mode, "clamping backwards timestamp");
				last
			}
			_ => timestamp,
		};

		self.last = Some(clamped);
		clamped
	}
}

// Extends a wrapping 32-bit counter to 64 bits.
#[derive(Debug, Default)]
struct Unwrap {
	last: Option<u32>,
	epoch: u64,
}

impl Unwrap {
	const HALF: u32 = u32::MAX / 2;

	fn extend(&mut self, value: u32) -> u64 {
		let Some(last) = self.last else {
			self.last = Some(value);
			return value as u64;
		};

		if value < last && last - value > Self::HALF {
			// Wrapped around.
			self.epoch += 1;
		} else if value > last && value - last > Self::HALF && self.epoch > 0 {
			// A late unit from before the last wrap; don't move the reference point.
			return ((self.epoch - 1) << 32) + value as u64;
		}

		self.last = Some(value);
		(self.epoch << 32) + value as u64
	}
}
