use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timestamp overflow")]
pub struct TimestampOverflow;

/// A presentation timestamp or duration in microseconds.
///
/// Timestamps are relative to the session; zero for one session is not zero for another.
#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
	/// The maximum representable timestamp.
	pub const MAX: Self = Self(u64::MAX);

	/// The zero timestamp.
	pub const ZERO: Self = Self(0);

	pub const fn from_secs(seconds: u64) -> Result<Self, TimestampOverflow> {
		match seconds.checked_mul(1_000_000) {
			Some(micros) => Ok(Self(micros)),
			None => Err(TimestampOverflow),
		}
	}

	pub const fn from_millis(millis: u64) -> Result<Self, TimestampOverflow> {
		match millis.checked_mul(1000) {
			Some(micros) => Ok(Self(micros)),
			None => Err(TimestampOverflow),
		}
	}

	pub const fn from_micros(micros: u64) -> Self {
		Self(micros)
	}

	/// Convert a value in the given timescale (ticks per second).
	///
	/// ex. from_timescale(90_000, 90_000) = 1s
	pub const fn from_timescale(value: u64, timescale: u64) -> Result<Self, TimestampOverflow> {
		if timescale == 0 {
			return Err(TimestampOverflow);
		}

		let micros = value as u128 * 1_000_000 / timescale as u128;
		if micros > u64::MAX as u128 {
			return Err(TimestampOverflow);
		}

		Ok(Self(micros as u64))
	}

	/// The duration of a single frame at the given rate, rounded down to the microsecond.
	pub const fn frame_interval(rate: u32) -> Self {
		match rate {
			0 => Self::ZERO,
			rate => Self(1_000_000 / rate as u64),
		}
	}

	/// Get the timestamp as microseconds.
	pub const fn as_micros(self) -> u64 {
		self.0
	}

	/// Get the timestamp as milliseconds.
	pub const fn as_millis(self) -> u64 {
		self.0 / 1000
	}

	pub fn checked_mul(self, rhs: u64) -> Option<Self> {
		self.0.checked_mul(rhs).map(Self)
	}
}

impl TryFrom<Duration> for Timestamp {
	type Error = TimestampOverflow;

	fn try_from(duration: Duration) -> Result<Self, Self::Error> {
		Ok(Self(duration.as_micros().try_into().map_err(|_| TimestampOverflow)?))
	}
}

impl std::fmt::Debug for Timestamp {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}µs", self.0)
	}
}

impl std::fmt::Display for Timestamp {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}µs", self.0)
	}
}
