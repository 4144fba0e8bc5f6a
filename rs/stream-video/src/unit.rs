use bytes::Bytes;

use crate::{Error, Result, Timestamp};

/// The frame type reported by the transport for a picture buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::FromPrimitive)]
#[repr(i32)]
pub enum FrameType {
	Predicted = 0,
	Idr = 1,

	#[num_enum(catch_all)]
	Other(i32),
}

impl FrameType {
	pub fn is_idr(&self) -> bool {
		matches!(self, Self::Idr)
	}
}

/// What a submitted buffer contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(i32)]
pub enum BufferType {
	PicData = 0,
	Sps = 1,
	Pps = 2,
	Vps = 3,
}

/// Identity and timing of a unit, carried through the hardware and back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
	/// Submission order within the session, starting at zero.
	pub sequence: u64,

	pub timestamp: Timestamp,
	pub duration: Timestamp,
	pub frame_type: FrameType,
}

impl FrameInfo {
	pub fn is_idr(&self) -> bool {
		self.frame_type.is_idr()
	}
}

/// An assembled unit that has not been given a presentation time yet.
#[derive(Debug)]
pub struct PendingUnit {
	payload: Bytes,
	frame_type: FrameType,
}

impl PendingUnit {
	pub fn frame_type(&self) -> FrameType {
		self.frame_type
	}

	pub fn len(&self) -> usize {
		self.payload.len()
	}

	pub fn is_empty(&self) -> bool {
		self.payload.is_empty()
	}

	/// Assign the presentation time, producing a unit that can be submitted.
	pub fn stamp(self, sequence: u64, timestamp: Timestamp, duration: Timestamp) -> EncodedUnit {
		EncodedUnit {
			payload: self.payload,
			info: FrameInfo {
				sequence,
				timestamp,
				duration,
				frame_type: self.frame_type,
			},
		}
	}
}

/// One compressed picture, length-prefixed, ready for the decoder.
#[derive(Debug, Clone)]
pub struct EncodedUnit {
	payload: Bytes,
	info: FrameInfo,
}

impl EncodedUnit {
	/// Create a pending unit; the payload must not be empty.
	#[allow(clippy::new_ret_no_self)]
	pub fn new(payload: impl Into<Bytes>, frame_type: FrameType) -> Result<PendingUnit> {
		let payload = payload.into();
		if payload.is_empty() {
			return Err(Error::EmptyUnit);
		}

		Ok(PendingUnit { payload, frame_type })
	}

	pub fn payload(&self) -> &Bytes {
		&self.payload
	}

	pub fn info(&self) -> FrameInfo {
		self.info
	}

	pub fn frame_type(&self) -> FrameType {
		self.info.frame_type
	}

	pub fn timestamp(&self) -> Timestamp {
		self.info.timestamp
	}

	pub fn duration(&self) -> Timestamp {
		self.info.duration
	}

	pub fn into_parts(self) -> (Bytes, FrameInfo) {
		(self.payload, self.info)
	}
}
