/// A list of possible errors that can occur while decoding or presenting video.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
	/// The codec can't be decoded on this platform.
	#[error("unsupported format: {0}")]
	UnsupportedFormat(String),

	/// The decoder input queue is saturated.
	#[error("queue full")]
	QueueFull,

	/// The hardware reported a failure for a single unit.
	#[error("decode failure status={0}")]
	DecodeFailure(i32),

	/// A negative offset was passed to buffer assembly.
	#[error("out of range")]
	OutOfRange,

	/// The display surface can't accept the frame right now.
	#[error("surface unavailable")]
	SurfaceUnavailable,

	/// The session is not set up, or was cleaned up.
	#[error("rejected")]
	Rejected,

	/// An encoded unit must contain at least one byte.
	#[error("empty unit")]
	EmptyUnit,

	/// Picture data arrived before the parameter sets.
	#[error("missing format description")]
	MissingFormat,

	#[error("invalid NAL unit")]
	InvalidNal,

	#[error("already setup")]
	AlreadySetup,

	#[error("closed")]
	Closed,

	/// The hardware decode context was lost or couldn't be created.
	#[error("hardware status={0}")]
	Hardware(i32),

	/// A decoded image doesn't match its declared layout.
	#[error("invalid image")]
	InvalidImage,
}

impl Error {
	/// A stable integer code, always negative, reported through the connection callbacks.
	pub fn code(&self) -> i32 {
		match self {
			Self::UnsupportedFormat(_) => -1,
			Self::QueueFull => -2,
			Self::DecodeFailure(_) => -3,
			Self::OutOfRange => -4,
			Self::SurfaceUnavailable => -5,
			Self::Rejected => -6,
			Self::EmptyUnit => -7,
			Self::MissingFormat => -8,
			Self::InvalidNal => -9,
			Self::AlreadySetup => -10,
			Self::Closed => -11,
			Self::Hardware(_) => -12,
			Self::InvalidImage => -13,
		}
	}

	/// Returns true if the error ends the session rather than a single frame.
	pub fn is_fatal(&self) -> bool {
		matches!(self, Self::UnsupportedFormat(_) | Self::Hardware(_))
	}
}

pub type Result<T> = std::result::Result<T, Error>;
