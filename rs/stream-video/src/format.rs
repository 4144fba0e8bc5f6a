use bytes::Bytes;

use crate::{Error, Result};

/// The video format negotiated with the host, using the wire values of the streaming protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::TryFromPrimitive, clap::ValueEnum)]
#[repr(i32)]
pub enum VideoFormat {
	H264 = 0x0001,
	H265 = 0x0100,
	H265Main10 = 0x0200,
	Av1Main8 = 0x1000,
	Av1Main10 = 0x2000,
}

impl VideoFormat {
	pub fn from_code(code: i32) -> Result<Self> {
		Self::try_from(code).map_err(|_| Error::UnsupportedFormat(format!("video format {code:#06x}")))
	}

	pub fn codec(&self) -> Codec {
		match self {
			Self::H264 => Codec::H264,
			Self::H265 | Self::H265Main10 => Codec::H265,
			Self::Av1Main8 | Self::Av1Main10 => Codec::Av1,
		}
	}

	pub fn bit_depth(&self) -> u8 {
		match self {
			Self::H265Main10 | Self::Av1Main10 => 10,
			_ => 8,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum Codec {
	#[display("h264")]
	H264,
	#[display("h265")]
	H265,
	#[display("av1")]
	Av1,
}

impl Codec {
	/// The parameter sets required before the first picture can be decoded, in submission order.
	pub fn required_parameter_sets(&self) -> &'static [ParameterSet] {
		match self {
			Self::H264 => &[ParameterSet::Sps, ParameterSet::Pps],
			Self::H265 => &[ParameterSet::Vps, ParameterSet::Sps, ParameterSet::Pps],
			Self::Av1 => &[],
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParameterSet {
	Vps,
	Sps,
	Pps,
}

/// Everything the hardware needs to open a decode context.
///
/// NAL units in every [crate::EncodedUnit] are prefixed with a big-endian length of [Self::nal_length_size] bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescription {
	pub format: VideoFormat,

	/// Parameter sets without start codes, in the order given by [Codec::required_parameter_sets].
	pub parameter_sets: Vec<Bytes>,

	pub nal_length_size: u8,
}

impl FormatDescription {
	pub fn codec(&self) -> Codec {
		self.format.codec()
	}
}
