//! Annex-B NAL unit scanning and classification for H.264 and H.265.

use crate::format::{Codec, ParameterSet};
use crate::{Error, Result};

/// A single NAL unit found in an Annex-B buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nal<'a> {
	/// The offset of the start code within the scanned buffer.
	pub offset: usize,

	/// The size of the start code, either 3 or 4 bytes.
	pub start_code: usize,

	/// The NAL unit without its start code, header included.
	pub body: &'a [u8],
}

/// Iterates over the NAL units of an Annex-B buffer.
///
/// The buffer must begin with a start code; the last NAL runs to the end of the buffer.
pub struct NalIterator<'a> {
	data: &'a [u8],
	next: Option<(usize, usize)>,
	failed: bool,
}

impl<'a> NalIterator<'a> {
	pub fn new(data: &'a [u8]) -> Self {
		let next = start_code_at(data, 0).map(|size| (0, size));

		Self {
			data,
			failed: next.is_none() && !data.is_empty(),
			next,
		}
	}
}

impl<'a> Iterator for NalIterator<'a> {
	type Item = Result<Nal<'a>>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.failed {
			self.failed = false;
			self.next = None;
			return Some(Err(Error::InvalidNal));
		}

		let (offset, start_code) = self.next.take()?;
		let body_start = offset + start_code;

		let (body_end, next) = match find_start_code(self.data, body_start) {
			Some((at, size)) => (at, Some((at, size))),
			None => (self.data.len(), None),
		};

		self.next = next;

		let body = &self.data[body_start..body_end];
		if body.is_empty() {
			return Some(Err(Error::InvalidNal));
		}

		Some(Ok(Nal {
			offset,
			start_code,
			body,
		}))
	}
}

fn start_code_at(data: &[u8], at: usize) -> Option<usize> {
	let rest = data.get(at..)?;
	if rest.starts_with(&[0, 0, 0, 1]) {
		Some(4)
	} else if rest.starts_with(&[0, 0, 1]) {
		Some(3)
	} else {
		None
	}
}

// Returns the offset and size of the next start code at or after `from`.
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
	let window = data.get(from..)?;
	let pos = window.windows(3).position(|w| w == [0, 0, 1])?;
	let at = from + pos;

	// A zero byte before 00 00 01 belongs to a 4 byte start code.
	if at > from && data[at - 1] == 0 {
		Some((at - 1, 4))
	} else {
		Some((at, 3))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum AvcNalType {
	Slice = 1,
	PartitionA = 2,
	PartitionB = 3,
	PartitionC = 4,
	IdrSlice = 5,
	Sei = 6,
	Sps = 7,
	Pps = 8,
	Aud = 9,
	EndOfSequence = 10,
	EndOfStream = 11,
	Filler = 12,
	SpsExt = 13,
	Prefix = 14,
	SubsetSps = 15,
	// 16 -> 18 reserved
	AuxSlice = 19,
	SliceExt = 20,
} // ITU H.264 Table 7-1

#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum HevcNalType {
	TrailN = 0,
	TrailR = 1,
	TsaN = 2,
	TsaR = 3,
	StsaN = 4,
	StsaR = 5,
	RadlN = 6,
	RadlR = 7,
	RaslN = 8,
	RaslR = 9,
	// 10 -> 15 reserved
	BlaWLp = 16,
	BlaWRadl = 17,
	BlaNLp = 18,
	IdrWRadl = 19,
	IdrNLp = 20,
	Cra = 21,
	// 22 -> 31 reserved
	Vps = 32,
	Sps = 33,
	Pps = 34,
	Aud = 35,
	EndOfSequence = 36,
	EndOfBitstream = 37,
	Filler = 38,
	SeiPrefix = 39,
	SeiSuffix = 40,
} // ITU H.265 Table 7-1

/// What a NAL unit means to the decode path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalKind {
	ParameterSet(ParameterSet),

	/// A coded slice. `first` is set when it begins a new picture.
	Slice { keyframe: bool, first: bool },

	Other,
}

/// Classify a NAL unit body (without start code).
pub fn classify(codec: Codec, body: &[u8]) -> Result<NalKind> {
	let header = *body.first().ok_or(Error::InvalidNal)?;

	let forbidden_zero_bit = header >> 7;
	if forbidden_zero_bit != 0 {
		return Err(Error::InvalidNal);
	}

	match codec {
		Codec::H264 => classify_avc(header, body),
		Codec::H265 => classify_hevc(header, body),
		Codec::Av1 => Ok(NalKind::Other),
	}
}

fn classify_avc(header: u8, body: &[u8]) -> Result<NalKind> {
	let kind = match AvcNalType::try_from(header & 0x1f).ok() {
		Some(AvcNalType::Sps) => NalKind::ParameterSet(ParameterSet::Sps),
		Some(AvcNalType::Pps) => NalKind::ParameterSet(ParameterSet::Pps),
		Some(kind @ (AvcNalType::Slice | AvcNalType::IdrSlice)) => {
			// first_mb_in_slice is ue(v); a leading 1 bit encodes zero.
			let first = body.get(1).ok_or(Error::InvalidNal)? & 0x80 != 0;
			NalKind::Slice {
				keyframe: kind == AvcNalType::IdrSlice,
				first,
			}
		}
		_ => NalKind::Other,
	};

	Ok(kind)
}

fn classify_hevc(header: u8, body: &[u8]) -> Result<NalKind> {
	if body.len() < 2 {
		return Err(Error::InvalidNal);
	}

	let kind = match HevcNalType::try_from((header >> 1) & 0b111111).ok() {
		Some(HevcNalType::Vps) => NalKind::ParameterSet(ParameterSet::Vps),
		Some(HevcNalType::Sps) => NalKind::ParameterSet(ParameterSet::Sps),
		Some(HevcNalType::Pps) => NalKind::ParameterSet(ParameterSet::Pps),
		Some(
			HevcNalType::IdrWRadl
			| HevcNalType::IdrNLp
			| HevcNalType::BlaNLp
			| HevcNalType::BlaWRadl
			| HevcNalType::BlaWLp
			| HevcNalType::Cra,
		) => NalKind::Slice {
			keyframe: true,
			first: first_slice_segment(body)?,
		},
		Some(
			HevcNalType::TrailN
			| HevcNalType::TrailR
			| HevcNalType::TsaN
			| HevcNalType::TsaR
			| HevcNalType::StsaN
			| HevcNalType::StsaR
			| HevcNalType::RadlN
			| HevcNalType::RadlR
			| HevcNalType::RaslN
			| HevcNalType::RaslR,
		) => NalKind::Slice {
			keyframe: false,
			first: first_slice_segment(body)?,
		},
		_ => NalKind::Other,
	};

	Ok(kind)
}

// first_slice_segment_in_pic_flag is the first bit after the 2 byte header.
fn first_slice_segment(body: &[u8]) -> Result<bool> {
	Ok(body.get(2).ok_or(Error::InvalidNal)? & 0x80 != 0)
}
