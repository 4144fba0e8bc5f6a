//! Turns transport buffers into decodable units.
//!
//! The transport delivers Annex-B data: every NAL unit is preceded by a 3 or 4 byte start code.
//! Hardware decoders want the length-prefixed form instead, with parameter sets delivered out of band.
//! The [Assembler] performs that conversion and tracks the parameter sets that make up the [FormatDescription].

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use crate::format::{FormatDescription, ParameterSet, VideoFormat};
use crate::nal::{self, NalIterator, NalKind};
use crate::unit::{EncodedUnit, FrameType, PendingUnit};
use crate::{Codec, Error, Result};

/// Every NAL unit in an assembled payload is prefixed with its size as a big-endian u32.
pub const NAL_LENGTH_SIZE: u8 = 4;

/// Write `data[..length]` into `existing` at `offset`, growing it as needed.
///
/// Bytes outside of `offset..offset + length` are never modified, and the buffer never shrinks.
/// Any gap between the old end of the buffer and `offset` is zero filled.
/// A negative offset, or a length longer than `data`, fails without touching the buffer.
pub fn update_buffer(existing: &mut BytesMut, data: &[u8], offset: i64, length: usize) -> Result<()> {
	let offset = usize::try_from(offset).map_err(|_| Error::OutOfRange)?;
	let data = data.get(..length).ok_or(Error::OutOfRange)?;
	let end = offset.checked_add(length).ok_or(Error::OutOfRange)?;

	if existing.len() < end {
		existing.resize(end, 0);
	}

	existing[offset..end].copy_from_slice(data);

	Ok(())
}

/// Assembles picture buffers into [EncodedUnit]s and collects parameter sets.
pub struct Assembler {
	format: VideoFormat,

	// The most recent parameter sets, without start codes.
	parameter_sets: BTreeMap<ParameterSet, Bytes>,

	// The description built from the last complete group of parameter sets.
	description: Option<FormatDescription>,

	// Reused between pictures; split off once a unit is complete.
	block: BytesMut,
}

impl Assembler {
	pub fn new(format: VideoFormat) -> Self {
		// Codecs without parameter sets can be described immediately.
		let description = match format.codec().required_parameter_sets() {
			[] => Some(FormatDescription {
				format,
				parameter_sets: Vec::new(),
				nal_length_size: NAL_LENGTH_SIZE,
			}),
			_ => None,
		};

		Self {
			format,
			parameter_sets: BTreeMap::new(),
			description,
			block: BytesMut::new(),
		}
	}

	pub fn format(&self) -> VideoFormat {
		self.format
	}

	pub fn description(&self) -> Option<&FormatDescription> {
		self.description.as_ref()
	}

	/// Record a parameter set buffer, start code included.
	///
	/// Returns a new [FormatDescription] when the final parameter set of a group arrives and the group differs from the current one.
	/// That's a mid-stream format change, and the caller must reopen the decoder.
	pub fn parameter_set(&mut self, kind: ParameterSet, data: &[u8]) -> Result<Option<FormatDescription>> {
		let codec = self.format.codec();
		let required = codec.required_parameter_sets();
		if !required.contains(&kind) {
			tracing::debug!(?kind, %codec, "ignoring parameter set");
			return Ok(None);
		}

		let nal = NalIterator::new(data).next().ok_or(Error::InvalidNal)??;
		if nal::classify(codec, nal.body)? != NalKind::ParameterSet(kind) {
			return Err(Error::InvalidNal);
		}

		self.parameter_sets.insert(kind, Bytes::copy_from_slice(nal.body));

		// Wait for the last parameter set in the group, so a change isn't built from a mix of old and new.
		if required.last() != Some(&kind) {
			return Ok(None);
		}

		let Some(parameter_sets) = required
			.iter()
			.map(|kind| self.parameter_sets.get(kind).cloned())
			.collect::<Option<Vec<_>>>()
		else {
			tracing::debug!(%codec, "parameter sets incomplete");
			return Ok(None);
		};

		let description = FormatDescription {
			format: self.format,
			parameter_sets,
			nal_length_size: NAL_LENGTH_SIZE,
		};

		if self.description.as_ref() == Some(&description) {
			return Ok(None);
		}

		tracing::debug!(%codec, sets = description.parameter_sets.len(), "new format description");
		self.description = Some(description.clone());

		Ok(Some(description))
	}

	/// Convert one Annex-B picture buffer into a length-prefixed unit.
	pub fn picture(&mut self, data: &[u8], frame_type: FrameType) -> Result<PendingUnit> {
		if self.format.codec() == Codec::Av1 {
			return EncodedUnit::new(Bytes::copy_from_slice(data), frame_type);
		}

		self.block.clear();

		let mut offset = 0;
		for nal in NalIterator::new(data) {
			let nal = nal?;
			let size = u32::try_from(nal.body.len()).map_err(|_| Error::InvalidNal)?;

			update_buffer(&mut self.block, &size.to_be_bytes(), offset, NAL_LENGTH_SIZE as usize)?;
			offset += NAL_LENGTH_SIZE as i64;

			update_buffer(&mut self.block, nal.body, offset, nal.body.len())?;
			offset += nal.body.len() as i64;
		}

		EncodedUnit::new(self.block.split().freeze(), frame_type)
	}
}
