use std::path::Path;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use stream_video::nal::{NalIterator, NalKind, classify};
use stream_video::{BufferType, Codec, FrameType, ParameterSet};

/// A buffer as the transport would submit it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
	pub buffer_type: BufferType,
	pub frame_type: FrameType,
	pub data: Bytes,
}

impl Submission {
	pub fn is_picture(&self) -> bool {
		self.buffer_type == BufferType::PicData
	}
}

/// Read and split a capture, requiring at least one picture.
pub async fn load(codec: Codec, path: &Path) -> anyhow::Result<Vec<Submission>> {
	let data = tokio::fs::read(path)
		.await
		.with_context(|| format!("failed to read {}", path.display()))?;

	let submissions = split(codec, &data).context("invalid capture")?;
	anyhow::ensure!(submissions.iter().any(Submission::is_picture), "no pictures found");

	Ok(submissions)
}

/// Split an Annex-B capture into parameter sets and access units.
///
/// Parameter sets are submitted on their own. Everything else is grouped into pictures,
/// starting a new one at the first slice of a picture or at a non-VCL unit following a slice.
pub fn split(codec: Codec, data: &[u8]) -> anyhow::Result<Vec<Submission>> {
	let mut out = Vec::new();
	let mut picture = Picture::default();

	for nal in NalIterator::new(data) {
		let nal = nal?;
		let raw = &data[nal.offset..nal.offset + nal.start_code + nal.body.len()];

		match classify(codec, nal.body)? {
			NalKind::ParameterSet(kind) => {
				picture.finish(&mut out);
				out.push(Submission {
					buffer_type: buffer_type(kind),
					frame_type: FrameType::Predicted,
					data: Bytes::copy_from_slice(raw),
				});
			}
			NalKind::Slice { keyframe, first } => {
				if first {
					picture.finish(&mut out);
				}

				picture.slices = true;
				picture.keyframe |= keyframe;
				picture.data.extend_from_slice(raw);
			}
			NalKind::Other => {
				picture.finish(&mut out);
				picture.data.extend_from_slice(raw);
			}
		}
	}

	picture.finish(&mut out);

	Ok(out)
}

fn buffer_type(kind: ParameterSet) -> BufferType {
	match kind {
		ParameterSet::Vps => BufferType::Vps,
		ParameterSet::Sps => BufferType::Sps,
		ParameterSet::Pps => BufferType::Pps,
	}
}

#[derive(Default)]
struct Picture {
	data: BytesMut,
	slices: bool,
	keyframe: bool,
}

impl Picture {
	// Units before the first slice stay buffered for the next picture.
	fn finish(&mut self, out: &mut Vec<Submission>) {
		if !self.slices {
			return;
		}

		out.push(Submission {
			buffer_type: BufferType::PicData,
			frame_type: match self.keyframe {
				true => FrameType::Idr,
				false => FrameType::Predicted,
			},
			data: self.data.split().freeze(),
		});

		self.slices = false;
		self.keyframe = false;
	}
}
