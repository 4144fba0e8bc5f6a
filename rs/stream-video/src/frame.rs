use std::sync::Arc;

use bytes::Bytes;

use crate::unit::FrameInfo;
use crate::Timestamp;

/// The layout of a decoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum PixelFormat {
	/// 8-bit 4:2:0, a luma plane followed by an interleaved chroma plane.
	#[display("nv12")]
	Nv12,

	/// 8-bit interleaved, one plane.
	#[display("bgra")]
	Bgra,
}

#[derive(Debug, Clone)]
pub struct Plane {
	pub data: Bytes,

	/// Bytes per row, at least the visible width.
	pub stride: usize,
}

/// Owns the pixel buffers handed out by a decoder.
pub trait BufferPool: Send + Sync {
	/// Return a buffer to the pool. Called exactly once per lease.
	fn release(&self, id: u64);
}

/// A claim on one pooled buffer, returned to the pool when dropped.
///
/// Every path that consumes a frame ends by dropping it, so the buffer goes back exactly once.
pub struct BufferLease {
	id: u64,
	pool: Option<Arc<dyn BufferPool>>,
}

impl BufferLease {
	pub fn new(id: u64, pool: Arc<dyn BufferPool>) -> Self {
		Self { id, pool: Some(pool) }
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	/// Return the buffer now rather than at the end of scope.
	pub fn release(self) {}
}

impl Drop for BufferLease {
	fn drop(&mut self) {
		if let Some(pool) = self.pool.take() {
			pool.release(self.id);
		}
	}
}

impl std::fmt::Debug for BufferLease {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BufferLease").field("id", &self.id).finish()
	}
}

/// A decoded image, still owned by the decoder's pool.
#[derive(Debug)]
pub struct ImageBuffer {
	pub width: u32,
	pub height: u32,
	pub format: PixelFormat,
	pub planes: Vec<Plane>,

	lease: BufferLease,
}

impl ImageBuffer {
	pub fn new(width: u32, height: u32, format: PixelFormat, planes: Vec<Plane>, lease: BufferLease) -> Self {
		Self {
			width,
			height,
			format,
			planes,
			lease,
		}
	}

	pub fn lease(&self) -> &BufferLease {
		&self.lease
	}

	pub fn release(self) {
		self.lease.release()
	}
}

/// One decoder output on its way to the display.
///
/// Only the decoder output path creates these; the render path consumes each exactly once.
#[derive(Debug)]
pub struct DecodedFrame {
	image: ImageBuffer,
	info: FrameInfo,
}

impl DecodedFrame {
	pub(crate) fn new(image: ImageBuffer, info: FrameInfo) -> Self {
		Self { image, info }
	}

	pub fn image(&self) -> &ImageBuffer {
		&self.image
	}

	pub fn info(&self) -> FrameInfo {
		self.info
	}

	pub fn timestamp(&self) -> Timestamp {
		self.info.timestamp
	}

	pub fn duration(&self) -> Timestamp {
		self.info.duration
	}

	pub fn is_idr(&self) -> bool {
		self.info.is_idr()
	}

	pub fn sequence(&self) -> u64 {
		self.info.sequence
	}

	/// Consume the frame, returning its buffer to the pool.
	pub fn release(self) {
		self.image.release()
	}
}
