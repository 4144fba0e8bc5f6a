use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use super::{DecodeOutput, HardwareDecoder, HardwareError, HardwareSession, OutputSink};
use crate::format::{Codec, FormatDescription, VideoFormat};
use crate::frame::{BufferLease, BufferPool, ImageBuffer, PixelFormat, Plane};
use crate::unit::EncodedUnit;
use crate::{Error, Result};

/// The unit could not be decoded.
pub const STATUS_BAD_DATA: i32 = -12909;

/// The decode context is no longer usable.
pub const STATUS_INVALID_SESSION: i32 = -12903;

/// A software stand-in for a hardware decoder.
///
/// It validates the length-prefixed framing, tracks whether it holds a reference picture,
/// and outputs a flat NV12 image per unit from a counting pool.
/// Each open context runs on its own thread, like a hardware callback queue.
#[derive(Clone)]
pub struct LoopbackDecoder {
	width: u32,
	height: u32,
	latency: Duration,
	depth: usize,
	codecs: Vec<Codec>,

	state: Arc<LoopbackState>,
}

#[derive(Default)]
struct LoopbackState {
	failures: AtomicUsize,
	lose: AtomicBool,
	opened: AtomicUsize,
	pool: Arc<CountingPool>,
}

impl LoopbackDecoder {
	pub fn new(width: u32, height: u32) -> Self {
		Self {
			width,
			height,
			latency: Duration::ZERO,
			depth: 16,
			codecs: vec![Codec::H264, Codec::H265],
			state: Default::default(),
		}
	}

	/// Time spent on every unit before its output is reported.
	pub fn with_latency(mut self, latency: Duration) -> Self {
		self.latency = latency;
		self
	}

	/// The size of the input queue, beyond which [HardwareError::Busy] is returned.
	pub fn with_depth(mut self, depth: usize) -> Self {
		self.depth = depth.max(1);
		self
	}

	pub fn with_codecs(mut self, codecs: &[Codec]) -> Self {
		self.codecs = codecs.to_vec();
		self
	}

	/// Fail the next `count` units with [STATUS_BAD_DATA], which also drops the reference picture.
	pub fn inject_failures(&self, count: usize) {
		self.state.failures.fetch_add(count, Ordering::AcqRel);
	}

	/// Report the context as lost on the next submission.
	pub fn lose_context(&self) {
		self.state.lose.store(true, Ordering::Release);
	}

	/// The number of contexts opened so far.
	pub fn opened(&self) -> usize {
		self.state.opened.load(Ordering::Acquire)
	}

	pub fn stats(&self) -> PoolStats {
		self.state.pool.stats()
	}
}

impl HardwareDecoder for LoopbackDecoder {
	fn supports(&self, format: VideoFormat) -> bool {
		self.codecs.contains(&format.codec())
	}

	fn open(&self, description: &FormatDescription, sink: OutputSink) -> Result<Box<dyn HardwareSession>> {
		let codec = description.codec();
		if !self.codecs.contains(&codec) {
			return Err(Error::UnsupportedFormat(codec.to_string()));
		}

		if description.parameter_sets.len() != codec.required_parameter_sets().len() {
			return Err(Error::Hardware(STATUS_BAD_DATA));
		}

		let (sender, receiver) = async_channel::bounded(self.depth);
		let invalidated = Arc::new(AtomicBool::new(false));

		let worker = Worker {
			receiver,
			sink,
			invalidated: invalidated.clone(),
			width: self.width,
			height: self.height,
			latency: self.latency,
			state: self.state.clone(),
			reference: false,
		};

		let handle = thread::Builder::new()
			.name("loopback-decoder".into())
			.spawn(move || worker.run())
			.map_err(|_| Error::Hardware(STATUS_INVALID_SESSION))?;

		self.state.opened.fetch_add(1, Ordering::AcqRel);
		tracing::debug!(%codec, width = self.width, height = self.height, "opened loopback context");

		Ok(Box::new(LoopbackSession {
			sender,
			invalidated,
			handle: Some(handle),
			state: self.state.clone(),
		}))
	}
}

enum Job {
	Decode(EncodedUnit),
	Flush(async_channel::Sender<()>),
}

struct LoopbackSession {
	sender: async_channel::Sender<Job>,
	invalidated: Arc<AtomicBool>,
	handle: Option<thread::JoinHandle<()>>,
	state: Arc<LoopbackState>,
}

impl HardwareSession for LoopbackSession {
	fn decode(&mut self, unit: EncodedUnit) -> std::result::Result<(), HardwareError> {
		if self.state.lose.swap(false, Ordering::AcqRel) {
			return Err(HardwareError::Lost(STATUS_INVALID_SESSION));
		}

		match self.sender.try_send(Job::Decode(unit)) {
			Ok(()) => Ok(()),
			Err(async_channel::TrySendError::Full(_)) => Err(HardwareError::Busy),
			Err(async_channel::TrySendError::Closed(_)) => Err(HardwareError::Lost(STATUS_INVALID_SESSION)),
		}
	}

	fn flush(&mut self) {
		let (done, wait) = async_channel::bounded(1);
		if self.sender.send_blocking(Job::Flush(done)).is_ok() {
			let _ = wait.recv_blocking();
		}
	}

	fn invalidate(&mut self) {
		self.invalidated.store(true, Ordering::Release);
		self.sender.close();

		if let Some(handle) = self.handle.take() {
			if handle.join().is_err() {
				tracing::warn!("loopback decoder thread panicked");
			}
		}
	}
}

impl Drop for LoopbackSession {
	fn drop(&mut self) {
		self.invalidate();
	}
}

struct Worker {
	receiver: async_channel::Receiver<Job>,
	sink: OutputSink,
	invalidated: Arc<AtomicBool>,

	width: u32,
	height: u32,
	latency: Duration,
	state: Arc<LoopbackState>,

	// Set once an IDR decodes, cleared by any failure.
	reference: bool,
}

impl Worker {
	fn run(mut self) {
		while let Ok(job) = self.receiver.recv_blocking() {
			match job {
				Job::Flush(done) => {
					let _ = done.try_send(());
				}
				Job::Decode(unit) => {
					if self.invalidated.load(Ordering::Acquire) {
						continue;
					}

					if !self.latency.is_zero() && !self.sink.is_closed() {
						thread::sleep(self.latency);
					}

					let output = self.decode(unit);
					self.sink.deliver(output);
				}
			}
		}
	}

	fn decode(&mut self, unit: EncodedUnit) -> DecodeOutput {
		let (payload, info) = unit.into_parts();

		let injected = self
			.state
			.failures
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
			.is_ok();

		let status = if injected || !is_length_prefixed(&payload) {
			self.reference = false;
			STATUS_BAD_DATA
		} else if !info.is_idr() && !self.reference {
			// Nothing to predict from.
			STATUS_BAD_DATA
		} else {
			0
		};

		if status != 0 {
			return DecodeOutput {
				status,
				image: None,
				info,
			};
		}

		self.reference = true;

		DecodeOutput {
			status,
			image: Some(self.image(info.sequence)),
			info,
		}
	}

	fn image(&self, sequence: u64) -> ImageBuffer {
		let stride = (self.width as usize + 1) & !1;
		let rows = self.height as usize;

		// Vary the brightness so consecutive frames differ.
		let luma = 16 + (sequence % 220) as u8;

		let planes = vec![
			Plane {
				data: Bytes::from(vec![luma; stride * rows]),
				stride,
			},
			Plane {
				data: Bytes::from(vec![128; stride * rows.div_ceil(2)]),
				stride,
			},
		];

		let pool = self.state.pool.clone();
		let lease = BufferLease::new(pool.acquire(), pool);

		ImageBuffer::new(self.width, self.height, PixelFormat::Nv12, planes, lease)
	}
}

// Every NAL must be preceded by a non-zero 4 byte big-endian length that fits the payload.
fn is_length_prefixed(mut payload: &[u8]) -> bool {
	if payload.is_empty() {
		return false;
	}

	while !payload.is_empty() {
		let Some((size, rest)) = payload.split_first_chunk::<4>() else {
			return false;
		};

		let size = u32::from_be_bytes(*size) as usize;
		if size == 0 || size > rest.len() {
			return false;
		}

		payload = &rest[size..];
	}

	true
}

/// Counts how often buffers leave and return to a [LoopbackDecoder].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
	pub produced: u64,
	pub released: u64,

	/// Buffers returned more than once; always zero unless a lease is broken.
	pub double_releases: u64,
}

impl PoolStats {
	pub fn outstanding(&self) -> u64 {
		self.produced.saturating_sub(self.released)
	}
}

#[derive(Default)]
struct CountingPool {
	next: AtomicU64,
	released: Mutex<HashSet<u64>>,
	double: AtomicU64,
}

impl CountingPool {
	fn acquire(&self) -> u64 {
		self.next.fetch_add(1, Ordering::AcqRel)
	}

	fn stats(&self) -> PoolStats {
		PoolStats {
			produced: self.next.load(Ordering::Acquire),
			released: self.released.lock().len() as u64,
			double_releases: self.double.load(Ordering::Acquire),
		}
	}
}

impl BufferPool for CountingPool {
	fn release(&self, id: u64) {
		if !self.released.lock().insert(id) {
			tracing::warn!(id, "buffer released twice");
			self.double.fetch_add(1, Ordering::AcqRel);
		}
	}
}
