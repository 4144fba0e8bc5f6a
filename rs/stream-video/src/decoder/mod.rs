//! The hardware decode context and its asynchronous output path.
//!
//! A [DecoderSession] submits [EncodedUnit]s to a [HardwareSession] without waiting.
//! The hardware reports each result on its own thread through the [OutputSink],
//! which forwards them over a bounded channel as [DecodeEvent]s.

mod loopback;

pub use loopback::*;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::format::{FormatDescription, VideoFormat};
use crate::frame::{DecodedFrame, ImageBuffer};
use crate::unit::{EncodedUnit, FrameInfo};
use crate::{Error, Result};

/// A platform video decoder.
pub trait HardwareDecoder: Send + Sync {
	/// Returns true if the platform can decode this format at all.
	fn supports(&self, format: VideoFormat) -> bool;

	/// Open a decode context; every result must be reported through `sink`.
	fn open(&self, description: &FormatDescription, sink: OutputSink) -> Result<Box<dyn HardwareSession>>;
}

/// An open hardware decode context.
pub trait HardwareSession: Send {
	/// Queue a unit for decoding without waiting for the result.
	fn decode(&mut self, unit: EncodedUnit) -> std::result::Result<(), HardwareError>;

	/// Wait until every queued unit has been reported.
	fn flush(&mut self);

	/// Tear down the context. Units still queued are discarded and nothing is reported afterwards.
	fn invalidate(&mut self);
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareError {
	/// The input queue is full; try again later.
	#[error("busy")]
	Busy,

	/// The context is gone and must be reopened.
	#[error("context lost status={0}")]
	Lost(i32),
}

/// The raw result for one unit, as reported by the hardware.
#[derive(Debug)]
pub struct DecodeOutput {
	/// Zero on success.
	pub status: i32,
	pub image: Option<ImageBuffer>,
	pub info: FrameInfo,
}

/// Crosses from the hardware thread to the render worker.
#[derive(Debug)]
pub enum DecodeEvent {
	Frame(DecodedFrame),

	/// No frame was produced for this unit.
	Lost { status: i32, info: FrameInfo },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeSubmitResult {
	Accepted,
	QueueFull,
	Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderStatus {
	Uninitialized,
	Ready,

	/// At least one unit is in flight.
	Decoding,
}

#[derive(Debug, Default)]
struct SinkState {
	in_flight: AtomicUsize,
	closed: AtomicBool,
}

impl SinkState {
	fn begin(&self, depth: usize) -> bool {
		self.in_flight
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < depth).then_some(n + 1))
			.is_ok()
	}

	fn finish(&self) {
		let _ = self
			.in_flight
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
	}
}

/// Receives decode results on the hardware thread.
///
/// Never blocks: when the presentation queue is full or the session is closed, the frame is released instead.
#[derive(Clone)]
pub struct OutputSink {
	state: Arc<SinkState>,
	sender: async_channel::Sender<DecodeEvent>,
}

impl OutputSink {
	fn new(sender: async_channel::Sender<DecodeEvent>) -> Self {
		Self {
			state: Default::default(),
			sender,
		}
	}

	pub fn deliver(&self, output: DecodeOutput) {
		self.state.finish();

		if self.is_closed() {
			tracing::trace!(sequence = output.info.sequence, "discarding output after cleanup");
			return;
		}

		let event = match output {
			DecodeOutput {
				status: 0,
				image: Some(image),
				info,
			} => DecodeEvent::Frame(DecodedFrame::new(image, info)),
			DecodeOutput { status, info, .. } => {
				tracing::trace!(sequence = info.sequence, status, "decode produced no frame");
				DecodeEvent::Lost { status, info }
			}
		};

		if let Err(err) = self.sender.try_send(event) {
			// The event is dropped here, which releases the frame.
			match err {
				async_channel::TrySendError::Full(_) => tracing::debug!("presentation queue full, dropping output"),
				async_channel::TrySendError::Closed(_) => tracing::trace!("presentation queue closed"),
			}
		}
	}

	pub fn is_closed(&self) -> bool {
		self.state.closed.load(Ordering::Acquire)
	}

	fn close(&self) {
		self.state.closed.store(true, Ordering::Release);
		self.sender.close();
	}

	fn in_flight(&self) -> usize {
		self.state.in_flight.load(Ordering::Acquire)
	}
}

impl std::fmt::Debug for OutputSink {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("OutputSink")
			.field("in_flight", &self.in_flight())
			.field("closed", &self.is_closed())
			.finish()
	}
}

/// Owns one hardware decode context for the lifetime of a streaming session.
pub struct DecoderSession {
	hardware: Arc<dyn HardwareDecoder>,
	decode_queue: usize,
	present_queue: usize,

	format: Option<VideoFormat>,
	refresh_rate: u32,

	description: Option<FormatDescription>,
	context: Option<Box<dyn HardwareSession>>,
	sink: Option<OutputSink>,
	events: Option<async_channel::Receiver<DecodeEvent>>,

	// The status of the last context loss, until the caller handles it.
	lost: Option<i32>,
}

impl DecoderSession {
	pub fn new(hardware: Arc<dyn HardwareDecoder>, decode_queue: usize, present_queue: usize) -> Self {
		Self {
			hardware,
			decode_queue: decode_queue.max(1),
			present_queue: present_queue.max(1),
			format: None,
			refresh_rate: 0,
			description: None,
			context: None,
			sink: None,
			events: None,
			lost: None,
		}
	}

	pub fn setup(&mut self, format: VideoFormat, refresh_rate: u32) -> Result<()> {
		if self.format.is_some() {
			return Err(Error::AlreadySetup);
		}

		if !self.hardware.supports(format) {
			return Err(Error::UnsupportedFormat(format!("{} ({:?})", format.codec(), format)));
		}

		let (sender, receiver) = async_channel::bounded(self.present_queue);
		self.sink = Some(OutputSink::new(sender));
		self.events = Some(receiver);
		self.format = Some(format);
		self.refresh_rate = refresh_rate;

		tracing::debug!(?format, refresh_rate, "decoder session ready");

		Ok(())
	}

	/// Take the receiving end of the output channel. Available once per setup.
	pub fn take_events(&mut self) -> Option<async_channel::Receiver<DecodeEvent>> {
		self.events.take()
	}

	/// Open a decode context for these parameter sets, replacing the current one if they changed.
	///
	/// Returns true if a new context was opened.
	pub fn configure(&mut self, description: FormatDescription) -> Result<bool> {
		if self.context.is_some() && self.description.as_ref() == Some(&description) {
			return Ok(false);
		}

		self.open(description)?;
		Ok(true)
	}

	/// Reopen the context with the last parameter sets, after it was lost.
	pub fn reopen(&mut self) -> Result<()> {
		let description = self.description.clone().ok_or(Error::MissingFormat)?;
		self.open(description)
	}

	fn open(&mut self, description: FormatDescription) -> Result<()> {
		let sink = self.sink.clone().ok_or(Error::Rejected)?;

		self.close_context();

		tracing::debug!(codec = %description.codec(), sets = description.parameter_sets.len(), "opening decode context");
		let context = self.hardware.open(&description, sink)?;

		self.context = Some(context);
		self.description = Some(description);
		self.lost = None;

		Ok(())
	}

	fn close_context(&mut self) {
		if let Some(mut context) = self.context.take() {
			context.flush();
			context.invalidate();
		}

		// Nothing from the old context can arrive anymore.
		if let Some(sink) = &self.sink {
			sink.state.in_flight.store(0, Ordering::Release);
		}
	}

	pub fn decode(&mut self, unit: EncodedUnit) -> DecodeSubmitResult {
		let (Some(sink), Some(context)) = (&self.sink, &mut self.context) else {
			tracing::trace!(sequence = unit.info().sequence, "decode without a context");
			return DecodeSubmitResult::Rejected;
		};

		if !sink.state.begin(self.decode_queue) {
			return DecodeSubmitResult::QueueFull;
		}

		match context.decode(unit) {
			Ok(()) => DecodeSubmitResult::Accepted,
			Err(HardwareError::Busy) => {
				sink.state.finish();
				DecodeSubmitResult::QueueFull
			}
			Err(HardwareError::Lost(status)) => {
				tracing::warn!(status, "decode context lost");

				// Units queued on the lost context are never reported.
				sink.state.in_flight.store(0, Ordering::Release);

				if let Some(mut context) = self.context.take() {
					context.invalidate();
				}

				self.lost = Some(status);
				DecodeSubmitResult::Rejected
			}
		}
	}

	/// Returns the status of a context loss reported by the last [Self::decode], once.
	pub fn take_lost(&mut self) -> Option<i32> {
		self.lost.take()
	}

	pub fn status(&self) -> DecoderStatus {
		match &self.sink {
			None => DecoderStatus::Uninitialized,
			Some(sink) if sink.in_flight() > 0 => DecoderStatus::Decoding,
			Some(_) => DecoderStatus::Ready,
		}
	}

	pub fn format(&self) -> Option<VideoFormat> {
		self.format
	}

	pub fn refresh_rate(&self) -> u32 {
		self.refresh_rate
	}

	pub fn description(&self) -> Option<&FormatDescription> {
		self.description.as_ref()
	}

	/// Release the decode context. Output that arrives afterwards is discarded.
	pub fn cleanup(&mut self) {
		let Some(sink) = self.sink.take() else {
			return;
		};

		sink.close();

		if let Some(mut context) = self.context.take() {
			context.flush();
			context.invalidate();
		}

		self.format = None;
		self.description = None;
		self.events = None;
		self.lost = None;

		tracing::debug!("decoder session cleaned up");
	}
}

impl Drop for DecoderSession {
	fn drop(&mut self) {
		self.cleanup();
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use bytes::Bytes;

	use super::*;
	use crate::assemble::NAL_LENGTH_SIZE;
	use crate::unit::FrameType;
	use crate::Timestamp;

	fn description() -> FormatDescription {
		FormatDescription {
			format: VideoFormat::H264,
			parameter_sets: vec![
				Bytes::from_static(&[0x67, 0x42, 0xc0, 0x1f]),
				Bytes::from_static(&[0x68, 0xce, 0x3c, 0x80]),
			],
			nal_length_size: NAL_LENGTH_SIZE,
		}
	}

	fn unit(sequence: u64, frame_type: FrameType) -> EncodedUnit {
		let nal = if frame_type.is_idr() { 0x65 } else { 0x41 };
		EncodedUnit::new(vec![0, 0, 0, 2, nal, 0x88], frame_type)
			.unwrap()
			.stamp(sequence, Timestamp::from_micros(sequence * 16_666), Timestamp::from_micros(16_666))
	}

	fn recv(events: &async_channel::Receiver<DecodeEvent>) -> DecodeEvent {
		let deadline = std::time::Instant::now() + Duration::from_secs(5);
		loop {
			match events.try_recv() {
				Ok(event) => return event,
				Err(_) if std::time::Instant::now() < deadline => std::thread::sleep(Duration::from_millis(1)),
				Err(err) => panic!("no event: {err:?}"),
			}
		}
	}

	#[test]
	fn test_decode_before_setup_rejected() {
		let hardware = LoopbackDecoder::new(16, 16);
		let mut session = DecoderSession::new(Arc::new(hardware), 8, 8);

		assert_eq!(session.status(), DecoderStatus::Uninitialized);
		assert_eq!(session.decode(unit(0, FrameType::Idr)), DecodeSubmitResult::Rejected);
	}

	#[test]
	fn test_decode_without_format_rejected() {
		let mut session = DecoderSession::new(Arc::new(LoopbackDecoder::new(16, 16)), 8, 8);
		session.setup(VideoFormat::H264, 60).unwrap();

		assert_eq!(session.status(), DecoderStatus::Ready);
		assert_eq!(session.decode(unit(0, FrameType::Idr)), DecodeSubmitResult::Rejected);
	}

	#[test]
	fn test_setup_twice() {
		let mut session = DecoderSession::new(Arc::new(LoopbackDecoder::new(16, 16)), 8, 8);
		session.setup(VideoFormat::H264, 60).unwrap();
		assert_eq!(session.setup(VideoFormat::H264, 60), Err(Error::AlreadySetup));

		session.cleanup();
		session.setup(VideoFormat::H265, 120).unwrap();
		assert_eq!(session.refresh_rate(), 120);
	}

	#[test]
	fn test_unsupported_format() {
		let mut session = DecoderSession::new(Arc::new(LoopbackDecoder::new(16, 16)), 8, 8);
		assert!(matches!(
			session.setup(VideoFormat::Av1Main8, 60),
			Err(Error::UnsupportedFormat(_))
		));
		assert_eq!(session.status(), DecoderStatus::Uninitialized);
	}

	#[test]
	fn test_decode_produces_frame() {
		let hardware = LoopbackDecoder::new(16, 16);
		let mut session = DecoderSession::new(Arc::new(hardware.clone()), 8, 8);
		session.setup(VideoFormat::H264, 60).unwrap();
		let events = session.take_events().unwrap();

		assert!(session.configure(description()).unwrap());
		assert!(!session.configure(description()).unwrap());

		assert_eq!(session.decode(unit(0, FrameType::Idr)), DecodeSubmitResult::Accepted);

		match recv(&events) {
			DecodeEvent::Frame(frame) => {
				assert!(frame.is_idr());
				assert_eq!(frame.sequence(), 0);
				assert_eq!(frame.image().width, 16);
			}
			event => panic!("unexpected event: {event:?}"),
		}

		session.cleanup();
		assert_eq!(hardware.stats().outstanding(), 0);
	}

	#[test]
	fn test_failure_reported_as_lost() {
		let hardware = LoopbackDecoder::new(16, 16);
		let mut session = DecoderSession::new(Arc::new(hardware.clone()), 8, 8);
		session.setup(VideoFormat::H264, 60).unwrap();
		let events = session.take_events().unwrap();
		session.configure(description()).unwrap();

		hardware.inject_failures(1);
		assert_eq!(session.decode(unit(0, FrameType::Idr)), DecodeSubmitResult::Accepted);

		match recv(&events) {
			DecodeEvent::Lost { status, info } => {
				assert_ne!(status, 0);
				assert_eq!(info.sequence, 0);
			}
			event => panic!("unexpected event: {event:?}"),
		}
	}

	#[test]
	fn test_queue_full() {
		let hardware = LoopbackDecoder::new(16, 16).with_latency(Duration::from_millis(200));
		let mut session = DecoderSession::new(Arc::new(hardware.clone()), 2, 8);
		session.setup(VideoFormat::H264, 60).unwrap();
		session.configure(description()).unwrap();

		assert_eq!(session.decode(unit(0, FrameType::Idr)), DecodeSubmitResult::Accepted);
		assert_eq!(session.decode(unit(1, FrameType::Predicted)), DecodeSubmitResult::Accepted);
		assert_eq!(session.status(), DecoderStatus::Decoding);
		assert_eq!(session.decode(unit(2, FrameType::Predicted)), DecodeSubmitResult::QueueFull);

		session.cleanup();
		assert_eq!(session.status(), DecoderStatus::Uninitialized);
	}

	#[test]
	fn test_context_lost() {
		let hardware = LoopbackDecoder::new(16, 16);
		let mut session = DecoderSession::new(Arc::new(hardware.clone()), 8, 8);
		session.setup(VideoFormat::H264, 60).unwrap();
		session.configure(description()).unwrap();

		hardware.lose_context();
		assert_eq!(session.decode(unit(0, FrameType::Idr)), DecodeSubmitResult::Rejected);
		assert!(session.take_lost().is_some());
		assert!(session.take_lost().is_none());

		session.reopen().unwrap();
		assert_eq!(session.decode(unit(1, FrameType::Idr)), DecodeSubmitResult::Accepted);
		assert_eq!(hardware.opened(), 2);
	}

	#[test]
	fn test_decode_after_cleanup_rejected() {
		let hardware = LoopbackDecoder::new(16, 16);
		let mut session = DecoderSession::new(Arc::new(hardware.clone()), 8, 8);
		session.setup(VideoFormat::H264, 60).unwrap();
		session.configure(description()).unwrap();

		session.cleanup();
		session.cleanup();

		assert_eq!(session.decode(unit(0, FrameType::Idr)), DecodeSubmitResult::Rejected);
	}

	#[test]
	fn test_output_after_cleanup_released() {
		let hardware = LoopbackDecoder::new(16, 16).with_latency(Duration::from_millis(100));
		let mut session = DecoderSession::new(Arc::new(hardware.clone()), 8, 8);
		session.setup(VideoFormat::H264, 60).unwrap();
		let events = session.take_events().unwrap();
		session.configure(description()).unwrap();

		for sequence in 0..4 {
			let frame_type = if sequence == 0 { FrameType::Idr } else { FrameType::Predicted };
			assert_eq!(session.decode(unit(sequence, frame_type)), DecodeSubmitResult::Accepted);
		}

		session.cleanup();

		// Nothing was presented, and everything the decoder produced went back to the pool.
		assert!(events.try_recv().is_err());
		let stats = hardware.stats();
		assert_eq!(stats.outstanding(), 0);
		assert_eq!(stats.double_releases, 0);
	}
}
