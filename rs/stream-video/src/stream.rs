use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use parking_lot::Mutex;

use crate::assemble::Assembler;
use crate::callbacks::ConnectionCallbacks;
use crate::config::Config;
use crate::decoder::{DecodeEvent, DecodeSubmitResult, DecoderSession, DecoderStatus, HardwareDecoder};
use crate::format::{ParameterSet, VideoFormat};
use crate::render::{DisplaySurface, PresentObserver, Presented, RenderDispatcher, RenderStrategy};
use crate::status::{ReturnCode, SubmitStatus};
use crate::timing::{PresentationTimeMode, PresentationTimeResolver};
use crate::unit::{BufferType, FrameInfo, FrameType};
use crate::{Error, Result};

/// Used when the host reports a refresh rate that makes no sense.
pub const DEFAULT_REFRESH_RATE: u32 = 60;

/// What to do about a unit that produced no frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
	Ignore,
	RequestIdr,

	/// Give up on the connection with this code.
	Terminate(i32),
}

/// Decides how the session reacts to lost frames.
pub trait RecoveryPolicy: Send {
	fn on_lost(&mut self, status: i32) -> Recovery;

	/// Called for every frame handed to the surface.
	fn on_frame(&mut self, is_idr: bool);
}

/// Requests a key frame for every loss, and terminates after `limit` losses without a key frame in between.
#[derive(Debug, Clone)]
pub struct IdrRecovery {
	limit: u32,
	losses: u32,
}

impl IdrRecovery {
	/// A limit of zero never terminates.
	pub fn new(limit: u32) -> Self {
		Self { limit, losses: 0 }
	}
}

impl RecoveryPolicy for IdrRecovery {
	fn on_lost(&mut self, status: i32) -> Recovery {
		// The decoder dropped the frame on purpose.
		if status == 0 {
			return Recovery::Ignore;
		}

		self.losses += 1;
		if self.limit > 0 && self.losses > self.limit {
			return Recovery::Terminate(Error::DecodeFailure(status).code());
		}

		Recovery::RequestIdr
	}

	fn on_frame(&mut self, is_idr: bool) {
		if is_idr {
			self.losses = 0;
		}
	}
}

type PolicyFactory = Arc<dyn Fn() -> Box<dyn RecoveryPolicy> + Send + Sync>;

/// Everything chosen at setup, immutable until cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
	pub format: VideoFormat,
	pub refresh_rate: u32,
	pub strategy: RenderStrategy,
	pub timing: PresentationTimeMode,
}

/// Counters for the current session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
	pub submitted: u64,
	pub presented: u64,

	/// Frames decoded but not shown.
	pub dropped: u64,

	/// Units that produced no frame.
	pub lost: u64,
}

#[derive(Debug, Default)]
struct SessionState {
	// Delta units are refused until a key frame is accepted.
	awaiting_idr: AtomicBool,
	// The sequence of the last accepted key frame. Failures before it are already recovered.
	last_idr: AtomicU64,
	terminated: AtomicBool,
	closed: Arc<AtomicBool>,

	submitted: AtomicU64,
	presented: AtomicU64,
	dropped: AtomicU64,
	lost: AtomicU64,
}

impl SessionState {
	fn request_idr(&self, callbacks: &dyn ConnectionCallbacks) {
		if !self.awaiting_idr.swap(true, Ordering::AcqRel) {
			tracing::debug!("requesting key frame");
			callbacks.request_idr_frame();
		}
	}

	fn terminate(&self, callbacks: &dyn ConnectionCallbacks, code: i32) {
		if !self.terminated.swap(true, Ordering::AcqRel) {
			tracing::error!(code, "terminating connection");
			callbacks.connection_terminated(code);
		}
	}

	fn is_terminated(&self) -> bool {
		self.terminated.load(Ordering::Acquire)
	}

	fn is_stale(&self, sequence: u64) -> bool {
		sequence < self.last_idr.load(Ordering::Acquire)
	}

	fn stats(&self) -> SessionStats {
		SessionStats {
			submitted: self.submitted.load(Ordering::Relaxed),
			presented: self.presented.load(Ordering::Relaxed),
			dropped: self.dropped.load(Ordering::Relaxed),
			lost: self.lost.load(Ordering::Relaxed),
		}
	}
}

struct Session {
	settings: SessionSettings,
	assembler: Assembler,
	resolver: PresentationTimeResolver,
	sequence: u64,
	state: Arc<SessionState>,
	worker: Option<thread::JoinHandle<()>>,
}

/// The entry point for the transport: decodes submitted buffers and presents them on a surface.
///
/// Submission never waits for decoding. Decoded frames are presented by a render worker thread,
/// which also applies the [RecoveryPolicy] to lost frames.
pub struct StreamDecoder {
	surface: Arc<dyn DisplaySurface>,
	callbacks: Arc<dyn ConnectionCallbacks>,
	config: Config,
	policy: PolicyFactory,

	decoder: DecoderSession,
	session: Option<Session>,
}

impl StreamDecoder {
	pub fn new(
		surface: Arc<dyn DisplaySurface>,
		callbacks: Arc<dyn ConnectionCallbacks>,
		hardware: Arc<dyn HardwareDecoder>,
		config: Config,
	) -> Self {
		let limit = config.recovery_limit;
		let decoder = DecoderSession::new(hardware, config.decode_queue, config.present_queue);

		Self {
			surface,
			callbacks,
			config,
			policy: Arc::new(move || -> Box<dyn RecoveryPolicy> { Box::new(IdrRecovery::new(limit)) }),
			decoder,
			session: None,
		}
	}

	/// Replace the default [IdrRecovery], starting with the next setup.
	pub fn with_recovery<F>(mut self, policy: F) -> Self
	where
		F: Fn() -> Box<dyn RecoveryPolicy> + Send + Sync + 'static,
	{
		self.policy = Arc::new(policy);
		self
	}

	/// Start a session. Unsupported formats also terminate the connection through the callbacks.
	pub fn setup(&mut self, video_format: i32, refresh_rate: i32) -> Result<()> {
		if self.session.is_some() {
			return Err(Error::AlreadySetup);
		}

		let result = self.start(video_format, refresh_rate);
		if let Err(err) = &result {
			tracing::warn!(%err, video_format, refresh_rate, "failed to setup decoder");

			if err.is_fatal() {
				self.callbacks.connection_terminated(err.code());
			}
		}

		result
	}

	fn start(&mut self, video_format: i32, refresh_rate: i32) -> Result<()> {
		let format = VideoFormat::from_code(video_format)?;

		let refresh_rate = match u32::try_from(refresh_rate) {
			Ok(rate) if rate > 0 => rate,
			_ => {
				tracing::warn!(refresh_rate, default = DEFAULT_REFRESH_RATE, "invalid refresh rate");
				DEFAULT_REFRESH_RATE
			}
		};

		self.decoder.setup(format, refresh_rate)?;

		match self.spawn(format, refresh_rate) {
			Ok(session) => {
				tracing::info!(settings = ?session.settings, "stream decoder setup");
				self.session = Some(session);
				Ok(())
			}
			Err(err) => {
				self.decoder.cleanup();
				Err(err)
			}
		}
	}

	fn spawn(&mut self, format: VideoFormat, refresh_rate: u32) -> Result<Session> {
		let assembler = Assembler::new(format);

		// Formats without parameter sets are described up front.
		if let Some(description) = assembler.description() {
			self.decoder.configure(description.clone())?;
		}

		let events = self.decoder.take_events().ok_or(Error::Closed)?;
		let state = Arc::new(SessionState::default());

		let presentation = Arc::new(Presentation {
			state: state.clone(),
			callbacks: self.callbacks.clone(),
			policy: Mutex::new((self.policy)()),
			failing: AtomicBool::new(false),
		});

		let dispatcher = RenderDispatcher::new(self.config.strategy, self.surface.clone())
			.with_closed(state.closed.clone())
			.with_observer(presentation.clone());

		let worker = RenderWorker {
			events,
			dispatcher,
			presentation,
			state: state.clone(),
		};

		let handle = thread::Builder::new()
			.name("stream-video-render".into())
			.spawn(move || worker.run())
			.map_err(|err| {
				tracing::error!(%err, "failed to spawn render worker");
				Error::Closed
			})?;

		Ok(Session {
			settings: SessionSettings {
				format,
				refresh_rate,
				strategy: self.config.strategy,
				timing: self.config.timing,
			},
			assembler,
			resolver: PresentationTimeResolver::new(self.config.timing, refresh_rate),
			sequence: 0,
			state,
			worker: Some(handle),
		})
	}

	/// Submit `data[..length]` from the transport. Returns a [SubmitStatus] code.
	pub fn submit_decode_buffer(&mut self, data: &[u8], length: i32, buffer_type: i32, frame_type: i32, pts: u32) -> i32 {
		self.submit(data, length, buffer_type, frame_type, pts).code()
	}

	fn submit(&mut self, data: &[u8], length: i32, buffer_type: i32, frame_type: i32, pts: u32) -> SubmitStatus {
		let Self {
			decoder,
			session,
			callbacks,
			..
		} = self;

		let Some(session) = session.as_mut() else {
			tracing::trace!("submit without a session");
			return SubmitStatus::Fatal;
		};

		if session.state.is_terminated() {
			return SubmitStatus::Fatal;
		}

		let Some(data) = usize::try_from(length).ok().and_then(|length| data.get(..length)) else {
			tracing::debug!(length, available = data.len(), "buffer length out of range");
			return SubmitStatus::Dropped;
		};

		let Ok(buffer_type) = BufferType::try_from(buffer_type) else {
			tracing::debug!(buffer_type, "unknown buffer type");
			return SubmitStatus::Dropped;
		};

		session.state.submitted.fetch_add(1, Ordering::Relaxed);

		let kind = match buffer_type {
			BufferType::PicData => return session.picture(decoder, callbacks.as_ref(), data, FrameType::from(frame_type), pts),
			BufferType::Sps => ParameterSet::Sps,
			BufferType::Pps => ParameterSet::Pps,
			BufferType::Vps => ParameterSet::Vps,
		};

		session.parameter_set(decoder, callbacks.as_ref(), kind, data)
	}

	pub fn settings(&self) -> Option<SessionSettings> {
		self.session.as_ref().map(|session| session.settings)
	}

	pub fn stats(&self) -> Option<SessionStats> {
		self.session.as_ref().map(|session| session.state.stats())
	}

	pub fn status(&self) -> DecoderStatus {
		self.decoder.status()
	}

	/// End the session. Frames still in flight are released without being presented.
	pub fn cleanup(&mut self) {
		let Some(mut session) = self.session.take() else {
			return;
		};

		session.state.closed.store(true, Ordering::Release);
		self.decoder.cleanup();

		if let Some(worker) = session.worker.take() {
			if worker.join().is_err() {
				tracing::warn!("render worker panicked");
			}
		}

		let stats = session.state.stats();
		tracing::info!(
			submitted = stats.submitted,
			presented = stats.presented,
			dropped = stats.dropped,
			lost = stats.lost,
			"stream decoder cleaned up"
		);
	}
}

impl Drop for StreamDecoder {
	fn drop(&mut self) {
		self.cleanup();
	}
}

impl Session {
	fn parameter_set(
		&mut self,
		decoder: &mut DecoderSession,
		callbacks: &dyn ConnectionCallbacks,
		kind: ParameterSet,
		data: &[u8],
	) -> SubmitStatus {
		let description = match self.assembler.parameter_set(kind, data) {
			Ok(Some(description)) => description,
			Ok(None) => return SubmitStatus::Ok,
			Err(err) => {
				tracing::debug!(%err, ?kind, "invalid parameter set");
				return SubmitStatus::NeedIdr;
			}
		};

		match decoder.configure(description) {
			Ok(opened) => {
				if opened {
					tracing::debug!(format = ?self.settings.format, "decoder configured, waiting for key frame");
				}

				// Nothing decoded with the old context can be referenced anymore.
				self.state.awaiting_idr.store(true, Ordering::Release);
				SubmitStatus::Ok
			}
			Err(err) if err.is_fatal() => {
				self.state.terminate(callbacks, err.code());
				SubmitStatus::Fatal
			}
			Err(err) => {
				tracing::warn!(%err, "failed to configure decoder");
				SubmitStatus::NeedIdr
			}
		}
	}

	fn picture(
		&mut self,
		decoder: &mut DecoderSession,
		callbacks: &dyn ConnectionCallbacks,
		data: &[u8],
		frame_type: FrameType,
		pts: u32,
	) -> SubmitStatus {
		if decoder.description().is_none() {
			tracing::debug!(?frame_type, "picture before parameter sets");
			self.state.request_idr(callbacks);
			return SubmitStatus::NeedIdr;
		}

		if !frame_type.is_idr() && self.state.awaiting_idr.load(Ordering::Acquire) {
			return SubmitStatus::NeedIdr;
		}

		let pending = match self.assembler.picture(data, frame_type) {
			Ok(pending) => pending,
			Err(err) => {
				tracing::debug!(%err, ?frame_type, "failed to assemble picture");
				self.state.request_idr(callbacks);
				return SubmitStatus::NeedIdr;
			}
		};

		let sequence = self.sequence;
		let timestamp = self.resolver.resolve(pts);
		let unit = pending.stamp(sequence, timestamp, self.resolver.duration());
		self.sequence += 1;

		match decoder.decode(unit) {
			DecodeSubmitResult::Accepted => {
				if frame_type.is_idr() {
					self.state.last_idr.store(sequence, Ordering::Release);
					self.state.awaiting_idr.store(false, Ordering::Release);
				}

				SubmitStatus::Ok
			}
			DecodeSubmitResult::QueueFull if frame_type.is_idr() => {
				tracing::debug!("decoder queue full, dropping key frame");
				self.state.request_idr(callbacks);
				SubmitStatus::NeedIdr
			}
			DecodeSubmitResult::QueueFull => {
				tracing::trace!("decoder queue full, dropping frame");
				SubmitStatus::Dropped
			}
			DecodeSubmitResult::Rejected => self.recover(decoder, callbacks),
		}
	}

	// The decoder refused a unit even though it was configured, so the context was lost.
	fn recover(&mut self, decoder: &mut DecoderSession, callbacks: &dyn ConnectionCallbacks) -> SubmitStatus {
		let Some(status) = decoder.take_lost() else {
			return SubmitStatus::Fatal;
		};

		let lost = Error::Hardware(status);
		match decoder.reopen() {
			Ok(()) => {
				tracing::info!(status, "decode context reopened");
				callbacks.decode_error(lost.code());
				self.state.request_idr(callbacks);
				SubmitStatus::NeedIdr
			}
			Err(err) => {
				tracing::warn!(%err, status, "failed to reopen decode context");
				self.state.terminate(callbacks, lost.code());
				SubmitStatus::Fatal
			}
		}
	}
}

// Accounts for presentation outcomes, reported by the render worker or from the surface's context.
struct Presentation {
	state: Arc<SessionState>,
	callbacks: Arc<dyn ConnectionCallbacks>,
	policy: Mutex<Box<dyn RecoveryPolicy>>,

	// Set while presentation is failing, so one key frame is requested per failure.
	failing: AtomicBool,
}

impl Presentation {
	fn shown(&self, info: &FrameInfo) {
		self.state.presented.fetch_add(1, Ordering::Relaxed);
		self.policy.lock().on_frame(info.is_idr());
		self.failing.store(false, Ordering::Release);
	}

	fn dropped(&self, info: &FrameInfo) {
		self.state.dropped.fetch_add(1, Ordering::Relaxed);

		if self.state.is_stale(info.sequence) {
			tracing::trace!(sequence = info.sequence, "dropped frame before last key frame");
			return;
		}

		if !self.failing.swap(true, Ordering::AcqRel) {
			self.state.request_idr(self.callbacks.as_ref());
		}
	}

	fn lost(&self, status: i32, info: &FrameInfo) {
		self.state.lost.fetch_add(1, Ordering::Relaxed);

		if self.state.is_stale(info.sequence) {
			tracing::trace!(status, sequence = info.sequence, "lost frame before last key frame");
			return;
		}

		let recovery = self.policy.lock().on_lost(status);
		match recovery {
			Recovery::Ignore => tracing::trace!(status, sequence = info.sequence, "frame skipped by decoder"),
			Recovery::RequestIdr => {
				tracing::debug!(status, sequence = info.sequence, "frame lost");
				self.state.request_idr(self.callbacks.as_ref());
			}
			Recovery::Terminate(code) => self.state.terminate(self.callbacks.as_ref(), code),
		}
	}
}

impl PresentObserver for Presentation {
	fn presented(&self, info: FrameInfo, result: Result<Presented>) {
		match result {
			Ok(Presented::Shown) => self.shown(&info),
			Ok(Presented::Dropped) => self.dropped(&info),
			// Reported again from the surface's context.
			Ok(Presented::Dispatched) => {}
			Err(err) => {
				tracing::debug!(%err, sequence = info.sequence, "failed to present frame");
				self.dropped(&info);
			}
		}
	}
}

struct RenderWorker {
	events: async_channel::Receiver<DecodeEvent>,
	dispatcher: RenderDispatcher,
	presentation: Arc<Presentation>,
	state: Arc<SessionState>,
}

impl RenderWorker {
	fn run(mut self) {
		while let Ok(event) = self.events.recv_blocking() {
			if self.state.closed.load(Ordering::Acquire) {
				// Dropping the event releases the frame.
				continue;
			}

			match event {
				DecodeEvent::Frame(frame) => {
					let info = frame.info();
					let result = self.dispatcher.present(frame);
					self.presentation.presented(info, result);
				}
				DecodeEvent::Lost { status, info } => self.presentation.lost(status, &info),
			}
		}

		tracing::trace!("render worker done");
	}
}

#[cfg(test)]
mod tests {
	use std::time::{Duration, Instant};

	use super::*;
	use crate::callbacks::CountingCallbacks;
	use crate::decoder::LoopbackDecoder;
	use crate::render::HeadlessSurface;

	const SPS: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0xc0, 0x1f];
	const PPS: &[u8] = &[0, 0, 0, 1, 0x68, 0xce, 0x3c, 0x80];

	const PICTURE: i32 = 0;
	const IDR: i32 = 1;
	const DELTA: i32 = 0;

	fn picture(header: u8, length: usize) -> Vec<u8> {
		let mut data = vec![0, 0, 0, 1, header, 0x88];
		data.resize(length, 0xab);
		data
	}

	struct Harness {
		surface: Arc<HeadlessSurface>,
		callbacks: Arc<CountingCallbacks>,
		hardware: LoopbackDecoder,
		decoder: StreamDecoder,
	}

	impl Harness {
		fn new(hardware: LoopbackDecoder, config: Config) -> Self {
			let surface = Arc::new(HeadlessSurface::new());
			let callbacks = Arc::new(CountingCallbacks::default());
			let decoder = StreamDecoder::new(surface.clone(), callbacks.clone(), Arc::new(hardware.clone()), config);

			Self {
				surface,
				callbacks,
				hardware,
				decoder,
			}
		}

		fn h264(config: Config) -> Self {
			let mut harness = Self::new(LoopbackDecoder::new(16, 8), config);
			harness.decoder.setup(0x0001, 60).unwrap();
			assert_eq!(harness.submit(SPS, 1, 0, 0), 0);
			assert_eq!(harness.submit(PPS, 2, 0, 0), 0);
			harness
		}

		fn submit(&mut self, data: &[u8], buffer_type: i32, frame_type: i32, pts: u32) -> i32 {
			self.decoder
				.submit_decode_buffer(data, data.len() as i32, buffer_type, frame_type, pts)
		}

		fn idr(&mut self, pts: u32) -> i32 {
			self.submit(&picture(0x65, 4096), PICTURE, IDR, pts)
		}

		fn delta(&mut self, pts: u32) -> i32 {
			self.submit(&picture(0x41, 512), PICTURE, DELTA, pts)
		}

		fn wait_presented(&self, count: usize) {
			wait_for(|| self.surface.presented().len() >= count);
			self.surface.sync();
		}
	}

	fn config() -> Config {
		Config::default().with_queues(32, 32)
	}

	fn wait_for(mut condition: impl FnMut() -> bool) {
		let deadline = Instant::now() + Duration::from_secs(5);
		while !condition() {
			assert!(Instant::now() < deadline, "timed out");
			thread::sleep(Duration::from_millis(1));
		}
	}

	#[test]
	fn test_h264_scenario() {
		let mut harness = Harness::h264(config().with_timing(PresentationTimeMode::Rtp));

		assert_eq!(harness.idr(0), 0);
		harness.wait_presented(1);
		assert!(harness.surface.presented()[0].is_idr);

		for i in 1..=10 {
			assert_eq!(harness.delta(i * 1500), 0);
		}

		harness.wait_presented(11);
		let presented = harness.surface.presented();
		assert_eq!(presented.len(), 11);
		assert!(presented[1..].iter().all(|frame| !frame.is_idr));
		assert!(presented.windows(2).all(|pair| pair[0].timestamp <= pair[1].timestamp));
		assert_eq!(presented[10].timestamp.as_micros(), 166_666);

		harness.decoder.cleanup();
		assert_eq!(harness.hardware.stats().outstanding(), 0);
		assert_eq!(harness.callbacks.idr_requests(), 0);
	}

	#[test]
	fn test_cleanup_mid_flight() {
		let hardware = LoopbackDecoder::new(16, 8).with_latency(Duration::from_millis(20));
		let mut harness = Harness::new(hardware, config());
		harness.decoder.setup(0x0001, 60).unwrap();
		harness.submit(SPS, 1, 0, 0);
		harness.submit(PPS, 2, 0, 0);

		assert_eq!(harness.idr(0), 0);
		for i in 1..=10 {
			assert_eq!(harness.delta(i), 0);
		}

		harness.decoder.cleanup();
		harness.surface.sync();
		let presented = harness.surface.presented().len();

		thread::sleep(Duration::from_millis(100));
		harness.surface.sync();
		assert_eq!(harness.surface.presented().len(), presented);
		assert!(presented < 11);

		let stats = harness.hardware.stats();
		assert_eq!(stats.outstanding(), 0);
		assert_eq!(stats.double_releases, 0);
	}

	#[test]
	fn test_release_once_every_strategy() {
		for strategy in [
			RenderStrategy::LinkedLayer,
			RenderStrategy::DispatchedLayer,
			RenderStrategy::AcceleratedDraw,
			RenderStrategy::CpuDraw,
		] {
			let mut harness = Harness::h264(config().with_strategy(strategy));

			assert_eq!(harness.idr(0), 0);
			for i in 1..=5 {
				assert_eq!(harness.delta(i), 0);
			}

			// A failing surface drops frames until the next key frame.
			harness.wait_presented(6);
			harness.surface.fail_next(1);
			assert_eq!(harness.delta(6), 0);
			assert_eq!(harness.idr(7), 0);
			harness.wait_presented(7);

			harness.decoder.cleanup();
			harness.surface.sync();

			let stats = harness.hardware.stats();
			assert_eq!(stats.produced, 8, "{strategy:?}");
			assert_eq!(stats.outstanding(), 0, "{strategy:?}");
			assert_eq!(stats.double_releases, 0, "{strategy:?}");
		}
	}

	#[test]
	fn test_submit_without_session() {
		let mut harness = Harness::new(LoopbackDecoder::new(16, 8), config());
		assert_eq!(harness.idr(0), -3);

		harness.decoder.setup(0x0001, 60).unwrap();
		harness.decoder.cleanup();
		assert_eq!(harness.idr(0), -3);
		assert_eq!(harness.decoder.status(), DecoderStatus::Uninitialized);
	}

	#[test]
	fn test_picture_before_parameter_sets() {
		let mut harness = Harness::new(LoopbackDecoder::new(16, 8), config());
		harness.decoder.setup(0x0001, 60).unwrap();

		assert_eq!(harness.idr(0), -1);
		assert_eq!(harness.delta(1), -1);
		assert_eq!(harness.callbacks.idr_requests(), 1);
	}

	#[test]
	fn test_delta_before_idr() {
		let mut harness = Harness::h264(config());
		assert_eq!(harness.delta(0), -1);
		assert_eq!(harness.idr(1), 0);
		assert_eq!(harness.delta(2), 0);
	}

	#[test]
	fn test_resume_after_failures() {
		let mut harness = Harness::h264(config());
		assert_eq!(harness.idr(0), 0);
		harness.wait_presented(1);

		harness.hardware.inject_failures(1);
		assert_eq!(harness.delta(1), 0);

		wait_for(|| harness.callbacks.idr_requests() == 1);
		assert_eq!(harness.decoder.stats().unwrap().lost, 1);
		assert_eq!(harness.delta(2), -1);

		assert_eq!(harness.idr(3), 0);
		assert_eq!(harness.delta(4), 0);
		harness.wait_presented(3);

		let presented = harness.surface.presented();
		assert_eq!(presented.iter().map(|frame| frame.sequence).collect::<Vec<_>>(), vec![0, 2, 3]);
		assert!(presented[1].is_idr);
		assert!(harness.callbacks.terminated().is_none());
	}

	#[test]
	fn test_late_loss_before_key_frame() {
		let hardware = LoopbackDecoder::new(16, 8).with_latency(Duration::from_millis(30));
		let mut harness = Harness::new(hardware, config());
		harness.decoder.setup(0x0001, 60).unwrap();
		assert_eq!(harness.submit(SPS, 1, 0, 0), 0);
		assert_eq!(harness.submit(PPS, 2, 0, 0), 0);

		assert_eq!(harness.idr(0), 0);
		harness.wait_presented(1);

		// The key frame is accepted before the loss of the unit ahead of it is reported.
		harness.hardware.inject_failures(1);
		assert_eq!(harness.delta(1), 0);
		assert_eq!(harness.idr(2), 0);
		assert_eq!(harness.delta(3), 0);
		harness.wait_presented(3);

		assert_eq!(harness.decoder.stats().unwrap().lost, 1);
		assert_eq!(harness.callbacks.idr_requests(), 0);
		assert_eq!(harness.delta(4), 0);
		harness.wait_presented(4);
	}

	#[test]
	fn test_dispatched_failure_accounting() {
		struct Recording(Arc<Mutex<Vec<bool>>>);

		impl RecoveryPolicy for Recording {
			fn on_lost(&mut self, _status: i32) -> Recovery {
				Recovery::RequestIdr
			}

			fn on_frame(&mut self, is_idr: bool) {
				self.0.lock().push(is_idr);
			}
		}

		let frames = Arc::new(Mutex::new(Vec::new()));
		let recorded = frames.clone();

		let surface = Arc::new(HeadlessSurface::new());
		let callbacks = Arc::new(CountingCallbacks::default());
		let hardware = LoopbackDecoder::new(16, 8);
		let config = config().with_strategy(RenderStrategy::DispatchedLayer);

		let mut harness = Harness {
			decoder: StreamDecoder::new(surface.clone(), callbacks.clone(), Arc::new(hardware.clone()), config)
				.with_recovery(move || Box::new(Recording(recorded.clone()))),
			surface,
			callbacks,
			hardware,
		};

		harness.decoder.setup(0x0001, 60).unwrap();
		assert_eq!(harness.submit(SPS, 1, 0, 0), 0);
		assert_eq!(harness.submit(PPS, 2, 0, 0), 0);

		assert_eq!(harness.idr(0), 0);
		wait_for(|| harness.decoder.stats().unwrap().presented == 1);

		harness.surface.fail_next(1);
		assert_eq!(harness.idr(1), 0);
		wait_for(|| harness.callbacks.idr_requests() == 1);

		let stats = harness.decoder.stats().unwrap();
		assert_eq!(stats.presented, 1);
		assert_eq!(stats.dropped, 1);
		assert_eq!(*frames.lock(), vec![true]);

		assert_eq!(harness.idr(2), 0);
		wait_for(|| harness.decoder.stats().unwrap().presented == 2);
		assert_eq!(*frames.lock(), vec![true, true]);
		assert_eq!(harness.surface.presented().len(), 2);
	}

	#[test]
	fn test_sustained_failure_terminates() {
		let mut harness = Harness::h264(config().with_recovery_limit(2));
		harness.hardware.inject_failures(10);

		for lost in 1..=3 {
			assert_eq!(harness.idr(lost), 0);
			wait_for(|| harness.decoder.stats().unwrap().lost == lost as u64);
		}

		wait_for(|| harness.callbacks.terminated().is_some());
		assert_eq!(harness.callbacks.terminated(), Some(Error::DecodeFailure(0).code()));
		assert_eq!(harness.idr(4), -3);
	}

	#[test]
	fn test_queue_full() {
		let hardware = LoopbackDecoder::new(16, 8).with_latency(Duration::from_millis(200));
		let mut harness = Harness::new(hardware, config().with_queues(1, 32));
		harness.decoder.setup(0x0001, 60).unwrap();
		harness.submit(SPS, 1, 0, 0);
		harness.submit(PPS, 2, 0, 0);

		assert_eq!(harness.idr(0), 0);
		assert_eq!(harness.decoder.status(), DecoderStatus::Decoding);
		assert_eq!(harness.delta(1), -2);
		assert_eq!(harness.idr(2), -1);
		assert_eq!(harness.callbacks.idr_requests(), 1);
	}

	#[test]
	fn test_format_change() {
		let mut harness = Harness::h264(config());
		assert_eq!(harness.idr(0), 0);
		assert_eq!(harness.hardware.opened(), 1);

		// The same parameter sets don't reopen anything.
		harness.submit(SPS, 1, 0, 0);
		harness.submit(PPS, 2, 0, 0);
		assert_eq!(harness.hardware.opened(), 1);
		assert_eq!(harness.delta(1), 0);

		let sps = [0, 0, 0, 1, 0x67, 0x64, 0x00, 0x28];
		assert_eq!(harness.submit(&sps, 1, 0, 0), 0);
		assert_eq!(harness.submit(PPS, 2, 0, 0), 0);
		assert_eq!(harness.hardware.opened(), 2);

		assert_eq!(harness.delta(2), -1);
		assert_eq!(harness.idr(3), 0);
		assert_eq!(harness.delta(4), 0);
	}

	#[test]
	#[tracing_test::traced_test]
	fn test_context_lost() {
		let mut harness = Harness::h264(config());
		assert_eq!(harness.idr(0), 0);

		harness.hardware.lose_context();
		assert_eq!(harness.delta(1), -1);
		assert_eq!(harness.callbacks.errors(), vec![Error::Hardware(0).code()]);
		assert_eq!(harness.callbacks.idr_requests(), 1);
		assert_eq!(harness.hardware.opened(), 2);
		assert!(logs_contain("decode context reopened"));

		assert_eq!(harness.idr(2), 0);
		harness.wait_presented(2);
		assert!(harness.callbacks.terminated().is_none());
	}

	#[test]
	fn test_unsupported_format() {
		let mut harness = Harness::new(LoopbackDecoder::new(16, 8), config());

		assert!(matches!(harness.decoder.setup(0x1000, 60), Err(Error::UnsupportedFormat(_))));
		assert_eq!(harness.callbacks.terminated(), Some(-1));
		assert!(harness.decoder.settings().is_none());

		assert!(matches!(harness.decoder.setup(0x0042, 60), Err(Error::UnsupportedFormat(_))));
	}

	#[test]
	fn test_setup_twice() {
		let mut harness = Harness::h264(config());
		assert_eq!(harness.decoder.setup(0x0100, 60), Err(Error::AlreadySetup));

		harness.decoder.cleanup();
		harness.decoder.setup(0x0100, 0).unwrap();

		let settings = harness.decoder.settings().unwrap();
		assert_eq!(settings.format, VideoFormat::H265);
		assert_eq!(settings.refresh_rate, DEFAULT_REFRESH_RATE);
	}

	#[test]
	fn test_bad_buffers() {
		let mut harness = Harness::h264(config());
		let idr = picture(0x65, 64);

		assert_eq!(harness.decoder.submit_decode_buffer(&idr, 65, PICTURE, IDR, 0), -2);
		assert_eq!(harness.decoder.submit_decode_buffer(&idr, -1, PICTURE, IDR, 0), -2);
		assert_eq!(harness.decoder.submit_decode_buffer(&idr, 64, 9, IDR, 0), -2);
		assert_eq!(harness.submit(&[0x65, 0x88], PICTURE, IDR, 0), -1);

		// A prefix of the buffer is a valid submission.
		assert_eq!(harness.decoder.submit_decode_buffer(&idr, 32, PICTURE, IDR, 0), 0);
	}

	#[test]
	fn test_independent_decoders() {
		let mut first = Harness::h264(config());
		let mut second = Harness::h264(config().with_strategy(RenderStrategy::CpuDraw));

		assert_eq!(first.idr(0), 0);
		assert_eq!(second.idr(0), 0);
		first.wait_presented(1);
		first.decoder.cleanup();

		assert_eq!(second.delta(1), 0);
		second.wait_presented(2);
		assert_eq!(first.surface.presented().len(), 1);
	}

	#[test]
	fn test_idr_recovery_policy() {
		let mut policy = IdrRecovery::new(2);
		assert_eq!(policy.on_lost(0), Recovery::Ignore);
		assert_eq!(policy.on_lost(-1), Recovery::RequestIdr);
		assert_eq!(policy.on_lost(-1), Recovery::RequestIdr);
		assert_eq!(policy.on_lost(-1), Recovery::Terminate(-3));

		policy.on_frame(false);
		assert_eq!(policy.on_lost(-1), Recovery::Terminate(-3));

		policy.on_frame(true);
		assert_eq!(policy.on_lost(-1), Recovery::RequestIdr);

		let mut unlimited = IdrRecovery::new(0);
		assert!((0..100).all(|_| unlimited.on_lost(-1) == Recovery::RequestIdr));
	}

	#[test]
	fn test_custom_policy() {
		struct Never;

		impl RecoveryPolicy for Never {
			fn on_lost(&mut self, _status: i32) -> Recovery {
				Recovery::Ignore
			}

			fn on_frame(&mut self, _is_idr: bool) {}
		}

		let surface = Arc::new(HeadlessSurface::new());
		let callbacks = Arc::new(CountingCallbacks::default());
		let hardware = LoopbackDecoder::new(16, 8);
		let mut decoder = StreamDecoder::new(surface, callbacks.clone(), Arc::new(hardware.clone()), config())
			.with_recovery(|| Box::new(Never));

		decoder.setup(0x0001, 60).unwrap();
		decoder.submit_decode_buffer(SPS, SPS.len() as i32, 1, 0, 0);
		decoder.submit_decode_buffer(PPS, PPS.len() as i32, 2, 0, 0);

		hardware.inject_failures(1);
		let idr = picture(0x65, 64);
		assert_eq!(decoder.submit_decode_buffer(&idr, 64, PICTURE, IDR, 0), 0);

		wait_for(|| decoder.stats().unwrap().lost == 1);
		assert_eq!(callbacks.idr_requests(), 0);
	}
}
