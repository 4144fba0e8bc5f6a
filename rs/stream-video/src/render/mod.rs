//! Hands decoded frames to the display surface.
//!
//! The [RenderStrategy] is chosen at setup and fixed for the session.
//! Every strategy consumes the frame, so its buffer goes back to the decoder exactly once,
//! whether it was shown, dropped, or the surface failed.

mod convert;
mod headless;

pub use convert::*;
pub use headless::*;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::frame::DecodedFrame;
use crate::unit::FrameInfo;
use crate::{Error, Result};

/// Work to run on the surface's own execution context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderStrategy {
	/// Enqueue on the display layer from the render worker.
	#[default]
	LinkedLayer,

	/// Enqueue on the display layer from the surface's own context.
	DispatchedLayer,

	/// Convert with vectorized routines, then draw.
	AcceleratedDraw,

	/// Convert one pixel at a time, then draw.
	CpuDraw,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceError {
	#[error("surface not ready")]
	NotReady,

	#[error("surface failed status={0}")]
	Failed(i32),
}

impl From<SurfaceError> for Error {
	fn from(_: SurfaceError) -> Self {
		Error::SurfaceUnavailable
	}
}

/// The external view that shows decoded frames. It outlives every session drawing on it.
pub trait DisplaySurface: Send + Sync {
	/// Queue a frame on the display layer, taking ownership of it.
	fn enqueue(&self, frame: DecodedFrame) -> std::result::Result<(), SurfaceError>;

	/// Draw an already converted image.
	fn draw(&self, image: &ArgbImage, info: FrameInfo) -> std::result::Result<(), SurfaceError>;

	/// Discard anything queued, after a failure.
	fn flush(&self);

	/// Run a job on the surface's execution context.
	fn execute(&self, job: Job) {
		job()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presented {
	/// Handed to the surface.
	Shown,

	/// Skipped while waiting for a key frame.
	Dropped,

	/// Queued on the surface's context; the outcome goes to the [PresentObserver].
	Dispatched,
}

/// Told how a dispatched frame ended, on the surface's context.
pub trait PresentObserver: Send + Sync {
	fn presented(&self, info: FrameInfo, result: Result<Presented>);
}

/// Routes frames to the surface using one strategy.
pub enum RenderDispatcher {
	LinkedLayer(LinkedLayer),
	DispatchedLayer(DispatchedLayer),
	AcceleratedDraw(Draw),
	CpuDraw(Draw),
}

impl RenderDispatcher {
	pub fn new(strategy: RenderStrategy, surface: Arc<dyn DisplaySurface>) -> Self {
		match strategy {
			RenderStrategy::LinkedLayer => Self::LinkedLayer(LinkedLayer {
				surface,
				resync: Resync::default(),
			}),
			RenderStrategy::DispatchedLayer => Self::DispatchedLayer(DispatchedLayer {
				surface,
				failed: Default::default(),
				closed: Default::default(),
				observer: None,
			}),
			RenderStrategy::AcceleratedDraw => Self::AcceleratedDraw(Draw::new(surface, Converter::Accelerated)),
			RenderStrategy::CpuDraw => Self::CpuDraw(Draw::new(surface, Converter::Cpu)),
		}
	}

	/// Discard dispatched work that hasn't run yet once `closed` is set.
	pub fn with_closed(mut self, closed: Arc<AtomicBool>) -> Self {
		if let Self::DispatchedLayer(layer) = &mut self {
			layer.closed = closed;
		}

		self
	}

	/// Report the outcome of dispatched frames once they reach the surface.
	pub fn with_observer(mut self, observer: Arc<dyn PresentObserver>) -> Self {
		if let Self::DispatchedLayer(layer) = &mut self {
			layer.observer = Some(observer);
		}

		self
	}

	pub fn strategy(&self) -> RenderStrategy {
		match self {
			Self::LinkedLayer(_) => RenderStrategy::LinkedLayer,
			Self::DispatchedLayer(_) => RenderStrategy::DispatchedLayer,
			Self::AcceleratedDraw(_) => RenderStrategy::AcceleratedDraw,
			Self::CpuDraw(_) => RenderStrategy::CpuDraw,
		}
	}

	/// Hand a frame to the surface without waiting for it to be displayed.
	pub fn present(&mut self, frame: DecodedFrame) -> Result<Presented> {
		match self {
			Self::LinkedLayer(layer) => layer.present(frame),
			Self::DispatchedLayer(layer) => layer.present(frame),
			Self::AcceleratedDraw(draw) | Self::CpuDraw(draw) => draw.present(frame),
		}
	}
}

// After a failure, nothing but a key frame can be shown.
#[derive(Debug, Default)]
struct Resync {
	waiting: bool,
}

impl Resync {
	// Returns false if the frame must be dropped; flushes the surface on the key frame that ends the wait.
	fn admit(&mut self, frame: &DecodedFrame, surface: &dyn DisplaySurface) -> bool {
		if !self.waiting {
			return true;
		}

		if !frame.is_idr() {
			tracing::trace!(sequence = frame.sequence(), "dropping frame until key frame");
			return false;
		}

		surface.flush();
		self.waiting = false;
		true
	}

	fn fail(&mut self) {
		self.waiting = true;
	}
}

pub struct LinkedLayer {
	surface: Arc<dyn DisplaySurface>,
	resync: Resync,
}

impl LinkedLayer {
	fn present(&mut self, frame: DecodedFrame) -> Result<Presented> {
		if !self.resync.admit(&frame, self.surface.as_ref()) {
			return Ok(Presented::Dropped);
		}

		if let Err(err) = self.surface.enqueue(frame) {
			tracing::debug!(%err, "failed to enqueue frame");
			self.resync.fail();
			return Err(err.into());
		}

		Ok(Presented::Shown)
	}
}

pub struct DispatchedLayer {
	surface: Arc<dyn DisplaySurface>,

	// Set from the surface's context when an enqueue fails.
	failed: Arc<AtomicBool>,

	closed: Arc<AtomicBool>,
	observer: Option<Arc<dyn PresentObserver>>,
}

impl DispatchedLayer {
	fn present(&mut self, frame: DecodedFrame) -> Result<Presented> {
		if self.failed.load(Ordering::Acquire) {
			if !frame.is_idr() {
				tracing::trace!(sequence = frame.sequence(), "dropping frame until key frame");
				return Ok(Presented::Dropped);
			}

			self.failed.store(false, Ordering::Release);
			let surface = self.surface.clone();
			self.surface.execute(Box::new(move || surface.flush()));
		}

		let surface = self.surface.clone();
		let failed = self.failed.clone();
		let closed = self.closed.clone();
		let observer = self.observer.clone();

		self.surface.execute(Box::new(move || {
			if closed.load(Ordering::Acquire) {
				tracing::trace!(sequence = frame.sequence(), "discarding frame after cleanup");
				return;
			}

			let info = frame.info();
			let result = match surface.enqueue(frame) {
				Ok(()) => Ok(Presented::Shown),
				Err(err) => {
					tracing::debug!(%err, "failed to enqueue frame");
					failed.store(true, Ordering::Release);
					Err(err.into())
				}
			};

			if let Some(observer) = observer {
				observer.presented(info, result);
			}
		}));

		Ok(Presented::Dispatched)
	}
}

pub struct Draw {
	surface: Arc<dyn DisplaySurface>,
	converter: Converter,
	target: ArgbImage,
	resync: Resync,
}

impl Draw {
	fn new(surface: Arc<dyn DisplaySurface>, converter: Converter) -> Self {
		Self {
			surface,
			converter,
			target: ArgbImage::new(),
			resync: Resync::default(),
		}
	}

	fn present(&mut self, frame: DecodedFrame) -> Result<Presented> {
		if !self.resync.admit(&frame, self.surface.as_ref()) {
			return Ok(Presented::Dropped);
		}

		let info = frame.info();
		let converted = self.converter.convert(frame.image(), &mut self.target);

		// The pixels were copied out, so the decoder can have its buffer back before the draw.
		frame.release();
		converted?;

		if let Err(err) = self.surface.draw(&self.target, info) {
			tracing::debug!(%err, "failed to draw frame");
			self.resync.fail();
			return Err(err.into());
		}

		Ok(Presented::Shown)
	}
}
