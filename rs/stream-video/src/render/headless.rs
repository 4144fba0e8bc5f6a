use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use parking_lot::Mutex;

use super::{ArgbImage, DisplaySurface, Job, SurfaceError};
use crate::frame::DecodedFrame;
use crate::unit::FrameInfo;
use crate::Timestamp;

/// A frame as it reached a [HeadlessSurface].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentedFrame {
	pub sequence: u64,
	pub timestamp: Timestamp,
	pub is_idr: bool,

	/// The top left pixel, for drawn frames.
	pub pixel: Option<[u8; 4]>,
}

#[derive(Default)]
struct Record {
	presented: Vec<PresentedFrame>,
	flushes: usize,
}

/// A surface that displays nothing and remembers everything.
///
/// It owns an execution thread, so dispatched work runs off the caller's thread like it would on a real view.
pub struct HeadlessSurface {
	record: Mutex<Record>,
	failures: AtomicUsize,

	jobs: async_channel::Sender<Job>,
	thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl HeadlessSurface {
	pub fn new() -> Self {
		let (jobs, receiver) = async_channel::unbounded::<Job>();

		let thread = thread::Builder::new()
			.name("headless-surface".into())
			.spawn(move || {
				while let Ok(job) = receiver.recv_blocking() {
					job();
				}
			})
			.inspect_err(|err| tracing::warn!(%err, "failed to spawn surface thread, running jobs inline"))
			.ok();

		Self {
			record: Default::default(),
			failures: AtomicUsize::new(0),
			jobs,
			thread: Mutex::new(thread),
		}
	}

	/// Fail the next `count` enqueue or draw calls.
	pub fn fail_next(&self, count: usize) {
		self.failures.fetch_add(count, Ordering::AcqRel);
	}

	pub fn presented(&self) -> Vec<PresentedFrame> {
		self.record.lock().presented.clone()
	}

	pub fn flushes(&self) -> usize {
		self.record.lock().flushes
	}

	/// Wait until every job executed so far has run. Must not be called from a job.
	pub fn sync(&self) {
		let (done, wait) = async_channel::bounded(1);
		self.execute(Box::new(move || {
			let _ = done.try_send(());
		}));
		let _ = wait.recv_blocking();
	}

	fn fail(&self) -> bool {
		self.failures
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
			.is_ok()
	}
}

impl Default for HeadlessSurface {
	fn default() -> Self {
		Self::new()
	}
}

impl DisplaySurface for HeadlessSurface {
	fn enqueue(&self, frame: DecodedFrame) -> Result<(), SurfaceError> {
		if self.fail() {
			return Err(SurfaceError::NotReady);
		}

		self.record.lock().presented.push(PresentedFrame {
			sequence: frame.sequence(),
			timestamp: frame.timestamp(),
			is_idr: frame.is_idr(),
			pixel: None,
		});

		Ok(())
	}

	fn draw(&self, image: &ArgbImage, info: FrameInfo) -> Result<(), SurfaceError> {
		if self.fail() {
			return Err(SurfaceError::NotReady);
		}

		self.record.lock().presented.push(PresentedFrame {
			sequence: info.sequence,
			timestamp: info.timestamp,
			is_idr: info.is_idr(),
			pixel: image.pixel(0, 0),
		});

		Ok(())
	}

	fn flush(&self) {
		self.record.lock().flushes += 1;
	}

	fn execute(&self, job: Job) {
		if self.thread.lock().is_none() {
			return job();
		}

		// Only fails once the surface is going away.
		if let Err(err) = self.jobs.try_send(job) {
			err.into_inner()();
		}
	}
}

impl Drop for HeadlessSurface {
	fn drop(&mut self) {
		self.jobs.close();

		let handle = self.thread.lock().take();
		if let Some(handle) = handle {
			// The last reference can be dropped by a job on the surface thread itself.
			if handle.thread().id() != thread::current().id() && handle.join().is_err() {
				tracing::warn!("surface thread panicked");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;

	#[test]
	fn test_execute_off_thread() {
		let surface = HeadlessSurface::new();
		let caller = thread::current().id();
		let ran = Arc::new(Mutex::new(None));

		let record = ran.clone();
		surface.execute(Box::new(move || *record.lock() = Some(thread::current().id())));
		surface.sync();

		let ran = (*ran.lock()).expect("job did not run");
		assert_ne!(ran, caller);
	}

	#[test]
	fn test_failures_counted() {
		let surface = HeadlessSurface::new();
		surface.fail_next(2);

		assert!(surface.fail());
		assert!(surface.fail());
		assert!(!surface.fail());
	}

	#[test]
	fn test_dropped_from_own_thread() {
		let surface = Arc::new(HeadlessSurface::new());
		let (done, wait) = async_channel::bounded(1);

		let inner = surface.clone();
		surface.execute(Box::new(move || {
			drop(inner);
			let _ = done.try_send(());
		}));

		// The job may hold the last reference.
		drop(surface);
		wait.recv_blocking().unwrap();
	}
}
