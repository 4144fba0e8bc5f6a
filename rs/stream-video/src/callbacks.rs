use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Signals from the decode path back to the connection. Error codes only.
pub trait ConnectionCallbacks: Send + Sync {
	/// Ask the host for a key frame.
	fn request_idr_frame(&self);

	/// The session can't continue.
	fn connection_terminated(&self, code: i32);

	/// A recoverable error worth surfacing, such as a lost decode context.
	fn decode_error(&self, _code: i32) {}
}

/// Logs and counts every callback.
#[derive(Debug, Default)]
pub struct CountingCallbacks {
	idr_requests: AtomicUsize,
	terminated: Mutex<Option<i32>>,
	errors: Mutex<Vec<i32>>,
}

impl CountingCallbacks {
	pub fn idr_requests(&self) -> usize {
		self.idr_requests.load(Ordering::Acquire)
	}

	/// The code of the first termination, if any.
	pub fn terminated(&self) -> Option<i32> {
		*self.terminated.lock()
	}

	pub fn errors(&self) -> Vec<i32> {
		self.errors.lock().clone()
	}
}

impl ConnectionCallbacks for CountingCallbacks {
	fn request_idr_frame(&self) {
		let count = self.idr_requests.fetch_add(1, Ordering::AcqRel) + 1;
		tracing::debug!(count, "key frame requested");
	}

	fn connection_terminated(&self, code: i32) {
		tracing::warn!(code, "connection terminated");
		self.terminated.lock().get_or_insert(code);
	}

	fn decode_error(&self, code: i32) {
		tracing::info!(code, "decode error");
		self.errors.lock().push(code);
	}
}
