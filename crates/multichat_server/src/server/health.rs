#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hyper::StatusCode;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	/// Status and body for `/healthz` and `/readyz`; `None` for other paths.
	pub fn probe(&self, path: &str) -> Option<(StatusCode, &'static str)> {
		match path {
			"/healthz" => Some((StatusCode::OK, "ok")),
			"/readyz" if self.is_ready() => Some((StatusCode::OK, "ready")),
			"/readyz" => Some((StatusCode::SERVICE_UNAVAILABLE, "not-ready")),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ready_after_mark() {
		let state = HealthState::new();
		assert_eq!(state.probe("/healthz"), Some((StatusCode::OK, "ok")));
		assert_eq!(state.probe("/readyz"), Some((StatusCode::SERVICE_UNAVAILABLE, "not-ready")));

		state.clone().mark_ready();
		assert_eq!(state.probe("/readyz"), Some((StatusCode::OK, "ready")));
		assert_eq!(state.probe("/metrics"), None);
	}
}
