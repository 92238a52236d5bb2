use crate::globals::{self, SpyListener};
use crate::Error;

/// Events published to [`spy`] listeners.
#[derive(Debug, Clone)]
pub enum SpyEvent {
	/// An observable reported a change.
	Changed { name: String },
	/// A computed value ran its function.
	Recompute { name: String },
	Scheduled { name: String },
	/// A reaction finished a tracked run.
	Reaction { name: String },
	/// A computed value dropped its cache and dependencies.
	Suspended { name: String },
	/// A reaction failed and had no handler of its own.
	Error { name: String, error: Error },
	NonConvergent { name: String, iterations: u32 },
}

impl SpyEvent {
	pub fn name(&self) -> &str {
		match self {
			SpyEvent::Changed { name }
			| SpyEvent::Recompute { name }
			| SpyEvent::Scheduled { name }
			| SpyEvent::Reaction { name }
			| SpyEvent::Suspended { name }
			| SpyEvent::Error { name, .. }
			| SpyEvent::NonConvergent { name, .. } => name,
		}
	}
}

/// Subscribes `listener` to every graph event on this thread.
pub fn spy(listener: impl Fn(&SpyEvent) + 'static) -> Disposer {
	let id = globals::next_guid();
	globals::with(|g| g.spy_listeners.borrow_mut().push((id, std::rc::Rc::new(listener))));

	Disposer::new(move || {
		if globals::is_alive() {
			globals::with(|g| g.spy_listeners.borrow_mut().retain(|(other, _)| *other != id));
		}
	})
}

/// Builds the event only when somebody listens.
pub(crate) fn emit(event: impl FnOnce() -> SpyEvent) {
	let listeners: Vec<SpyListener> = globals::with(|g| {
		g.spy_listeners
			.borrow()
			.iter()
			.map(|(_, listener)| listener.clone())
			.collect()
	});

	if listeners.is_empty() {
		return;
	}

	let event = event();
	for listener in listeners {
		listener(&event);
	}
}

/// Unregisters a listener when dropped or disposed.
#[must_use = "dropping a Disposer unregisters the listener immediately"]
pub struct Disposer {
	dispose: Option<Box<dyn FnOnce()>>,
}

impl Disposer {
	pub(crate) fn new(dispose: impl FnOnce() + 'static) -> Self {
		Disposer {
			dispose: Some(Box::new(dispose)),
		}
	}

	pub fn dispose(mut self) {
		if let Some(dispose) = self.dispose.take() {
			dispose();
		}
	}

	/// Keeps the listener registered for the lifetime of the thread.
	pub fn forget(mut self) {
		self.dispose = None;
	}
}

impl Drop for Disposer {
	fn drop(&mut self) {
		if let Some(dispose) = self.dispose.take() {
			dispose();
		}
	}
}

impl std::fmt::Debug for Disposer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Disposer")
			.field("active", &self.dispose.is_some())
			.finish()
	}
}
