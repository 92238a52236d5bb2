use std::cell::{RefCell, RefMut};
use std::rc::Rc;

use mockall::*;

#[automock]
pub trait Spy {
	fn trigger(&self, value: i64);
}

/// A mock that reactions can capture by value.
#[derive(Clone)]
pub struct SharedMock(Rc<RefCell<MockSpy>>);

impl SharedMock {
	pub fn new() -> SharedMock {
		SharedMock(Rc::new(RefCell::new(MockSpy::new())))
	}

	pub fn get(&self) -> RefMut<'_, MockSpy> {
		self.0.borrow_mut()
	}
}

/// Ordered record of what reactions saw.
#[derive(Clone, Default)]
pub struct Log<T>(Rc<RefCell<Vec<T>>>);

impl<T: Clone> Log<T> {
	pub fn push(&self, value: T) {
		self.0.borrow_mut().push(value);
	}

	pub fn take(&self) -> Vec<T> {
		std::mem::take(&mut *self.0.borrow_mut())
	}

	pub fn len(&self) -> usize {
		self.0.borrow().len()
	}
}

/// Counts how many times a closure ran.
#[derive(Clone, Default)]
pub struct Counter(Rc<std::cell::Cell<usize>>);

impl Counter {
	pub fn hit(&self) {
		self.0.set(self.0.get() + 1);
	}

	pub fn get(&self) -> usize {
		self.0.get()
	}
}

pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

#[derive(Clone, Default)]
struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for Captured {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		self.0.lock().unwrap().extend_from_slice(buf);
		Ok(buf.len())
	}

	fn flush(&mut self) -> std::io::Result<()> {
		Ok(())
	}
}

/// Runs `func` with a subscriber that records every event on this thread.
pub fn capture_logs<R>(func: impl FnOnce() -> R) -> (R, String) {
	let captured = Captured::default();
	let subscriber = tracing_subscriber::fmt()
		.with_max_level(tracing::Level::TRACE)
		.with_writer({
			let captured = captured.clone();
			move || captured.clone()
		})
		.finish();

	let result = tracing::subscriber::with_default(subscriber, func);
	let logs = String::from_utf8_lossy(&captured.0.lock().unwrap()).into_owned();
	(result, logs)
}
