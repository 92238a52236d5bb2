use std::rc::Rc;

use crate::Derived;

/// Handle to the derivation whose tracked function is running.
///
/// Every computed function and reaction body receives one.
pub struct Evaluation {
	derived: Rc<dyn Derived>,
}

impl AsRef<Evaluation> for Evaluation {
	fn as_ref(&self) -> &Evaluation {
		self
	}
}

impl Evaluation {
	pub(crate) fn new(derived: Rc<dyn Derived>) -> Self {
		Evaluation { derived }
	}

	pub fn name(&self) -> &str {
		self.derived.name()
	}

	pub fn run_id(&self) -> u64 {
		self.derived.derivation().run_id()
	}

	/// Number of observables recorded so far in this run.
	pub fn reads(&self) -> usize {
		self.derived.derivation().new_observing.borrow().len()
	}

	/// Disposes the running reaction once this run completes.
	/// Computed values ignore it.
	pub fn dispose(&self) {
		self.derived.dispose();
	}

	pub fn untracked<R>(&self, func: impl FnOnce() -> R) -> R {
		crate::untracked(func)
	}
}
