use std::cell::{Cell, RefCell};
use std::fmt::Debug;
use std::rc::{Rc, Weak};

use smallvec::SmallVec;

use crate::evaluation::Evaluation;
use crate::globals;
use crate::propagation::{add_observer, remove_observer};
use crate::{addr_of, Derived, Error, Observable, State};

/// Dependency bookkeeping shared by computed values and reactions.
pub struct DerivationCore {
	pub(crate) this: Weak<dyn Derived>,
	pub(crate) addr: usize,
	/// Deduplicated observables read during the last run, in read order.
	pub(crate) observing: RefCell<Vec<Rc<dyn Observable>>>,
	/// Reads of the current run. A node read again after a nested derivation
	/// touched it may appear twice.
	pub(crate) new_observing: RefCell<Vec<Rc<dyn Observable>>>,
	pub(crate) run_id: Cell<u64>,
	pub(crate) state: Cell<State>,
	pub(crate) requires_observable: bool,
}

impl DerivationCore {
	pub(crate) fn new(this: Weak<dyn Derived>, requires_observable: bool) -> Self {
		DerivationCore {
			addr: addr_of(&this),
			this,
			observing: RefCell::new(Vec::new()),
			new_observing: RefCell::new(Vec::new()),
			run_id: Cell::new(0),
			state: Cell::new(State::NotTracking),
			requires_observable,
		}
	}

	pub fn state(&self) -> State {
		self.state.get()
	}

	/// Id of the latest run, 0 if the derivation never ran.
	pub fn run_id(&self) -> u64 {
		self.run_id.get()
	}

	pub fn observing_count(&self) -> usize {
		self.observing.borrow().len()
	}

	pub fn observing_names(&self) -> Vec<String> {
		self.observing
			.borrow()
			.iter()
			.map(|dep| dep.core().name().to_owned())
			.collect()
	}
}

impl Debug for DerivationCore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DerivationCore")
			.field("state", &self.state.get())
			.field("run_id", &self.run_id.get())
			.field("observing", &self.observing_names())
			.finish()
	}
}

/// Decides whether `derived` has to run again.
///
/// A possibly stale derivation refreshes its computed dependencies in order
/// and stops at the first one that actually changed (or failed).
pub(crate) fn should_compute(derived: &dyn Derived) -> bool {
	let derivation = derived.derivation();
	match derivation.state.get() {
		State::UpToDate => false,
		State::NotTracking | State::Stale => true,
		State::PossiblyStale => {
			let prev = globals::untracked_start();
			let observing: SmallVec<[Rc<dyn Observable>; 8]> =
				derivation.observing.borrow().iter().cloned().collect();

			for dep in observing {
				if let Some(result) = dep.refresh() {
					if result.is_err() || derivation.state.get() == State::Stale {
						globals::untracked_end(prev);
						return true;
					}
				}
			}

			change_dependencies_state_to_0(derived);
			globals::untracked_end(prev);
			false
		}
	}
}

/// Runs `func` with `derived` as the tracking derivation, then rebinds its
/// dependencies to whatever `func` read.
pub(crate) fn track_derived_function<R>(
	derived: &Rc<dyn Derived>,
	func: impl FnOnce(&Evaluation) -> Result<R, Error>,
) -> Result<R, Error> {
	let derivation = derived.derivation();
	change_dependencies_state_to_0(&**derived);

	{
		let capacity = if derivation.run_id.get() == 0 {
			16
		} else {
			derivation.observing.borrow().len()
		};
		*derivation.new_observing.borrow_mut() = Vec::with_capacity(capacity);
	}
	derivation.run_id.set(globals::next_run_id());

	let prev = globals::set_tracking_derivation(Some(derived.clone()));
	globals::with(|g| g.in_batch.set(g.in_batch.get() + 1));

	let evaluation = Evaluation::new(derived.clone());
	let result = func(&evaluation);

	globals::with(|g| g.in_batch.set(g.in_batch.get() - 1));
	globals::set_tracking_derivation(prev);

	bind_dependencies(&**derived);
	warn_about_derivation_without_dependencies(&**derived);

	result
}

/// Reconciles the previous dependency list with the reads of the last run.
///
/// Linear in the number of reads: every node carries a `diff_value` marker
/// which is 0 before and after the pass.
pub(crate) fn bind_dependencies(derived: &dyn Derived) {
	let derivation = derived.derivation();
	let prev_observing = derivation.observing.take();
	let mut observing = derivation.new_observing.take();

	let mut lowest_new_state = State::UpToDate;
	let mut i0 = 0;
	for i in 0..observing.len() {
		count_diff_op();
		let (fresh, state) = {
			let dep = &observing[i];
			let core = dep.core();
			let fresh = core.diff_value.get() == 0;
			if fresh {
				core.diff_value.set(1);
			}
			(fresh, dep.derivation_state())
		};

		if fresh {
			if i0 != i {
				observing.swap(i0, i);
			}
			i0 += 1;
		}

		// A computed dependency may have gone stale while we were still running.
		if let Some(state) = state {
			if state > lowest_new_state {
				lowest_new_state = state;
			}
		}
	}
	observing.truncate(i0);

	for dep in prev_observing.iter().rev() {
		count_diff_op();
		let core = dep.core();
		if core.diff_value.get() == 0 {
			remove_observer(&**dep, derivation.addr);
		}
		core.diff_value.set(0);
	}

	for dep in observing.iter().rev() {
		count_diff_op();
		let core = dep.core();
		if core.diff_value.get() == 1 {
			core.diff_value.set(0);
			add_observer(&**dep, derived);
		}
	}

	*derivation.observing.borrow_mut() = observing;

	if lowest_new_state != State::UpToDate {
		derivation.state.set(lowest_new_state);
		derived.on_become_stale();
	}
}

/// Detaches `derived` from everything it observes.
pub(crate) fn clear_observing(derived: &dyn Derived) {
	let derivation = derived.derivation();
	let observing = derivation.observing.take();
	for dep in observing.iter().rev() {
		remove_observer(&**dep, derivation.addr);
	}
	derivation.state.set(State::NotTracking);
}

pub(crate) fn change_dependencies_state_to_0(derived: &dyn Derived) {
	let derivation = derived.derivation();
	if derivation.state.get() == State::UpToDate {
		return;
	}
	derivation.state.set(State::UpToDate);

	for dep in derivation.observing.borrow().iter() {
		dep.core().lowest_observer_state.set(State::UpToDate);
	}
}

/// Refreshes every computed dependency of `derived` and marks it up to date
/// without running it.
///
/// Used for derivations whose queued run was dropped: afterwards the chain
/// above them is current again, so the next change reaches them.
pub(crate) fn settle(derived: &dyn Derived) {
	let derivation = derived.derivation();
	let prev = globals::untracked_start();
	let observing: SmallVec<[Rc<dyn Observable>; 8]> =
		derivation.observing.borrow().iter().cloned().collect();

	for dep in observing {
		// Failures stay memoized in the computed value.
		if let Some(Err(err)) = dep.refresh() {
			tracing::debug!(derivation = derived.name(), error = %err, "dependency failed while settling");
		}
	}

	change_dependencies_state_to_0(derived);
	globals::untracked_end(prev);
}

fn warn_about_derivation_without_dependencies(derived: &dyn Derived) {
	let derivation = derived.derivation();
	if derivation.requires_observable && derivation.observing.borrow().is_empty() {
		tracing::warn!(
			derivation = derived.name(),
			"derivation is created or updated without reading any observable value"
		);
	}
}

#[cfg(test)]
thread_local! {
	static DIFF_OPS: Cell<usize> = Cell::new(0);
}

#[cfg(test)]
fn count_diff_op() {
	DIFF_OPS.with(|ops| ops.set(ops.get() + 1));
}

#[cfg(not(test))]
#[inline(always)]
fn count_diff_op() {}
