use crate::globals;
use crate::{Derived, Observable, State};

pub(crate) fn add_observer(observable: &dyn Observable, derived: &dyn Derived) {
	let core = observable.core();
	let derivation = derived.derivation();
	core.observers
		.borrow_mut()
		.insert(derivation.addr, derivation.this.clone());

	let state = derivation.state.get();
	if core.lowest_observer_state.get() > state {
		core.lowest_observer_state.set(state);
	}
}

/// Detaches the derivation at `addr`; an emptied node is queued for cleanup.
pub(crate) fn remove_observer(observable: &dyn Observable, addr: usize) {
	let core = observable.core();
	let now_empty = {
		let mut observers = core.observers.borrow_mut();
		observers.swap_remove(&addr);
		observers.is_empty()
	};

	if now_empty {
		queue_for_unobservation(observable);
	}
}

pub(crate) fn queue_for_unobservation(observable: &dyn Observable) {
	let core = observable.core();
	if core.is_pending_unobservation.get() {
		return;
	}

	if let Some(rc) = core.this.upgrade() {
		core.is_pending_unobservation.set(true);
		globals::with(|g| g.pending_unobservations.borrow_mut().push(rc));
	}
}

/// A direct dependency of every observer changed.
pub(crate) fn propagate_changed(observable: &dyn Observable) {
	let core = observable.core();
	if core.lowest_observer_state.get() == State::Stale {
		return;
	}
	core.lowest_observer_state.set(State::Stale);

	for derived in core.observers_snapshot() {
		let derivation = derived.derivation();
		if derivation.state.get() == State::UpToDate {
			derived.on_become_stale();
		}
		derivation.state.set(State::Stale);
	}
}

/// A computed value recomputed and its value differs from the memoized one.
pub(crate) fn propagate_change_confirmed(observable: &dyn Observable) {
	let core = observable.core();
	if core.lowest_observer_state.get() == State::Stale {
		return;
	}
	core.lowest_observer_state.set(State::Stale);

	for derived in core.observers_snapshot() {
		let derivation = derived.derivation();
		match derivation.state.get() {
			State::PossiblyStale => derivation.state.set(State::Stale),
			// The observer is recomputing right now and already read us.
			State::UpToDate => core.lowest_observer_state.set(State::UpToDate),
			_ => {}
		}
	}
}

/// A computed value upstream of every observer might have changed.
pub(crate) fn propagate_maybe_changed(observable: &dyn Observable) {
	let core = observable.core();
	if core.lowest_observer_state.get() != State::UpToDate {
		return;
	}
	core.lowest_observer_state.set(State::PossiblyStale);

	for derived in core.observers_snapshot() {
		let derivation = derived.derivation();
		if derivation.state.get() == State::UpToDate {
			derivation.state.set(State::PossiblyStale);
			derived.on_become_stale();
		}
	}
}

