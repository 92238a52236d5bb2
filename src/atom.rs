use std::cell::{Cell, RefCell};
use std::fmt::Debug;
use std::rc::{Rc, Weak};

use fxhash::FxBuildHasher;
use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::batch::{end_batch, start_batch};
use crate::globals;
use crate::propagation::{propagate_changed, queue_for_unobservation};
use crate::spy::{self, Disposer, SpyEvent};
use crate::{Derived, Error, Observable, State};

type Listeners = RefCell<SmallVec<[(u64, Rc<dyn Fn()>); 1]>>;

/// Observer bookkeeping shared by every observable node.
pub struct ObservableCore {
	name: String,
	pub(crate) this: Weak<dyn Observable>,
	/// Keyed by the address of the observing derivation.
	pub(crate) observers: RefCell<IndexMap<usize, Weak<dyn Derived>, FxBuildHasher>>,
	/// Lowest state among the observers; `Stale` means everyone already knows.
	pub(crate) lowest_observer_state: Cell<State>,
	/// Scratch marker for `bind_dependencies`, always 0 between passes.
	pub(crate) diff_value: Cell<u8>,
	pub(crate) last_accessed_by: Cell<u64>,
	pub(crate) is_being_observed: Cell<bool>,
	pub(crate) is_pending_unobservation: Cell<bool>,
	/// Batch in which the last change was counted in the state version.
	pub(crate) changed_in_batch: Cell<u64>,
	observed_listeners: Listeners,
	unobserved_listeners: Listeners,
}

impl ObservableCore {
	pub(crate) fn new(name: String, this: Weak<dyn Observable>) -> Self {
		ObservableCore {
			name,
			this,
			observers: RefCell::new(IndexMap::default()),
			lowest_observer_state: Cell::new(State::NotTracking),
			diff_value: Cell::new(0),
			last_accessed_by: Cell::new(0),
			is_being_observed: Cell::new(false),
			is_pending_unobservation: Cell::new(false),
			changed_in_batch: Cell::new(0),
			observed_listeners: RefCell::new(SmallVec::new()),
			unobserved_listeners: RefCell::new(SmallVec::new()),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn observer_count(&self) -> usize {
		self.observers.borrow().len()
	}

	pub fn has_observers(&self) -> bool {
		!self.observers.borrow().is_empty()
	}

	/// Names of the derivations currently observing this node.
	pub fn observer_names(&self) -> Vec<String> {
		self.observers
			.borrow()
			.values()
			.filter_map(Weak::upgrade)
			.map(|derived| derived.name().to_owned())
			.collect()
	}

	pub fn is_being_observed(&self) -> bool {
		self.is_being_observed.get()
	}

	pub fn lowest_observer_state(&self) -> State {
		self.lowest_observer_state.get()
	}

	pub(crate) fn observers_snapshot(&self) -> SmallVec<[Rc<dyn Derived>; 8]> {
		self.observers
			.borrow()
			.values()
			.filter_map(Weak::upgrade)
			.collect()
	}

	pub(crate) fn add_observed_listener(&self, func: Rc<dyn Fn()>) -> Disposer {
		Self::add_listener(&self.this, &self.observed_listeners, func, |core| {
			&core.observed_listeners
		})
	}

	pub(crate) fn add_unobserved_listener(&self, func: Rc<dyn Fn()>) -> Disposer {
		Self::add_listener(&self.this, &self.unobserved_listeners, func, |core| {
			&core.unobserved_listeners
		})
	}

	fn add_listener(
		this: &Weak<dyn Observable>,
		listeners: &Listeners,
		func: Rc<dyn Fn()>,
		select: fn(&ObservableCore) -> &Listeners,
	) -> Disposer {
		let id = globals::next_guid();
		listeners.borrow_mut().push((id, func));

		let this = this.clone();
		Disposer::new(move || {
			if let Some(observable) = this.upgrade() {
				select(observable.core())
					.borrow_mut()
					.retain(|(other, _)| *other != id);
			}
		})
	}

	pub(crate) fn fire_observed(&self) {
		Self::fire(&self.observed_listeners);
	}

	pub(crate) fn fire_unobserved(&self) {
		Self::fire(&self.unobserved_listeners);
	}

	fn fire(listeners: &Listeners) {
		let snapshot: SmallVec<[Rc<dyn Fn()>; 1]> =
			listeners.borrow().iter().map(|(_, f)| f.clone()).collect();
		for listener in snapshot {
			listener();
		}
	}
}

impl Debug for ObservableCore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ObservableCore")
			.field("name", &self.name)
			.field("observers", &self.observer_count())
			.field("lowest_observer_state", &self.lowest_observer_state.get())
			.finish()
	}
}

/// Registers `observable` with the running derivation, if there is one.
///
/// Returns whether a derivation was tracking. Untracked reads of unobserved
/// nodes inside a batch queue the node for the end-of-batch cleanup.
pub(crate) fn report_observed(observable: &dyn Observable) -> bool {
	let core = observable.core();
	match globals::tracking_derivation() {
		Some(derived) => {
			let derivation = derived.derivation();
			let run_id = derivation.run_id.get();
			if run_id != core.last_accessed_by.get() {
				core.last_accessed_by.set(run_id);
				if let Some(rc) = core.this.upgrade() {
					derivation.new_observing.borrow_mut().push(rc);
				}
				if !core.is_being_observed.get() && globals::with(|g| g.tracking_context.get()) {
					core.is_being_observed.set(true);
					observable.on_become_observed();
				}
			}
			true
		}
		None => {
			if !core.has_observers() && globals::with(|g| g.in_batch.get() > 0) {
				queue_for_unobservation(observable);
			}
			false
		}
	}
}

/// Fails when the current context does not allow writing `core`.
pub(crate) fn check_state_modification(core: &ObservableCore) -> Result<(), Error> {
	globals::with(|g| {
		if !g.allow_state_changes.get() && core.has_observers() {
			return Err(Error::SideEffectInComputed {
				name: core.name().to_owned(),
			});
		}

		if g.config.get().enforce_transactions
			&& g.in_batch.get() == 0
			&& g.tracking_derivation.borrow().is_none()
		{
			return Err(Error::OutsideTransaction {
				name: core.name().to_owned(),
			});
		}

		Ok(())
	})
}

/// Marks every observer of `observable` stale inside a one-shot batch.
pub(crate) fn report_changed(observable: &dyn Observable) -> Result<(), Error> {
	let core = observable.core();
	check_state_modification(core)?;

	start_batch();
	propagate_changed(observable);

	let batch_id = globals::with(|g| g.batch_id.get());
	if core.changed_in_batch.get() != batch_id {
		core.changed_in_batch.set(batch_id);
		globals::bump_state_version();
	}

	spy::emit(|| SpyEvent::Changed {
		name: core.name().to_owned(),
	});
	end_batch()
}

/// The minimal observable: no value, only change and observation signals.
///
/// Owners call [`Atom::report_observed`] on every read and
/// [`Atom::report_changed`] after every actual change of the data they guard.
#[derive(Clone)]
pub struct Atom {
	body: Rc<AtomBody>,
}

pub(crate) struct AtomBody {
	core: ObservableCore,
}

impl Observable for AtomBody {
	fn core(&self) -> &ObservableCore {
		&self.core
	}
}

impl Atom {
	pub fn new(name: impl Into<String>) -> Self {
		let name = name.into();
		Atom {
			body: Rc::new_cyclic(|this: &Weak<AtomBody>| AtomBody {
				core: ObservableCore::new(name, this.clone() as Weak<dyn Observable>),
			}),
		}
	}

	pub fn unnamed() -> Self {
		Self::new(format!("Atom@{}", globals::next_guid()))
	}

	pub fn name(&self) -> &str {
		self.body.core.name()
	}

	pub fn core(&self) -> &ObservableCore {
		&self.body.core
	}

	/// Returns whether a derivation was tracking this read.
	pub fn report_observed(&self) -> bool {
		report_observed(&*self.body)
	}

	pub fn report_changed(&self) -> Result<(), Error> {
		report_changed(&*self.body)
	}

	pub(crate) fn check_state_modification(&self) -> Result<(), Error> {
		check_state_modification(&self.body.core)
	}

	/// Fires when the first observer subscribes.
	pub fn on_become_observed(&self, func: impl Fn() + 'static) -> Disposer {
		self.body.core.add_observed_listener(Rc::new(func))
	}

	/// Fires at the end of the batch in which the last observer left.
	pub fn on_become_unobserved(&self, func: impl Fn() + 'static) -> Disposer {
		self.body.core.add_unobserved_listener(Rc::new(func))
	}

	pub fn is_being_observed(&self) -> bool {
		self.body.core.is_being_observed()
	}

	pub fn observer_count(&self) -> usize {
		self.body.core.observer_count()
	}

	pub fn observer_names(&self) -> Vec<String> {
		self.body.core.observer_names()
	}
}

impl Debug for Atom {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Atom").field("name", &self.name()).finish()
	}
}
