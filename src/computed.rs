use std::cell::{Cell, RefCell};
use std::fmt::Debug;
use std::rc::{Rc, Weak};

use crate::atom::{report_observed, ObservableCore};
use crate::batch::{action, end_batch, start_batch};
use crate::comparer;
use crate::dependencies::{clear_observing, should_compute, track_derived_function, DerivationCore};
use crate::globals;
use crate::propagation::{propagate_change_confirmed, propagate_maybe_changed};
use crate::spy::{self, Disposer, SpyEvent};
use crate::{Derived, Error, Evaluation, Observable, State};

type Func<T> = Box<dyn Fn(&Evaluation) -> Result<T, Error>>;
type Equals<T> = Box<dyn Fn(&T, &T) -> bool>;
type Setter<T> = Box<dyn Fn(T) -> Result<(), Error>>;

/// Construction options of a [`Computed`].
pub struct ComputedOptions<T> {
	pub name: Option<String>,
	pub equals: Equals<T>,
	/// Never suspend, even without observers.
	pub keep_alive: bool,
	/// Warn when read outside of a reactive context.
	pub requires_reaction: bool,
	pub setter: Option<Setter<T>>,
}

impl<T> Default for ComputedOptions<T>
where
	T: PartialEq + 'static,
{
	fn default() -> Self {
		Self::with_equals(comparer::default)
	}
}

impl<T: 'static> ComputedOptions<T> {
	pub fn with_equals(equals: impl Fn(&T, &T) -> bool + 'static) -> Self {
		ComputedOptions {
			name: None,
			equals: Box::new(equals),
			keep_alive: false,
			requires_reaction: false,
			setter: None,
		}
	}

	pub fn name(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());
		self
	}

	pub fn equals(mut self, equals: impl Fn(&T, &T) -> bool + 'static) -> Self {
		self.equals = Box::new(equals);
		self
	}

	pub fn keep_alive(mut self, keep_alive: bool) -> Self {
		self.keep_alive = keep_alive;
		self
	}

	pub fn requires_reaction(mut self, requires_reaction: bool) -> Self {
		self.requires_reaction = requires_reaction;
		self
	}

	pub fn setter(mut self, setter: impl Fn(T) -> Result<(), Error> + 'static) -> Self {
		self.setter = Some(Box::new(setter));
		self
	}
}

/// A memoized derived value.
///
/// The function runs lazily on read. While something observes the value (or
/// inside a batch) the result is cached until a dependency changes; without
/// observers the value is suspended and every read recomputes.
pub struct Computed<T: 'static> {
	body: Rc<ComputedBody<T>>,
}

impl<T: 'static> Clone for Computed<T> {
	fn clone(&self) -> Self {
		Self {
			body: self.body.clone(),
		}
	}
}

struct ComputedBody<T: 'static> {
	observable: ObservableCore,
	derivation: DerivationCore,
	func: Func<T>,
	equals: Equals<T>,
	setter: Option<Setter<T>>,
	/// `None` until computed, and again after suspension.
	value: RefCell<Option<Result<T, Error>>>,
	keep_alive: bool,
	requires_reaction: bool,
	is_computing: Cell<bool>,
	is_running_setter: Cell<bool>,
}

impl<T: 'static> Drop for ComputedBody<T> {
	fn drop(&mut self) {
		if !globals::is_alive() || self.derivation.observing.borrow().is_empty() {
			return;
		}

		start_batch();
		clear_observing(&*self);
		if let Err(err) = end_batch() {
			tracing::error!(computed = %self.observable.name(), error = %err, "failed to flush after dropping computed value");
		}
	}
}

impl<T: 'static> Computed<T> {
	pub fn new(func: impl Fn(&Evaluation) -> T + 'static) -> Self
	where
		T: PartialEq,
	{
		Self::try_new(move |cx| Ok(func(cx)))
	}

	/// Creates a computed value whose function may fail.
	pub fn try_new(func: impl Fn(&Evaluation) -> Result<T, Error> + 'static) -> Self
	where
		T: PartialEq,
	{
		Self::with_options(func, ComputedOptions::default())
	}

	pub fn with_options(
		func: impl Fn(&Evaluation) -> Result<T, Error> + 'static,
		options: ComputedOptions<T>,
	) -> Self {
		let name = options
			.name
			.unwrap_or_else(|| format!("Computed@{}", globals::next_guid()));
		let requires_observable = globals::config().reaction_requires_observable;

		Computed {
			body: Rc::new_cyclic(|this: &Weak<ComputedBody<T>>| ComputedBody {
				observable: ObservableCore::new(name, this.clone() as Weak<dyn Observable>),
				derivation: DerivationCore::new(this.clone() as Weak<dyn Derived>, requires_observable),
				func: Box::new(func),
				equals: options.equals,
				setter: options.setter,
				value: RefCell::new(None),
				keep_alive: options.keep_alive,
				requires_reaction: options.requires_reaction,
				is_computing: Cell::new(false),
				is_running_setter: Cell::new(false),
			}),
		}
	}

	/// Returns the current value, recomputing it when stale.
	///
	/// A failed computation returns its error to every reader until the
	/// value is recomputed.
	pub fn get(&self) -> Result<T, Error>
	where
		T: Clone,
	{
		self.body.read()?;
		self.body.memo(T::clone)
	}

	/// Reads the value without subscribing the running derivation.
	pub fn get_once(&self) -> Result<T, Error>
	where
		T: Clone,
	{
		globals::untracked(|| self.get())
	}

	/// Assigns through the setter given at construction, inside an action.
	pub fn set(&self, value: T) -> Result<(), Error> {
		let body = &self.body;
		let setter = match &body.setter {
			Some(setter) => setter,
			None => {
				return Err(Error::NoSetter {
					name: self.name().to_owned(),
				})
			}
		};

		if body.is_running_setter.replace(true) {
			return Err(Error::ReentrantSetter {
				name: self.name().to_owned(),
			});
		}

		let result = action(|| setter(value));
		body.is_running_setter.set(false);
		result
	}

	pub fn name(&self) -> &str {
		self.body.observable.name()
	}

	pub fn state(&self) -> State {
		self.body.derivation.state()
	}

	pub fn is_keep_alive(&self) -> bool {
		self.body.keep_alive
	}

	pub fn is_computing(&self) -> bool {
		self.body.is_computing.get()
	}

	/// Whether a value (or error) is memoized right now.
	pub fn has_cached_value(&self) -> bool {
		self.body.value.borrow().is_some()
	}

	pub fn core(&self) -> &ObservableCore {
		&self.body.observable
	}

	pub fn derivation(&self) -> &DerivationCore {
		&self.body.derivation
	}

	pub fn observing_names(&self) -> Vec<String> {
		self.body.derivation.observing_names()
	}

	pub fn observer_names(&self) -> Vec<String> {
		self.body.observable.observer_names()
	}

	pub fn observer_count(&self) -> usize {
		self.body.observable.observer_count()
	}

	pub fn on_become_observed(&self, func: impl Fn() + 'static) -> Disposer {
		self.body.observable.add_observed_listener(Rc::new(func))
	}

	pub fn on_become_unobserved(&self, func: impl Fn() + 'static) -> Disposer {
		self.body.observable.add_unobserved_listener(Rc::new(func))
	}
}

impl<T: 'static> ComputedBody<T> {
	fn name(&self) -> &str {
		self.observable.name()
	}

	/// Brings the memoized value up to date and registers the read.
	/// Reading a value that is being computed is a cycle.
	fn read(self: &Rc<Self>) -> Result<(), Error> {
		if self.is_computing.get() {
			return Err(Error::Cycle {
				name: self.name().to_owned(),
			});
		}

		let cold = globals::with(|g| g.in_batch.get() == 0)
			&& !self.observable.has_observers()
			&& !self.keep_alive;

		if cold {
			// Nobody will tell us about changes, so nothing is memoized.
			if should_compute(&**self) {
				self.warn_about_untracked_read();
				start_batch();
				let value = self.compute_value(false);
				*self.value.borrow_mut() = Some(value);
				end_batch()?;
			}
		} else {
			report_observed(&**self);
			if should_compute(&**self) {
				let prev_context = (self.keep_alive
					&& !globals::with(|g| g.tracking_context.get()))
				.then(|| globals::set_tracking_context(true));

				if self.track_and_compute() {
					propagate_change_confirmed(&**self);
				}

				if let Some(prev) = prev_context {
					globals::set_tracking_context(prev);
				}
			}
		}

		Ok(())
	}

	/// Hands the memoized value (or its error) to `extract`. An empty slot is
	/// filled by an untracked computation first.
	fn memo<R>(self: &Rc<Self>, extract: impl FnOnce(&T) -> R) -> Result<R, Error> {
		let value = match self.value.take() {
			Some(value) => value,
			None => self.compute_value(false),
		};

		let result = match &value {
			Ok(value) => Ok(extract(value)),
			Err(err) => Err(err.clone()),
		};
		*self.value.borrow_mut() = Some(value);
		result
	}

	/// Recomputes with tracking; returns whether the observable value changed.
	fn track_and_compute(self: &Rc<Self>) -> bool {
		let was_suspended = self.derivation.state.get() == State::NotTracking;
		let new_value = self.compute_value(true);

		let changed = {
			let old_value = self.value.borrow();
			was_suspended
				|| match (old_value.as_ref(), &new_value) {
					(Some(Ok(old)), Ok(new)) => !(self.equals)(old, new),
					_ => true,
				}
		};

		if changed {
			*self.value.borrow_mut() = Some(new_value);
		}
		changed
	}

	fn compute_value(self: &Rc<Self>, track: bool) -> Result<T, Error> {
		self.is_computing.set(true);
		let prev_allow = globals::allow_state_changes_start(false);

		let derived: Rc<dyn Derived> = self.clone();
		let result = if track {
			track_derived_function(&derived, |cx| (self.func)(cx))
		} else {
			(self.func)(&Evaluation::new(derived))
		};

		globals::allow_state_changes_end(prev_allow);
		self.is_computing.set(false);

		tracing::trace!(computed = %self.name(), track, "recomputed");
		spy::emit(|| SpyEvent::Recompute {
			name: self.name().to_owned(),
		});
		result
	}

	fn warn_about_untracked_read(&self) {
		if self.requires_reaction || globals::config().computed_requires_reaction {
			tracing::warn!(
				computed = %self.name(),
				"computed value is being read outside a reactive context, doing a full recompute"
			);
		}
	}
}

impl<T: 'static> Observable for ComputedBody<T> {
	fn core(&self) -> &ObservableCore {
		&self.observable
	}

	fn derivation_state(&self) -> Option<State> {
		Some(self.derivation.state.get())
	}

	fn refresh(self: Rc<Self>) -> Option<Result<(), Error>> {
		Some(self.read().and_then(|_| self.memo(|_| ())))
	}

	fn suspend(&self) {
		if self.keep_alive {
			return;
		}

		clear_observing(self);
		*self.value.borrow_mut() = None;

		tracing::debug!(computed = %self.name(), "suspended");
		spy::emit(|| SpyEvent::Suspended {
			name: self.name().to_owned(),
		});
	}
}

impl<T: 'static> Derived for ComputedBody<T> {
	fn derivation(&self) -> &DerivationCore {
		&self.derivation
	}

	fn on_become_stale(&self) {
		propagate_maybe_changed(self);
	}

	fn name(&self) -> &str {
		self.observable.name()
	}

	fn is_computation(&self) -> bool {
		true
	}
}

impl<T: 'static> Debug for Computed<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Computed")
			.field("name", &self.name())
			.field("state", &self.state())
			.field("keep_alive", &self.body.keep_alive)
			.finish()
	}
}
