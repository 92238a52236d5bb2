use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::batch::{end_batch, run_reactions, start_batch};
use crate::dependencies::{clear_observing, should_compute, track_derived_function, DerivationCore};
use crate::globals::{self, ReactionErrorHandler};
use crate::spy::{self, Disposer, SpyEvent};
use crate::{Derived, Error, Evaluation, State};

type Invalidate = Box<dyn Fn(&Reaction) -> Result<(), Error>>;

/// Owns a group of reactions so they can be disposed together.
#[derive(Default, Clone)]
pub struct Reactions<const N: usize> {
	vec: smallvec::SmallVec<[Reaction; N]>,
}

impl<const N: usize> Reactions<N> {
	pub fn add(&mut self, reaction: Reaction) {
		self.vec.push(reaction);

		#[cfg(debug_assertions)]
		if self.vec.len() > N {
			tracing::trace!(capacity = N, "reaction group spilled to the heap");
		}
	}

	pub fn len(&self) -> usize {
		self.vec.len()
	}

	pub fn is_empty(&self) -> bool {
		self.vec.is_empty()
	}

	pub fn schedule(&self) -> Result<(), Error> {
		for reaction in &self.vec {
			reaction.schedule()?;
		}
		Ok(())
	}

	pub fn dispose(&mut self) {
		for reaction in self.vec.drain(..) {
			reaction.dispose();
		}
	}
}

/// A derivation with side effects.
///
/// When any dependency changes the reaction is queued and its invalidation
/// callback runs once the outermost batch closes. Dropping the last handle
/// disposes it.
#[derive(Clone)]
pub struct Reaction {
	pub(crate) body: Rc<ReactionBody>,
}

pub(crate) struct ReactionBody {
	name: String,
	derivation: DerivationCore,
	on_invalidate: Invalidate,
	error_handler: RefCell<Option<ReactionErrorHandler>>,
	pub(crate) is_scheduled: Cell<bool>,
	is_disposed: Cell<bool>,
	is_running: Cell<bool>,
	is_track_pending: Cell<bool>,
	this: Weak<ReactionBody>,
}

impl Drop for ReactionBody {
	fn drop(&mut self) {
		if !globals::is_alive() || self.derivation.observing.borrow().is_empty() {
			return;
		}

		start_batch();
		clear_observing(&*self);
		if let Err(err) = end_batch() {
			tracing::error!(reaction = %self.name, error = %err, "failed to flush after dropping reaction");
		}
	}
}

impl Reaction {
	/// Creates a reaction that tracks `func`. It does not run until scheduled.
	#[must_use]
	pub fn new(func: impl Fn(&Evaluation) -> Result<(), Error> + 'static) -> Self {
		Self::new_with_name(format!("Reaction@{}", globals::next_guid()), func)
	}

	#[must_use]
	pub fn new_with_name(
		name: impl Into<String>,
		func: impl Fn(&Evaluation) -> Result<(), Error> + 'static,
	) -> Self {
		Self::with_invalidate(name, move |reaction| reaction.track(&func))
	}

	/// Creates a reaction with a custom invalidation callback, which is
	/// expected to call [`Reaction::track`] to (re)subscribe.
	#[must_use]
	pub fn with_invalidate(
		name: impl Into<String>,
		on_invalidate: impl Fn(&Reaction) -> Result<(), Error> + 'static,
	) -> Self {
		let name = name.into();
		let requires_observable = globals::config().reaction_requires_observable;
		Reaction {
			body: Rc::new_cyclic(|this: &Weak<ReactionBody>| ReactionBody {
				name,
				derivation: DerivationCore::new(
					this.clone() as Weak<dyn Derived>,
					requires_observable,
				),
				on_invalidate: Box::new(on_invalidate),
				error_handler: RefCell::new(None),
				is_scheduled: Cell::new(false),
				is_disposed: Cell::new(false),
				is_running: Cell::new(false),
				is_track_pending: Cell::new(false),
				this: this.clone(),
			}),
		}
	}

	pub fn name(&self) -> &str {
		&self.body.name
	}

	pub fn state(&self) -> State {
		self.body.derivation.state()
	}

	pub fn is_disposed(&self) -> bool {
		self.body.is_disposed.get()
	}

	pub fn is_scheduled(&self) -> bool {
		self.body.is_scheduled.get()
	}

	pub fn is_running(&self) -> bool {
		self.body.is_running.get()
	}

	/// Set between the invalidation callback starting and `track` finishing.
	pub fn is_track_pending(&self) -> bool {
		self.body.is_track_pending.get()
	}

	pub fn observing_names(&self) -> Vec<String> {
		self.body.derivation.observing_names()
	}

	pub fn derivation(&self) -> &DerivationCore {
		&self.body.derivation
	}

	/// Handles errors of this reaction instead of the global handlers.
	pub fn on_error(&self, handler: impl Fn(&Error, &Reaction) + 'static) {
		let handler: ReactionErrorHandler = Rc::new(handler);
		*self.body.error_handler.borrow_mut() = Some(handler);
	}

	/// Runs `func` and subscribes to everything it reads.
	///
	/// Errors returned by `func` go to the error handlers; the result only
	/// carries errors of the batch this call closes.
	pub fn track(&self, func: impl FnOnce(&Evaluation) -> Result<(), Error>) -> Result<(), Error> {
		let body = &self.body;
		if body.is_disposed.get() {
			return Ok(());
		}

		start_batch();
		body.is_running.set(true);
		let prev_context = globals::set_tracking_context(true);

		let derived: Rc<dyn Derived> = body.clone();
		let result = track_derived_function(&derived, func);

		globals::set_tracking_context(prev_context);
		body.is_running.set(false);
		body.is_track_pending.set(false);

		if body.is_disposed.get() {
			clear_observing(&**body);
		}

		spy::emit(|| SpyEvent::Reaction {
			name: body.name.clone(),
		});

		if let Err(err) = result {
			body.report_exception(err, self);
		}

		end_batch()
	}

	/// Queues the reaction and runs the queue unless a batch is open.
	pub fn schedule(&self) -> Result<(), Error> {
		self.body.schedule()
	}

	pub fn dispose(&self) {
		self.body.dispose_body();
	}
}

impl ReactionBody {
	fn schedule(&self) -> Result<(), Error> {
		if self.is_scheduled.get() {
			return Ok(());
		}

		self.is_scheduled.set(true);
		globals::with(|g| g.pending_reactions.borrow_mut().push(self.this.clone()));
		spy::emit(|| SpyEvent::Scheduled {
			name: self.name.clone(),
		});
		run_reactions()
	}

	pub(crate) fn run_reaction(self: &Rc<Self>) {
		if self.is_disposed.get() {
			return;
		}

		start_batch();
		self.is_scheduled.set(false);
		let prev_context = globals::set_tracking_context(true);

		if should_compute(&**self) {
			self.is_track_pending.set(true);
			let handle = Reaction { body: self.clone() };
			if let Err(err) = (self.on_invalidate)(&handle) {
				self.report_exception(err, &handle);
			}
		}

		globals::set_tracking_context(prev_context);
		if let Err(err) = end_batch() {
			self.report_exception(err, &Reaction { body: self.clone() });
		}
	}

	fn report_exception(&self, err: Error, reaction: &Reaction) {
		let handler = self.error_handler.borrow().clone();
		if let Some(handler) = handler {
			handler(&err, reaction);
			return;
		}

		if !globals::config().suppress_reaction_errors {
			tracing::error!(reaction = %self.name, error = %err, "uncaught error thrown by a reaction");
		}

		spy::emit(|| SpyEvent::Error {
			name: self.name.clone(),
			error: err.clone(),
		});

		let handlers: Vec<ReactionErrorHandler> = globals::with(|g| {
			g.reaction_error_handlers
				.borrow()
				.iter()
				.map(|(_, handler)| handler.clone())
				.collect()
		});
		for handler in handlers {
			handler(&err, reaction);
		}
	}

	fn dispose_body(&self) {
		if self.is_disposed.replace(true) {
			return;
		}

		// A running reaction detaches itself when `track` returns.
		if !self.is_running.get() {
			start_batch();
			clear_observing(self);
			if let Err(err) = end_batch() {
				tracing::error!(reaction = %self.name, error = %err, "failed to flush after disposing reaction");
			}
		}
	}
}

impl Derived for ReactionBody {
	fn derivation(&self) -> &DerivationCore {
		&self.derivation
	}

	fn on_become_stale(&self) {
		if let Err(err) = self.schedule() {
			tracing::error!(reaction = %self.name, error = %err, "failed to schedule reaction");
		}
	}

	fn name(&self) -> &str {
		&self.name
	}

	fn dispose(&self) {
		self.dispose_body();
	}
}

/// Creates a reaction around `func` and runs it right away.
pub fn autorun(func: impl Fn(&Evaluation) -> Result<(), Error> + 'static) -> Result<Reaction, Error> {
	let reaction = Reaction::new_with_name(format!("Autorun@{}", globals::next_guid()), func);
	reaction.schedule()?;
	Ok(reaction)
}

/// Registers a fallback for reaction errors without their own handler.
pub fn on_reaction_error(handler: impl Fn(&Error, &Reaction) + 'static) -> Disposer {
	let id = globals::next_guid();
	globals::with(|g| {
		g.reaction_error_handlers
			.borrow_mut()
			.push((id, Rc::new(handler)))
	});

	Disposer::new(move || {
		if globals::is_alive() {
			globals::with(|g| {
				g.reaction_error_handlers
					.borrow_mut()
					.retain(|(other, _)| *other != id)
			});
		}
	})
}

impl std::fmt::Debug for Reaction {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Reaction")
			.field("name", &self.body.name)
			.field("state", &self.state())
			.field("disposed", &self.is_disposed())
			.finish()
	}
}
