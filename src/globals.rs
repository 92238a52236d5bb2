use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::reaction::{Reaction, ReactionBody};
use crate::spy::SpyEvent;
use crate::{Derived, Error, Observable};

pub(crate) type ReactionErrorHandler = Rc<dyn Fn(&Error, &Reaction)>;
pub(crate) type SpyListener = Rc<dyn Fn(&SpyEvent)>;

/// Engine settings. Every thread owns its own copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
	/// Writes outside a batch fail with [`Error::OutsideTransaction`].
	pub enforce_transactions: bool,
	/// Number of run loop passes before a flush is abandoned.
	pub max_reaction_iterations: u32,
	/// Warn when a computed value is read outside of any reactive context.
	pub computed_requires_reaction: bool,
	/// Warn when a derivation finishes without observing anything.
	pub reaction_requires_observable: bool,
	/// Do not log reaction errors nobody handled.
	pub suppress_reaction_errors: bool,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			enforce_transactions: false,
			max_reaction_iterations: 100,
			computed_requires_reaction: false,
			reaction_requires_observable: false,
			suppress_reaction_errors: false,
		}
	}
}

pub(crate) struct Globals {
	/// Derivation currently collecting dependencies.
	pub tracking_derivation: RefCell<Option<Rc<dyn Derived>>>,
	/// Set while a reaction (or a keep-alive computed) runs.
	pub tracking_context: Cell<bool>,
	pub allow_state_changes: Cell<bool>,
	pub in_batch: Cell<u32>,
	/// Incremented every time an outermost batch opens.
	pub batch_id: Cell<u64>,
	pub run_id: Cell<u64>,
	pub guid: Cell<u64>,
	pub state_version: Cell<i64>,
	pub is_running_reactions: Cell<bool>,
	pub pending_unobservations: RefCell<Vec<Rc<dyn Observable>>>,
	pub pending_reactions: RefCell<Vec<Weak<ReactionBody>>>,
	pub reaction_error_handlers: RefCell<Vec<(u64, ReactionErrorHandler)>>,
	pub spy_listeners: RefCell<Vec<(u64, SpyListener)>>,
	pub config: Cell<Config>,
}

impl Default for Globals {
	fn default() -> Self {
		Globals {
			tracking_derivation: RefCell::new(None),
			tracking_context: Cell::new(false),
			allow_state_changes: Cell::new(true),
			in_batch: Cell::new(0),
			batch_id: Cell::new(0),
			run_id: Cell::new(0),
			guid: Cell::new(0),
			state_version: Cell::new(0),
			is_running_reactions: Cell::new(false),
			pending_unobservations: RefCell::new(Vec::new()),
			pending_reactions: RefCell::new(Vec::new()),
			reaction_error_handlers: RefCell::new(Vec::new()),
			spy_listeners: RefCell::new(Vec::new()),
			config: Cell::new(Config::default()),
		}
	}
}

thread_local! {
	static GLOBALS: Globals = Globals::default();
}

pub(crate) fn with<R>(func: impl FnOnce(&Globals) -> R) -> R {
	GLOBALS.with(func)
}

/// False once the thread-local engine has been torn down.
pub(crate) fn is_alive() -> bool {
	GLOBALS.try_with(|_| ()).is_ok()
}

pub(crate) fn next_guid() -> u64 {
	with(|g| {
		let id = g.guid.get() + 1;
		g.guid.set(id);
		id
	})
}

pub(crate) fn next_run_id() -> u64 {
	with(|g| {
		let id = g.run_id.get() + 1;
		g.run_id.set(id);
		id
	})
}

pub(crate) fn tracking_derivation() -> Option<Rc<dyn Derived>> {
	with(|g| g.tracking_derivation.borrow().clone())
}

pub(crate) fn set_tracking_derivation(
	derivation: Option<Rc<dyn Derived>>,
) -> Option<Rc<dyn Derived>> {
	with(|g| g.tracking_derivation.replace(derivation))
}

pub(crate) fn untracked_start() -> Option<Rc<dyn Derived>> {
	set_tracking_derivation(None)
}

pub(crate) fn untracked_end(prev: Option<Rc<dyn Derived>>) {
	set_tracking_derivation(prev);
}

pub(crate) fn set_tracking_context(active: bool) -> bool {
	with(|g| g.tracking_context.replace(active))
}

pub(crate) fn allow_state_changes_start(allow: bool) -> bool {
	with(|g| g.allow_state_changes.replace(allow))
}

pub(crate) fn allow_state_changes_end(prev: bool) {
	with(|g| g.allow_state_changes.set(prev));
}

/// Wrapping increment of the global "something changed" fence.
pub(crate) fn bump_state_version() {
	with(|g| g.state_version.set(g.state_version.get().wrapping_add(1)));
}

/// Runs `func` without subscribing the current derivation to anything it reads.
pub fn untracked<R>(func: impl FnOnce() -> R) -> R {
	let prev = untracked_start();
	let result = func();
	untracked_end(prev);
	result
}

/// Runs `func` with state changes explicitly allowed or forbidden.
pub fn allow_state_changes<R>(allow: bool, func: impl FnOnce() -> R) -> R {
	let prev = allow_state_changes_start(allow);
	let result = func();
	allow_state_changes_end(prev);
	result
}

/// Whether some derivation is collecting dependencies right now.
pub fn is_computing_derivation() -> bool {
	with(|g| g.tracking_derivation.borrow().is_some())
}

/// Monotonic counter bumped by every reported change. Wraps at `i64::MAX`.
pub fn state_version() -> i64 {
	with(|g| g.state_version.get())
}

pub fn config() -> Config {
	with(|g| g.config.get())
}

pub fn configure(func: impl FnOnce(&mut Config)) {
	with(|g| {
		let mut config = g.config.get();
		func(&mut config);
		g.config.set(config);
	});
}

/// Restores the default engine state of the current thread.
///
/// Queued nodes and listeners are dropped after the state is reset, so their
/// destructors see a clean engine.
pub fn reset_globals() -> Result<(), Error> {
	let dropped = with(|g| {
		if g.in_batch.get() > 0 || g.is_running_reactions.get() {
			return Err(Error::BatchInProgress);
		}

		let unobservations = g.pending_unobservations.take();
		for observable in &unobservations {
			observable.core().is_pending_unobservation.set(false);
		}

		let reactions = g.pending_reactions.take();
		for reaction in reactions.iter().filter_map(Weak::upgrade) {
			reaction.is_scheduled.set(false);
		}

		g.tracking_context.set(false);
		g.allow_state_changes.set(true);
		g.config.set(Config::default());
		g.state_version.set(0);

		Ok((
			g.tracking_derivation.take(),
			unobservations,
			g.reaction_error_handlers.take(),
			g.spy_listeners.take(),
		))
	})?;

	drop(dropped);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn state_version_wraps_to_min() {
		with(|g| g.state_version.set(i64::MAX - 1));
		bump_state_version();
		assert_eq!(state_version(), i64::MAX);
		bump_state_version();
		assert_eq!(state_version(), i64::MIN);
		bump_state_version();
		assert_eq!(state_version(), i64::MIN + 1);
	}

	#[test]
	fn configure_is_per_thread() {
		configure(|c| c.max_reaction_iterations = 7);
		assert_eq!(config().max_reaction_iterations, 7);

		let other = std::thread::spawn(|| config().max_reaction_iterations)
			.join()
			.unwrap();
		assert_eq!(other, 100);

		reset_globals().unwrap();
		assert_eq!(config(), Config::default());
	}
}
