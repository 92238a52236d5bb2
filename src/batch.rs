use crate::dependencies::settle;
use crate::globals;
use crate::spy::{self, SpyEvent};
use crate::{Derived, Error};

pub fn in_batch() -> bool {
	globals::with(|g| g.in_batch.get() > 0)
}

/// Runs `func` as one transaction: reactions run and unobserved nodes are
/// cleaned up only when the outermost batch closes.
pub fn batch<R>(func: impl FnOnce() -> Result<R, Error>) -> Result<R, Error> {
	start_batch();
	let result = func();
	let flushed = end_batch();
	let value = result?;
	flushed?;
	Ok(value)
}

/// An untracked batch in which state changes are allowed.
pub fn action<R>(func: impl FnOnce() -> Result<R, Error>) -> Result<R, Error> {
	let prev_tracking = globals::untracked_start();
	let prev_allow = globals::allow_state_changes_start(true);
	let result = batch(func);
	globals::allow_state_changes_end(prev_allow);
	globals::untracked_end(prev_tracking);
	result
}

pub(crate) fn start_batch() {
	globals::with(|g| {
		let depth = g.in_batch.get();
		if depth == 0 {
			g.batch_id.set(g.batch_id.get() + 1);
		}
		g.in_batch.set(depth + 1);
	});
}

/// Closes one batch level. The outermost close drains the reaction queue,
/// then fires unobserved hooks and suspends computed values nobody observes.
pub(crate) fn end_batch() -> Result<(), Error> {
	let depth = globals::with(|g| {
		let depth = g.in_batch.get().saturating_sub(1);
		g.in_batch.set(depth);
		depth
	});

	if depth != 0 {
		return Ok(());
	}

	let result = run_reactions();

	loop {
		let pending = globals::with(|g| std::mem::take(&mut *g.pending_unobservations.borrow_mut()));
		if pending.is_empty() {
			break;
		}

		// Suspending a computed value may empty the nodes it depended on,
		// those land in the fresh queue and are handled by the next pass.
		for observable in pending {
			let core = observable.core();
			core.is_pending_unobservation.set(false);
			if !core.has_observers() {
				if core.is_being_observed.get() {
					core.is_being_observed.set(false);
					observable.on_become_unobserved();
				}
				observable.suspend();
			}
		}
	}

	result
}

pub(crate) fn run_reactions() -> Result<(), Error> {
	let blocked = globals::with(|g| g.in_batch.get() > 0 || g.is_running_reactions.get());
	if blocked {
		return Ok(());
	}

	globals::with(|g| g.is_running_reactions.set(true));
	let result = batch_run();
	globals::with(|g| g.is_running_reactions.set(false));
	result
}

/// Drains the reaction queue until it stays empty or the pass limit is hit.
fn batch_run() -> Result<(), Error> {
	let max_iterations = globals::config().max_reaction_iterations;
	let mut iterations = 0;

	loop {
		let changed = globals::with(|g| std::mem::take(&mut *g.pending_reactions.borrow_mut()));
		if changed.is_empty() {
			break;
		}

		iterations += 1;
		if iterations >= max_iterations {
			let name = changed
				.iter()
				.find_map(|reaction| reaction.upgrade())
				.map(|reaction| reaction.name().to_owned())
				.unwrap_or_default();

			tracing::error!(
				reaction = %name,
				iterations,
				"reaction doesn't converge to a stable state, probably there is a cycle in the reactive function"
			);

			// Drop the queued work but leave the reactions able to be scheduled again.
			for reaction in changed.iter().filter_map(|reaction| reaction.upgrade()) {
				reaction.is_scheduled.set(false);
				start_batch();
				settle(&*reaction);
				if let Err(err) = end_batch() {
					tracing::error!(reaction = %reaction.name(), error = %err, "failed to flush after dropping queued reaction");
				}
			}

			spy::emit(|| SpyEvent::NonConvergent {
				name: name.clone(),
				iterations,
			});
			return Err(Error::NonConvergent { name, iterations });
		}

		for reaction in changed {
			if let Some(reaction) = reaction.upgrade() {
				reaction.run_reaction();
			}
		}
	}

	Ok(())
}
