//! Transparent dependency tracking.
//!
//! Mutable state lives in [`Atom`]s (usually wrapped by [`Var`]), derived
//! values are [`Computed`] and side effects are [`Reaction`]s. Reading an
//! observable while a derivation runs subscribes that derivation to it;
//! writing it marks the subscribers stale. Computed values recompute lazily,
//! reactions are re-run when the outermost [`batch`] closes.

pub mod comparer;
pub mod macros;

mod atom;
mod batch;
mod computed;
mod dependencies;
mod error;
mod evaluation;
mod globals;
mod propagation;
mod reaction;
mod spy;
mod var;

use std::rc::{Rc, Weak};

pub use atom::{Atom, ObservableCore};
pub use batch::{action, batch, in_batch};
pub use computed::{Computed, ComputedOptions};
pub use dependencies::DerivationCore;
pub use error::Error;
pub use evaluation::Evaluation;
pub use globals::{
	allow_state_changes, config, configure, is_computing_derivation, reset_globals,
	state_version, untracked, Config,
};
pub use reaction::{autorun, on_reaction_error, Reaction, Reactions};
pub use spy::{spy, Disposer, SpyEvent};
pub use var::{Toggle, Var};

/// A node other derivations can depend on.
pub trait Observable: 'static {
	fn core(&self) -> &ObservableCore;

	/// Staleness of this node when it is itself a derivation.
	fn derivation_state(&self) -> Option<State> {
		None
	}

	/// Bring a derived node up to date. Plain atoms return `None`.
	fn refresh(self: Rc<Self>) -> Option<Result<(), Error>> {
		None
	}

	/// Called at the end of a batch once the last observer left.
	fn suspend(&self) {}

	fn on_become_observed(&self) {
		self.core().fire_observed();
	}

	fn on_become_unobserved(&self) {
		self.core().fire_unobserved();
	}
}

/// A node that runs a tracked function and depends on observables.
pub trait Derived: 'static {
	fn derivation(&self) -> &DerivationCore;

	/// Called when the node goes from up to date to (possibly) stale.
	fn on_become_stale(&self);

	fn name(&self) -> &str;

	/// Computations forbid state changes while they evaluate.
	fn is_computation(&self) -> bool {
		false
	}

	fn dispose(&self) {}
}

/// Staleness of a derivation, ordered from "nothing to do" to "must rerun".
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub enum State {
	/// Never ran, or was suspended: there is no observed set.
	NotTracking = -1,
	UpToDate = 0,
	/// A computed value somewhere upstream might have changed.
	PossiblyStale = 1,
	/// A direct dependency changed.
	Stale = 2,
}

/// Address of a node, used as its identity in observer sets.
pub(crate) fn addr_of<T: ?Sized>(weak: &Weak<T>) -> usize {
	weak.as_ptr() as *const () as usize
}
