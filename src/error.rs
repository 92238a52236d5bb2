use std::sync::Arc;

/// Everything that can go wrong while reading, writing or flushing the graph.
///
/// Errors are `Clone`: a failed computation keeps its error as the memoized
/// value and hands a copy to every reader until it recomputes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	/// A computed value read itself while it was being computed.
	#[error("cycle detected in computation {name}")]
	Cycle { name: String },

	/// Error produced by user code inside a computation or reaction.
	#[error("{0}")]
	User(Arc<anyhow::Error>),

	/// The run loop gave up after the configured number of passes.
	#[error(
		"reaction doesn't converge to a stable state after {iterations} iterations, probably there is a cycle in the reactive function: {name}"
	)]
	NonConvergent { name: String, iterations: u32 },

	#[error(
		"changing observed observable values outside a transaction is not allowed while transactions are enforced: {name}"
	)]
	OutsideTransaction { name: String },

	#[error("computed values are not allowed to cause side effects by changing observables: {name}")]
	SideEffectInComputed { name: String },

	#[error("the setter of computed value {name} is trying to update itself")]
	ReentrantSetter { name: String },

	#[error("cannot assign a new value to computed value {name}: it has no setter")]
	NoSetter { name: String },

	#[error("global state cannot be reset while a batch is in progress")]
	BatchInProgress,
}

impl Error {
	/// Wraps an arbitrary user error.
	pub fn user(err: impl Into<anyhow::Error>) -> Self {
		Error::User(Arc::new(err.into()))
	}

	pub fn is_cycle(&self) -> bool {
		matches!(self, Error::Cycle { .. })
	}

	/// Returns the inner user error if this is a `User` variant.
	pub fn user_error(&self) -> Option<&Arc<anyhow::Error>> {
		match self {
			Error::User(err) => Some(err),
			_ => None,
		}
	}

	/// Attempts to downcast the user error to a concrete type.
	pub fn downcast_ref<E>(&self) -> Option<&E>
	where
		E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
	{
		self.user_error().and_then(|err| err.downcast_ref::<E>())
	}
}

impl From<anyhow::Error> for Error {
	fn from(err: anyhow::Error) -> Self {
		Error::User(Arc::new(err))
	}
}
