use std::cell::RefCell;
use std::fmt::Debug;
use std::hash::Hash;
use std::rc::Rc;

use crate::atom::Atom;
use crate::spy::Disposer;
use crate::{comparer, globals, Computed, Error};

/// A single observable slot: an [`Atom`] plus the value it guards.
pub struct Var<T> {
	body: Rc<VarBody<T>>,
}

struct VarBody<T> {
	atom: Atom,
	value: RefCell<T>,
	equals: Box<dyn Fn(&T, &T) -> bool>,
}

impl<T> Clone for Var<T> {
	fn clone(&self) -> Self {
		Self {
			body: self.body.clone(),
		}
	}
}

impl<T> Default for Var<T>
where
	T: Default + PartialEq + 'static,
{
	fn default() -> Self {
		Var::new(Default::default())
	}
}

pub trait Toggle {
	fn toggle(&mut self);
}

impl Toggle for bool {
	fn toggle(&mut self) {
		*self = !*self
	}
}

impl<T> Var<T>
where
	T: 'static,
{
	pub fn new(value: T) -> Self
	where
		T: PartialEq,
	{
		Self::new_with_name(format!("Var@{}", globals::next_guid()), value)
	}

	pub fn new_with_name(name: impl Into<String>, value: T) -> Self
	where
		T: PartialEq,
	{
		Self::with_equals(name, value, comparer::default)
	}

	/// Uses `equals` to decide whether a write is a change.
	pub fn with_equals(
		name: impl Into<String>,
		value: T,
		equals: impl Fn(&T, &T) -> bool + 'static,
	) -> Self {
		Var {
			body: Rc::new(VarBody {
				atom: Atom::new(name),
				value: RefCell::new(value),
				equals: Box::new(equals),
			}),
		}
	}

	pub fn map<F, R>(&self, func: F) -> Computed<R>
	where
		F: Fn(&T) -> R + 'static,
		R: PartialEq + 'static,
	{
		let this = self.clone();
		Computed::new(move |_| this.with(&func))
	}

	/// Reads the value and subscribes the running derivation.
	#[inline]
	pub fn get(&self) -> T
	where
		T: Clone,
	{
		self.with(T::clone)
	}

	/// Borrows the value. Writing this var from `func` panics.
	pub fn with<R>(&self, func: impl FnOnce(&T) -> R) -> R {
		self.body.atom.report_observed();
		func(&self.body.value.borrow())
	}

	/// Reads the value without subscribing anything.
	#[inline]
	pub fn get_once(&self) -> T
	where
		T: Clone,
	{
		self.body.value.borrow().clone()
	}

	#[inline]
	pub fn set(&self, value: T) -> Result<(), Error> {
		self.replace(value).map(|_| ())
	}

	#[inline]
	pub fn toggle(&self) -> Result<(), Error>
	where
		T: Toggle + Clone,
	{
		self.update(T::toggle)
	}

	/// Stores `value` unless it equals the current one and returns whichever
	/// value is no longer stored.
	pub fn replace(&self, value: T) -> Result<T, Error> {
		let body = &self.body;
		body.atom.check_state_modification()?;

		if (body.equals)(&body.value.borrow(), &value) {
			return Ok(value);
		}

		let old = body.value.replace(value);
		body.atom.report_changed()?;
		Ok(old)
	}

	pub fn update(&self, func: impl FnOnce(&mut T)) -> Result<(), Error>
	where
		T: Clone,
	{
		let mut next = self.get_once();
		func(&mut next);
		self.replace(next).map(|_| ())
	}

	pub fn name(&self) -> &str {
		self.body.atom.name()
	}

	pub fn atom(&self) -> &Atom {
		&self.body.atom
	}

	pub fn observer_count(&self) -> usize {
		self.body.atom.observer_count()
	}

	pub fn observer_names(&self) -> Vec<String> {
		self.body.atom.observer_names()
	}

	pub fn on_become_observed(&self, func: impl Fn() + 'static) -> Disposer {
		self.body.atom.on_become_observed(func)
	}

	pub fn on_become_unobserved(&self, func: impl Fn() + 'static) -> Disposer {
		self.body.atom.on_become_unobserved(func)
	}
}

impl<T> Hash for Var<T>
where
	T: Hash,
{
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.body.value.borrow().hash(state);
	}
}

impl<T> Debug for Var<T>
where
	T: 'static + Debug,
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Var")
			.field("name", &self.name())
			.field("value", &*self.body.value.borrow())
			.finish()
	}
}
