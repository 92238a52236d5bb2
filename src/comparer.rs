//! Equality functions deciding whether a new value counts as a change.

use std::hash::Hash;
use std::rc::Rc;

/// `PartialEq` equality.
pub fn default<T: PartialEq + ?Sized>(a: &T, b: &T) -> bool {
	a == b
}

/// Compares 64-bit fxhash digests, for values without `PartialEq` or with an
/// expensive one. Collisions count as "unchanged".
pub fn hashed<T: Hash + ?Sized>(a: &T, b: &T) -> bool {
	fxhash::hash64(a) == fxhash::hash64(b)
}

/// Same allocation.
pub fn identity<T: ?Sized>(a: &Rc<T>, b: &Rc<T>) -> bool {
	Rc::ptr_eq(a, b)
}

/// Every new value is a change.
pub fn never<T: ?Sized>(_: &T, _: &T) -> bool {
	false
}
