pub use enclose::*;

/// Builds an infallible [`Computed`](crate::Computed), cloning the listed
/// captures into the closure.
///
/// ```ignore
/// let sum = computed!((a, b) cx => a.get() + b.get());
/// ```
#[macro_export]
macro_rules! computed {
    (( $($d_tt:tt)* ) $ctx:ident => $($b:tt)*) => {
        $crate::Computed::new($crate::macros::enclose!(($( $d_tt )*) move |$ctx: &$crate::Evaluation| { $($b)* }))
    };
    ($ctx:ident => $($b:tt)*) => {
        $crate::Computed::new(move |$ctx: &$crate::Evaluation| { $($b)* })
    };
}

/// Same as [`computed!`] for bodies returning `Result<T, Error>`.
#[macro_export]
macro_rules! try_computed {
    (( $($d_tt:tt)* ) $ctx:ident => $($b:tt)*) => {
        $crate::Computed::try_new($crate::macros::enclose!(($( $d_tt )*) move |$ctx: &$crate::Evaluation| { $($b)* }))
    };
    ($ctx:ident => $($b:tt)*) => {
        $crate::Computed::try_new(move |$ctx: &$crate::Evaluation| { $($b)* })
    };
}

/// Runs the body as an [`autorun`](crate::autorun). The body returns
/// `Result<(), Error>`.
#[macro_export]
macro_rules! autorun {
    (( $($d_tt:tt)* ) $ctx:ident => $($b:tt)*) => {
        $crate::autorun($crate::macros::enclose!(($( $d_tt )*) move |$ctx: &$crate::Evaluation| { $($b)* }))
    };
    ($ctx:ident => $($b:tt)*) => {
        $crate::autorun(move |$ctx: &$crate::Evaluation| { $($b)* })
    };
}
