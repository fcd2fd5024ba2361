//! Just enough of a verifier to keep generated code acceptable
//!
//! Dalvik registers are untyped, but the on-device verifier infers a type for every register at
//! every instruction, merging the types that flow into a branch target. We track the same thing
//! for every local while the method body is being built, so that a local which holds an `int` on
//! one edge and a `float` on another gets reported while the offending label is still known.
//!
//! This is intentionally much coarser than the real verifier: references never get an ancestor
//! search (two different classes merge to `java.lang.Object`) and no fixpoint is computed for
//! backward branches.

mod frame;
mod types;

pub use frame::*;
pub use types::*;
