//! What gets declared in a unit, before anything is laid out

mod annotation;
mod class;
mod value;

pub use annotation::*;
pub use class::*;
pub use value::*;
