//! The [dex file format][0], version 035
//!
//! [0]: https://source.android.com/docs/core/runtime/dex-format

mod binary_format;
mod encoded_value;
mod id_tables;
mod writer;

pub use binary_format::*;
pub use encoded_value::*;
pub use id_tables::*;
pub use writer::*;
