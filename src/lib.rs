//! Assembler for the Dalvik executable format
//!
//! The interesting bits live in [`dex`]: describe classes, fields, and method bodies over typed
//! locals and labels, then let [`dex::DexBuilder`] work out registers, branch offsets, and table
//! indices before writing out a `.dex` file.

pub mod dex;
pub mod util;
