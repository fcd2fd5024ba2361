//! Method bodies
//!
//! A [`CodeBuilder`] collects instructions over typed [`Local`]s and [`Label`]s. Nothing about
//! the physical layout is decided while instructions are being added: registers are assigned once
//! the first instruction is emitted, and branch offsets only once the body is finished.

mod branch_resolver;
mod code;
mod code_builder;
mod instructions;
mod label;
mod locals;

pub use branch_resolver::*;
pub use code::*;
pub use code_builder::*;
pub use instructions::*;
pub use label::*;
pub use locals::*;
