//! Assemble Dalvik executables
//!
//! ### Simple example
//!
//! Consider the following simple Java class:
//!
//! ```java,ignore,no_run
//! public class Point {
//!     public final int x;
//!     public final int y;
//!
//!     public Point(int x, int y) {
//!         this.x = x;
//!         this.y = y;
//!     }
//! }
//! ```
//!
//! Generating an analogous dex file can be done as follows:
//!
//! ```
//! use dexasm::dex::*;
//!
//! # fn generate_dex() -> Result<Vec<u8>, Error> {
//! let mut dex = DexBuilder::new(Settings::default());
//!
//! // Declare the class and all its members
//! let point = TypeId::class("me/alec/Point")?;
//! dex.declare_class(point.clone(), Some("Point.java"), ClassAccessFlags::PUBLIC, None, vec![])?;
//!
//! let field_flags = FieldAccessFlags::PUBLIC | FieldAccessFlags::FINAL;
//! let field_x = FieldId::new(point.clone(), "x", TypeId::INT)?;
//! let field_y = FieldId::new(point.clone(), "y", TypeId::INT)?;
//! dex.declare_field(field_x.clone(), field_flags, None)?;
//! dex.declare_field(field_y.clone(), field_flags, None)?;
//!
//! let object_init = MethodId::new(TypeId::OBJECT, "<init>", TypeId::VOID, vec![])?;
//! let constructor = MethodId::new(
//!     point.clone(),
//!     "<init>",
//!     TypeId::VOID,
//!     vec![TypeId::INT, TypeId::INT],
//! )?;
//!
//! // Generate the constructor method body
//! let mut code = dex.declare_method(constructor, MethodAccessFlags::PUBLIC)?;
//! let this = code.this_local()?;
//! let x = code.parameter(0)?;
//! let y = code.parameter(1)?;
//! code.invoke_direct(&object_init, None, this, &[])?;
//! code.instance_put(&field_x, this, x)?;
//! code.instance_put(&field_y, this, y)?;
//! code.return_void()?;
//! dex.define_code(code.result()?)?;
//!
//! // Serialize the dex file
//! let bytes = dex.generate()?;
//! assert_eq!(&bytes[0..8], b"dex\n035\0");
//! # Ok(bytes)
//! # }
//! # generate_dex().unwrap();
//! ```
//!
//! ### Locals, not registers
//!
//! Method bodies never name registers directly. [`CodeBuilder::new_local`] hands out typed
//! locals and [`CodeBuilder::new_label`] hands out labels; registers, branch offsets, and table
//! indices are all worked out when the body is finished and the file is generated. The builder
//! tracks the type of every local along every edge into a label, so a value of the wrong register
//! kind, or types that cannot be merged where paths join, are reported while the body is being
//! built. This is not full verification: any reference is accepted where another reference is
//! expected.

mod access_flags;
mod code;
mod descriptors;
mod dex_builder;
mod dex_file;
mod errors;
mod members;
mod model;
mod names;
mod settings;
pub mod verifier;

pub use access_flags::*;
pub use code::*;
pub use descriptors::*;
pub use dex_builder::*;
pub use dex_file::*;
pub use errors::*;
pub use members::*;
pub use model::*;
pub use names::*;
pub use settings::*;
