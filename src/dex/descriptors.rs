use super::{BinaryName, Error, Name};
use crate::util::Width;
use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
use std::io::{Error as IoError, ErrorKind, Result};
use std::iter::Peekable;
use std::str::Chars;

/// Utility trait for converting descriptors to and from string representations
pub trait RenderDescriptor {
    /// Turn the descriptor into a string
    fn render(&self) -> String {
        let mut string = String::new();
        self.render_to(&mut string);
        string
    }

    /// Write the descriptor to a string
    fn render_to(&self, write_to: &mut String);
}

pub trait ParseDescriptor: Sized {
    /// Parse a descriptor from a string
    fn parse(source: &str) -> Result<Self> {
        let mut chars = source.chars().peekable();
        let ret = Self::parse_from(&mut chars)?;
        match chars.next() {
            None => Ok(ret),
            Some(c) => {
                let msg = format!("Unexpected leftover input '{}'", c);
                Err(IoError::new(ErrorKind::InvalidInput, msg))
            }
        }
    }

    /// Read the descriptor from a character buffer
    fn parse_from(source: &mut Peekable<Chars>) -> Result<Self>;
}

/// Primitive value types
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BaseType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
}

impl BaseType {
    /// Types that share the `int` representation in registers
    pub fn is_int_like(self) -> bool {
        matches!(
            self,
            BaseType::Boolean | BaseType::Byte | BaseType::Char | BaseType::Short | BaseType::Int
        )
    }

    fn descriptor_char(self) -> char {
        match self {
            BaseType::Boolean => 'Z',
            BaseType::Byte => 'B',
            BaseType::Char => 'C',
            BaseType::Short => 'S',
            BaseType::Int => 'I',
            BaseType::Long => 'J',
            BaseType::Float => 'F',
            BaseType::Double => 'D',
        }
    }
}

impl Width for BaseType {
    fn width(&self) -> usize {
        match self {
            BaseType::Long | BaseType::Double => 2,
            _ => 1,
        }
    }
}

impl RenderDescriptor for BaseType {
    fn render_to(&self, write_to: &mut String) {
        write_to.push(self.descriptor_char());
    }
}

impl ParseDescriptor for BaseType {
    fn parse_from(source: &mut Peekable<Chars>) -> Result<Self> {
        let typ = match source.next() {
            Some('Z') => BaseType::Boolean,
            Some('B') => BaseType::Byte,
            Some('C') => BaseType::Char,
            Some('S') => BaseType::Short,
            Some('I') => BaseType::Int,
            Some('J') => BaseType::Long,
            Some('F') => BaseType::Float,
            Some('D') => BaseType::Double,
            Some(c) => {
                let msg = format!("Invalid base type character '{}'", c);
                return Err(IoError::new(ErrorKind::InvalidInput, msg));
            }
            None => {
                let msg = "Missing base type character";
                return Err(IoError::new(ErrorKind::UnexpectedEof, msg));
            }
        };
        Ok(typ)
    }
}

/// Type of a value, local, field, or method return
///
/// Two types are equal exactly when their descriptors are. `Null` is the type of the `null`
/// constant: it never shows up in a dex file, but it is needed so that a local holding `null` on
/// one path and an object on another can be merged.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum TypeId {
    Void,
    Null,
    Base(BaseType),
    Object(BinaryName),
    Array(Box<TypeId>),
}

/// Coarse classification of types, which is all that merging and register allocation care about
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum TypeCategory {
    /// `boolean`, `byte`, `char`, `short`, `int`
    IntLike,
    Float,
    /// `long`, `double`
    Wide,
    Reference,
    Array,
    Null,
    Void,
}

impl TypeId {
    pub const VOID: TypeId = TypeId::Void;
    pub const BOOLEAN: TypeId = TypeId::Base(BaseType::Boolean);
    pub const BYTE: TypeId = TypeId::Base(BaseType::Byte);
    pub const CHAR: TypeId = TypeId::Base(BaseType::Char);
    pub const SHORT: TypeId = TypeId::Base(BaseType::Short);
    pub const INT: TypeId = TypeId::Base(BaseType::Int);
    pub const LONG: TypeId = TypeId::Base(BaseType::Long);
    pub const FLOAT: TypeId = TypeId::Base(BaseType::Float);
    pub const DOUBLE: TypeId = TypeId::Base(BaseType::Double);
    pub const OBJECT: TypeId = TypeId::Object(BinaryName::OBJECT);
    pub const STRING: TypeId = TypeId::Object(BinaryName::STRING);
    pub const CLASS: TypeId = TypeId::Object(BinaryName::CLASS);
    pub const THROWABLE: TypeId = TypeId::Object(BinaryName::THROWABLE);

    /// Parse a type from its descriptor (eg. `Lcom/google/Fib;` or `[I`)
    pub fn from_descriptor(descriptor: &str) -> std::result::Result<TypeId, Error> {
        TypeId::parse(descriptor)
            .map_err(|err| Error::InvalidDescriptor(format!("{}: {}", descriptor, err)))
    }

    /// Class type from a binary name (eg. `com/google/Fib`)
    pub fn class(name: &str) -> std::result::Result<TypeId, Error> {
        BinaryName::from_string(name.to_owned())
            .map(TypeId::Object)
            .map_err(Error::InvalidDescriptor)
    }

    /// Array with this type as component
    pub fn array_of(self) -> TypeId {
        TypeId::Array(Box::new(self))
    }

    /// Component type, if this is an array type
    pub fn component(&self) -> Option<&TypeId> {
        match self {
            TypeId::Array(component) => Some(component),
            _ => None,
        }
    }

    pub fn category(&self) -> TypeCategory {
        match self {
            TypeId::Void => TypeCategory::Void,
            TypeId::Null => TypeCategory::Null,
            TypeId::Base(base) if base.is_int_like() => TypeCategory::IntLike,
            TypeId::Base(BaseType::Float) => TypeCategory::Float,
            TypeId::Base(_) => TypeCategory::Wide,
            TypeId::Object(_) => TypeCategory::Reference,
            TypeId::Array(_) => TypeCategory::Array,
        }
    }

    /// Is this an object, array, or the `null` type?
    pub fn is_reference(&self) -> bool {
        matches!(self, TypeId::Object(_) | TypeId::Array(_) | TypeId::Null)
    }

    pub fn is_int_like(&self) -> bool {
        self.category() == TypeCategory::IntLike
    }

    /// Character used for this type in a shorty descriptor
    pub fn shorty_char(&self) -> char {
        match self {
            TypeId::Void => 'V',
            TypeId::Base(base) => base.descriptor_char(),
            TypeId::Null | TypeId::Object(_) | TypeId::Array(_) => 'L',
        }
    }
}

/// Number of registers needed to hold a value of this type
impl Width for TypeId {
    fn width(&self) -> usize {
        match self {
            TypeId::Void => 0,
            TypeId::Base(base) => base.width(),
            TypeId::Null | TypeId::Object(_) | TypeId::Array(_) => 1,
        }
    }
}

impl RenderDescriptor for TypeId {
    fn render_to(&self, write_to: &mut String) {
        match self {
            TypeId::Void => write_to.push('V'),
            TypeId::Null => write_to.push_str("<null>"),
            TypeId::Base(base) => base.render_to(write_to),
            TypeId::Object(name) => {
                write_to.push('L');
                write_to.push_str(name.as_str());
                write_to.push(';');
            }
            TypeId::Array(component) => {
                write_to.push('[');
                component.render_to(write_to);
            }
        }
    }
}

impl ParseDescriptor for TypeId {
    fn parse_from(source: &mut Peekable<Chars>) -> Result<Self> {
        match source.peek() {
            Some('V') => {
                let _ = source.next();
                Ok(TypeId::Void)
            }
            Some('L') => {
                let _ = source.next();
                let mut name = String::new();
                loop {
                    match source.next() {
                        Some(';') => break,
                        Some(c) => name.push(c),
                        None => {
                            let msg = "Missing ';' after class name";
                            return Err(IoError::new(ErrorKind::UnexpectedEof, msg));
                        }
                    }
                }
                BinaryName::from_string(name)
                    .map(TypeId::Object)
                    .map_err(|msg| IoError::new(ErrorKind::InvalidInput, msg))
            }
            Some('[') => {
                let _ = source.next();
                let component = TypeId::parse_from(source)?;
                if component == TypeId::Void {
                    let msg = "Array of void";
                    return Err(IoError::new(ErrorKind::InvalidInput, msg));
                }
                Ok(component.array_of())
            }
            _ => BaseType::parse_from(source).map(TypeId::Base),
        }
    }
}

impl Debug for TypeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.render())
    }
}

impl Display for TypeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.render())
    }
}

/// Method signature shape: return type and parameter types
///
/// The receiver of instance methods is not part of the prototype.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Prototype {
    pub parameters: Vec<TypeId>,
    pub return_type: TypeId,
}

impl Prototype {
    pub fn new(return_type: TypeId, parameters: Vec<TypeId>) -> Prototype {
        Prototype {
            parameters,
            return_type,
        }
    }

    /// Compact descriptor where every reference type collapses to `L`
    ///
    /// See <https://source.android.com/docs/core/runtime/dex-format#shortydescriptor>
    pub fn shorty(&self) -> String {
        let mut shorty = String::with_capacity(self.parameters.len() + 1);
        shorty.push(self.return_type.shorty_char());
        for parameter in &self.parameters {
            shorty.push(parameter.shorty_char());
        }
        shorty
    }

    /// Number of registers taken by the parameters (excluding any receiver)
    pub fn parameter_width(&self) -> usize {
        self.parameters.iter().map(TypeId::width).sum()
    }
}

impl RenderDescriptor for Prototype {
    fn render_to(&self, write_to: &mut String) {
        write_to.push('(');
        for parameter in &self.parameters {
            parameter.render_to(write_to);
        }
        write_to.push(')');
        self.return_type.render_to(write_to);
    }
}

impl ParseDescriptor for Prototype {
    fn parse_from(source: &mut Peekable<Chars>) -> Result<Self> {
        if source.next() != Some('(') {
            let msg = "Expected '(' at start of method descriptor";
            return Err(IoError::new(ErrorKind::InvalidInput, msg));
        }
        let mut parameters = vec![];
        while source.peek() != Some(&')') {
            let parameter = TypeId::parse_from(source)?;
            if parameter == TypeId::Void {
                let msg = "Parameter of type void";
                return Err(IoError::new(ErrorKind::InvalidInput, msg));
            }
            parameters.push(parameter);
        }
        let _ = source.next();
        let return_type = TypeId::parse_from(source)?;
        Ok(Prototype {
            parameters,
            return_type,
        })
    }
}

impl Debug for Prototype {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.render())
    }
}
