use super::{Error, Name, Prototype, RenderDescriptor, TypeId, UnqualifiedName};
use std::fmt::{Debug, Display, Formatter, Result as FmtResult};

/// Reference to a field: declaring class, name, and type
///
/// Two field references are the same table entry exactly when all three parts match.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FieldId {
    pub class: TypeId,
    pub name: UnqualifiedName,
    pub field_type: TypeId,
}

/// Reference to a method: declaring class, name, and prototype
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MethodId {
    pub class: TypeId,
    pub name: UnqualifiedName,
    pub prototype: Prototype,
}

impl FieldId {
    pub fn new(class: TypeId, name: &str, field_type: TypeId) -> Result<FieldId, Error> {
        let name = UnqualifiedName::from_string(name.to_owned()).map_err(Error::InvalidDescriptor)?;
        if field_type == TypeId::Void || field_type == TypeId::Null {
            return Err(Error::InvalidDescriptor(format!(
                "Field '{}' cannot have type {}",
                name, field_type
            )));
        }
        Ok(FieldId {
            class,
            name,
            field_type,
        })
    }
}

impl MethodId {
    pub fn new(
        class: TypeId,
        name: &str,
        return_type: TypeId,
        parameters: Vec<TypeId>,
    ) -> Result<MethodId, Error> {
        let name = UnqualifiedName::from_string(name.to_owned()).map_err(Error::InvalidDescriptor)?;
        if parameters.iter().any(|p| *p == TypeId::Void || *p == TypeId::Null) {
            return Err(Error::InvalidDescriptor(format!(
                "Method '{}' has a void parameter",
                name
            )));
        }
        Ok(MethodId {
            class,
            name,
            prototype: Prototype::new(return_type, parameters),
        })
    }

    /// Instance initializer (`<init>`)
    pub fn is_constructor(&self) -> bool {
        self.name == UnqualifiedName::INIT
    }

    /// Class initializer (`<clinit>`)
    pub fn is_static_initializer(&self) -> bool {
        self.name == UnqualifiedName::CLINIT
    }
}

impl Display for FieldId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}->{}:{}", self.class, self.name, self.field_type)
    }
}

impl Debug for FieldId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        Display::fmt(self, f)
    }
}

impl Display for MethodId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}->{}{}", self.class, self.name, self.prototype.render())
    }
}

impl Debug for MethodId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        Display::fmt(self, f)
    }
}
