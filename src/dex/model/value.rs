use crate::dex::{BaseType, FieldId, TypeId};

/// Constant value, as loaded by `const*` instructions or stored in static fields and
/// annotation elements
#[derive(Clone, PartialEq, Debug)]
pub enum ConstantValue {
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Char(u16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Null,

    /// Enum constant, referenced by its static field
    Enum(FieldId),

    /// Class literal
    Type(TypeId),

    Array(Vec<ConstantValue>),
}

impl ConstantValue {
    /// Static type of the value (`None` for arrays, whose element type isn't recorded)
    pub fn type_id(&self) -> Option<TypeId> {
        let typ = match self {
            ConstantValue::Boolean(_) => TypeId::BOOLEAN,
            ConstantValue::Byte(_) => TypeId::BYTE,
            ConstantValue::Short(_) => TypeId::SHORT,
            ConstantValue::Char(_) => TypeId::CHAR,
            ConstantValue::Int(_) => TypeId::INT,
            ConstantValue::Long(_) => TypeId::LONG,
            ConstantValue::Float(_) => TypeId::FLOAT,
            ConstantValue::Double(_) => TypeId::DOUBLE,
            ConstantValue::String(_) => TypeId::STRING,
            ConstantValue::Null => TypeId::Null,
            ConstantValue::Enum(field) => field.field_type.clone(),
            ConstantValue::Type(_) => TypeId::CLASS,
            ConstantValue::Array(_) => return None,
        };
        Some(typ)
    }

    /// Value a field of this type holds when it isn't explicitly initialized
    pub fn default_for(typ: &TypeId) -> Option<ConstantValue> {
        let value = match typ {
            TypeId::Base(BaseType::Boolean) => ConstantValue::Boolean(false),
            TypeId::Base(BaseType::Byte) => ConstantValue::Byte(0),
            TypeId::Base(BaseType::Short) => ConstantValue::Short(0),
            TypeId::Base(BaseType::Char) => ConstantValue::Char(0),
            TypeId::Base(BaseType::Int) => ConstantValue::Int(0),
            TypeId::Base(BaseType::Long) => ConstantValue::Long(0),
            TypeId::Base(BaseType::Float) => ConstantValue::Float(0.0),
            TypeId::Base(BaseType::Double) => ConstantValue::Double(0.0),
            TypeId::Object(_) | TypeId::Array(_) => ConstantValue::Null,
            _ => return None,
        };
        Some(value)
    }

    /// Can a field declared with type `typ` be initialized with this value?
    ///
    /// Unlike locals, static values are encoded with their exact type, so `int`-like types don't
    /// stand in for each other.
    pub fn fits_field(&self, typ: &TypeId) -> bool {
        match self {
            ConstantValue::Null => typ.is_reference(),
            ConstantValue::String(_) => matches!(typ, TypeId::Object(_)),
            ConstantValue::Type(_) => matches!(typ, TypeId::Object(_)),
            ConstantValue::Enum(field) => field.field_type == *typ,
            ConstantValue::Array(_) => matches!(typ, TypeId::Array(_)),
            other => other.type_id().as_ref() == Some(typ),
        }
    }
}
