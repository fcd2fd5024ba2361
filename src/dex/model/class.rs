use super::Annotation;
use crate::dex::{
    ClassAccessFlags, Code, ConstantValue, FieldAccessFlags, FieldId, MethodAccessFlags, MethodId,
    TypeId,
};

/// Class (or interface) declared in the unit being assembled
#[derive(Debug)]
pub struct ClassDefinition {
    pub class: TypeId,
    pub access_flags: ClassAccessFlags,
    pub superclass: Option<TypeId>,
    pub interfaces: Vec<TypeId>,
    pub source_file: Option<String>,
    pub fields: Vec<FieldDefinition>,
    pub methods: Vec<MethodDefinition>,
    pub annotations: Vec<Annotation>,
}

#[derive(Debug)]
pub struct FieldDefinition {
    pub field: FieldId,
    pub access_flags: FieldAccessFlags,

    /// Initial value (static fields only)
    pub static_value: Option<ConstantValue>,
    pub annotations: Vec<Annotation>,
}

#[derive(Debug)]
pub struct MethodDefinition {
    pub method: MethodId,
    pub access_flags: MethodAccessFlags,

    /// Body, once it has been built (never set for abstract and native methods)
    pub code: Option<Code>,
    pub annotations: Vec<Annotation>,
}

impl ClassDefinition {
    pub fn field(&self, field: &FieldId) -> Option<&FieldDefinition> {
        self.fields.iter().find(|def| def.field == *field)
    }

    pub fn field_mut(&mut self, field: &FieldId) -> Option<&mut FieldDefinition> {
        self.fields.iter_mut().find(|def| def.field == *field)
    }

    pub fn method(&self, method: &MethodId) -> Option<&MethodDefinition> {
        self.methods.iter().find(|def| def.method == *method)
    }

    pub fn method_mut(&mut self, method: &MethodId) -> Option<&mut MethodDefinition> {
        self.methods.iter_mut().find(|def| def.method == *method)
    }

    /// Types this class must come after in `class_defs`
    pub fn supertypes(&self) -> impl Iterator<Item = &TypeId> {
        self.superclass.iter().chain(self.interfaces.iter())
    }
}

impl FieldDefinition {
    pub fn is_static(&self) -> bool {
        self.access_flags.contains(FieldAccessFlags::STATIC)
    }
}

impl MethodDefinition {
    /// Direct methods are the ones that never go through virtual dispatch
    pub fn is_direct(&self) -> bool {
        self.access_flags.is_direct()
    }
}
