use crate::dex::{
    write_dex, Annotation, ClassAccessFlags, ClassDefinition, Code, CodeBuilder, ConstantValue,
    ElementKind, Error, FieldAccessFlags, FieldDefinition, FieldId, MethodAccessFlags,
    MethodDefinition, MethodId, Name, Settings, TableBuilder, TypeId, UnresolvedReference,
};
use std::collections::HashMap;
use std::path::Path;

/// Builds one dex file
///
/// Classes and their members are declared up front. Method bodies are built separately with the
/// [`CodeBuilder`] returned by [`DexBuilder::declare_method`] and handed back with
/// [`DexBuilder::define_code`]. Nothing gets an index until [`DexBuilder::generate`].
pub struct DexBuilder {
    settings: Settings,
    classes: Vec<ClassDefinition>,
    class_index: HashMap<TypeId, usize>,
}

impl DexBuilder {
    pub fn new(settings: Settings) -> DexBuilder {
        DexBuilder {
            settings,
            classes: vec![],
            class_index: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Classes declared so far, in declaration order
    pub fn classes(&self) -> &[ClassDefinition] {
        &self.classes
    }

    pub fn class(&self, class: &TypeId) -> Option<&ClassDefinition> {
        self.class_index.get(class).map(|idx| &self.classes[*idx])
    }

    fn class_mut(&mut self, class: &TypeId) -> Result<&mut ClassDefinition, Error> {
        match self.class_index.get(class) {
            Some(idx) => Ok(&mut self.classes[*idx]),
            None => Err(Error::UnresolvedReference(UnresolvedReference::Type(
                class.clone(),
            ))),
        }
    }

    /// Declare a class
    ///
    /// Without a superclass, the class extends `java.lang.Object` (unless it is
    /// `java.lang.Object`).
    pub fn declare_class(
        &mut self,
        class: TypeId,
        source_file: Option<&str>,
        access_flags: ClassAccessFlags,
        superclass: Option<TypeId>,
        interfaces: Vec<TypeId>,
    ) -> Result<(), Error> {
        if !matches!(class, TypeId::Object(_)) {
            return Err(Error::InvalidDescriptor(format!(
                "{} is not a class type",
                class
            )));
        }
        if self.class_index.contains_key(&class) {
            return Err(Error::AlreadyDeclared(class.to_string()));
        }
        let superclass = match superclass {
            None if class != TypeId::OBJECT => Some(TypeId::OBJECT),
            other => other,
        };
        log::trace!("declared class {}", class);

        self.class_index.insert(class.clone(), self.classes.len());
        self.classes.push(ClassDefinition {
            class,
            access_flags,
            superclass,
            interfaces,
            source_file: source_file.map(str::to_owned),
            fields: vec![],
            methods: vec![],
            annotations: vec![],
        });
        Ok(())
    }

    /// Declare a field on a class already declared
    ///
    /// Only static fields can have an initial value, and it must be exactly of the field's type.
    pub fn declare_field(
        &mut self,
        field: FieldId,
        access_flags: FieldAccessFlags,
        static_value: Option<ConstantValue>,
    ) -> Result<(), Error> {
        if let Some(value) = &static_value {
            let is_static = access_flags.contains(FieldAccessFlags::STATIC);
            if !is_static || !value.fits_field(&field.field_type) {
                return Err(Error::InvalidStaticValue(field));
            }
        }
        let class = self.class_mut(&field.class)?;
        if class.field(&field).is_some() {
            return Err(Error::AlreadyDeclared(field.to_string()));
        }
        class.fields.push(FieldDefinition {
            field,
            access_flags,
            static_value,
            annotations: vec![],
        });
        Ok(())
    }

    /// Declare a method on a class already declared, returning a builder for its body
    ///
    /// Constructors and static initializers are flagged as such automatically. Abstract and
    /// native methods have no body, so their builder can just be dropped.
    pub fn declare_method(
        &mut self,
        method: MethodId,
        mut access_flags: MethodAccessFlags,
    ) -> Result<CodeBuilder, Error> {
        if method.is_constructor() || method.is_static_initializer() {
            access_flags |= MethodAccessFlags::CONSTRUCTOR;
        }
        let class = self.class_mut(&method.class)?;
        if class.method(&method).is_some() {
            return Err(Error::AlreadyDeclared(method.to_string()));
        }
        class.methods.push(MethodDefinition {
            method: method.clone(),
            access_flags,
            code: None,
            annotations: vec![],
        });
        Ok(CodeBuilder::new(method, access_flags, &self.settings))
    }

    /// Attach the finished body of a declared method
    pub fn define_code(&mut self, code: Code) -> Result<(), Error> {
        let class = self.class_mut(&code.method.class)?;
        let definition = class.method_mut(&code.method).ok_or_else(|| {
            Error::UnresolvedReference(UnresolvedReference::Method(code.method.clone()))
        })?;
        if definition.access_flags.is_bodiless() {
            return Err(Error::InvalidOperation(format!(
                "{} is abstract or native and cannot have code",
                code.method
            )));
        }
        if definition.code.is_some() {
            return Err(Error::AlreadyDeclared(format!("code for {}", code.method)));
        }
        definition.code = Some(code);
        Ok(())
    }

    /// Attach an annotation to a declared class
    pub fn annotate_class(&mut self, class: &TypeId, annotation: Annotation) -> Result<(), Error> {
        check_target(&annotation, ElementKind::Type, class, class.to_string())?;
        let definition = self.class_mut(class)?;
        attach(&mut definition.annotations, annotation, class.to_string())
    }

    /// Attach an annotation to a declared method
    pub fn annotate_method(
        &mut self,
        method: &MethodId,
        annotation: Annotation,
    ) -> Result<(), Error> {
        check_target(&annotation, ElementKind::Method, &method.class, method.to_string())?;
        let definition = self
            .class_mut(&method.class)?
            .method_mut(method)
            .ok_or_else(|| {
                Error::UnresolvedReference(UnresolvedReference::Method(method.clone()))
            })?;
        attach(&mut definition.annotations, annotation, method.to_string())
    }

    /// Attach an annotation to a declared field
    pub fn annotate_field(&mut self, field: &FieldId, annotation: Annotation) -> Result<(), Error> {
        check_target(&annotation, ElementKind::Field, &field.class, field.to_string())?;
        let definition = self
            .class_mut(&field.class)?
            .field_mut(field)
            .ok_or_else(|| Error::UnresolvedReference(UnresolvedReference::Field(field.clone())))?;
        attach(&mut definition.annotations, annotation, field.to_string())
    }

    /// Assemble everything declared into the bytes of a dex file
    ///
    /// The builder is left untouched, so generating twice gives identical output.
    pub fn generate(&self) -> Result<Vec<u8>, Error> {
        for class in &self.classes {
            for method in &class.methods {
                if method.code.is_none() && !method.access_flags.is_bodiless() {
                    return Err(Error::UnresolvedReference(UnresolvedReference::MissingCode(
                        method.method.clone(),
                    )));
                }
            }
        }

        let classes = self.class_def_order()?;
        let tables = self.collect_references().freeze(&self.settings)?;
        write_dex(&classes, &tables, &self.settings)
    }

    /// Generate the dex file and write it out
    pub fn write_to_path(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let bytes = self.generate()?;
        std::fs::write(path.as_ref(), bytes)?;
        log::debug!("wrote {}", path.as_ref().display());
        Ok(())
    }

    /// Every string, type, prototype, field, and method the unit refers to
    fn collect_references(&self) -> TableBuilder {
        let mut tables = TableBuilder::new();
        for class in &self.classes {
            tables.add_type(&class.class);
            for supertype in class.supertypes() {
                tables.add_type(supertype);
            }
            if let Some(source_file) = &class.source_file {
                tables.add_string(source_file);
            }
            for field in &class.fields {
                tables.add_field(&field.field);
                if let Some(value) = &field.static_value {
                    tables.add_value(value);
                }
            }
            for method in &class.methods {
                tables.add_method(&method.method);
                if let Some(code) = &method.code {
                    tables.add_code(code);
                }
            }

            let annotations = class
                .annotations
                .iter()
                .chain(class.fields.iter().flat_map(|f| f.annotations.iter()))
                .chain(class.methods.iter().flat_map(|m| m.annotations.iter()));
            for annotation in annotations {
                tables.add_type(&annotation.annotation_type);
                for (name, value) in annotation.elements() {
                    tables.add_string(name.as_str());
                    tables.add_value(value);
                }
            }
        }
        tables
    }

    /// Classes ordered so that supertypes declared in this unit come before their subtypes
    fn class_def_order(&self) -> Result<Vec<&ClassDefinition>, Error> {
        #[derive(Copy, Clone, PartialEq)]
        enum Visit {
            Unvisited,
            InProgress,
            Done,
        }

        fn visit<'a>(
            builder: &'a DexBuilder,
            idx: usize,
            state: &mut Vec<Visit>,
            order: &mut Vec<&'a ClassDefinition>,
        ) -> Result<(), Error> {
            match state[idx] {
                Visit::Done => return Ok(()),
                Visit::InProgress => {
                    return Err(Error::InvalidOperation(format!(
                        "Class hierarchy cycle through {}",
                        builder.classes[idx].class
                    )))
                }
                Visit::Unvisited => (),
            }
            state[idx] = Visit::InProgress;
            let class = &builder.classes[idx];
            for supertype in class.supertypes() {
                if let Some(super_idx) = builder.class_index.get(supertype) {
                    visit(builder, *super_idx, state, order)?;
                }
            }
            state[idx] = Visit::Done;
            order.push(class);
            Ok(())
        }

        let mut state = vec![Visit::Unvisited; self.classes.len()];
        let mut order = Vec::with_capacity(self.classes.len());
        for idx in 0..self.classes.len() {
            visit(self, idx, &mut state, &mut order)?;
        }
        Ok(order)
    }
}

/// Check the kind and owner of an annotation against the element it is being attached to
fn check_target(
    annotation: &Annotation,
    kind: ElementKind,
    target_owner: &TypeId,
    target: String,
) -> Result<(), Error> {
    if annotation.element_kind != kind {
        return Err(Error::AnnotationElementKind {
            annotation_type: annotation.annotation_type.clone(),
            target,
        });
    }
    if annotation.owner != *target_owner {
        return Err(Error::AnnotationTargetMismatch {
            annotation_owner: annotation.owner.clone(),
            target,
            target_owner: target_owner.clone(),
        });
    }
    Ok(())
}

fn attach(
    annotations: &mut Vec<Annotation>,
    annotation: Annotation,
    target: String,
) -> Result<(), Error> {
    if annotations
        .iter()
        .any(|existing| existing.annotation_type == annotation.annotation_type)
    {
        return Err(Error::DuplicateAnnotation {
            annotation_type: annotation.annotation_type,
            target,
        });
    }
    annotations.push(annotation);
    Ok(())
}
