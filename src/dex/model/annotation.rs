use crate::dex::{ConstantValue, Error, Name, TypeId, UnqualifiedName};
use std::fmt;

/// What kind of element an annotation is meant for
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ElementKind {
    /// Class, interface, or enum declaration
    Type,
    Method,
    Field,
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ElementKind::Type => "type",
            ElementKind::Method => "method",
            ElementKind::Field => "field",
        })
    }
}

/// Retention of an annotation
///
/// The discriminants are the values stored in `annotation_item`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum AnnotationVisibility {
    Build = 0x00,
    Runtime = 0x01,
    System = 0x02,
}

/// Annotation to attach to one declared class, method, or field
///
/// An annotation is built for a specific `owner` (the class declaring the annotated element) and
/// can only be attached to elements of that class.
#[derive(Clone, Debug)]
pub struct Annotation {
    pub owner: TypeId,
    pub annotation_type: TypeId,
    pub element_kind: ElementKind,
    pub visibility: AnnotationVisibility,
    elements: Vec<(UnqualifiedName, ConstantValue)>,
}

impl Annotation {
    pub fn new(
        owner: TypeId,
        annotation_type: TypeId,
        element_kind: ElementKind,
        visibility: AnnotationVisibility,
    ) -> Annotation {
        Annotation {
            owner,
            annotation_type,
            element_kind,
            visibility,
            elements: vec![],
        }
    }

    /// Set an element of the annotation, replacing any earlier value with the same name
    ///
    /// Array and class-literal values are not supported.
    pub fn add_element(&mut self, name: &str, value: ConstantValue) -> Result<(), Error> {
        if matches!(value, ConstantValue::Array(_) | ConstantValue::Type(_)) {
            return Err(Error::UnsupportedValueShape(value));
        }
        let name = UnqualifiedName::from_string(name.to_owned()).map_err(Error::InvalidDescriptor)?;
        match self.elements.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, existing_value)) => *existing_value = value,
            None => self.elements.push((name, value)),
        }
        Ok(())
    }

    /// Elements in the order they were first set
    pub fn elements(&self) -> &[(UnqualifiedName, ConstantValue)] {
        &self.elements
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn annotation() -> Annotation {
        Annotation::new(
            TypeId::class("com/example/Owner").unwrap(),
            TypeId::class("com/example/Marker").unwrap(),
            ElementKind::Method,
            AnnotationVisibility::Runtime,
        )
    }

    #[test]
    fn elements_replace() {
        let mut ann = annotation();
        ann.add_element("value", ConstantValue::Int(1)).unwrap();
        ann.add_element("name", ConstantValue::String("x".to_owned()))
            .unwrap();
        ann.add_element("value", ConstantValue::Int(2)).unwrap();
        assert_eq!(ann.elements().len(), 2);
        assert_eq!(ann.elements()[0].1, ConstantValue::Int(2));
    }

    #[test]
    fn unsupported_shapes() {
        let mut ann = annotation();
        assert!(matches!(
            ann.add_element("values", ConstantValue::Array(vec![ConstantValue::Int(1)])),
            Err(Error::UnsupportedValueShape(_))
        ));
        assert!(matches!(
            ann.add_element("cls", ConstantValue::Type(TypeId::STRING)),
            Err(Error::UnsupportedValueShape(_))
        ));
        assert!(ann.elements().is_empty());
    }
}
