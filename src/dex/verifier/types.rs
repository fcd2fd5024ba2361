use crate::dex::{TypeCategory, TypeId};

/// Join of two types at a control flow merge point
///
/// `None` means the two types have no common representation (eg. `int` and `float`, or a
/// primitive and a reference). That is never silently coerced: callers turn it into a hard
/// error.
pub fn merge(a: &TypeId, b: &TypeId) -> Option<TypeId> {
    if a == b {
        return Some(a.clone());
    }

    match (a.category(), b.category()) {
        (TypeCategory::Null, _) if b.is_reference() => Some(b.clone()),
        (_, TypeCategory::Null) if a.is_reference() => Some(a.clone()),
        (TypeCategory::Array, TypeCategory::Array) => {
            let component = match (a.component(), b.component()) {
                (Some(a_elem), Some(b_elem)) => merge(a_elem, b_elem),
                _ => None,
            };
            match component {
                Some(component) if component.category() != TypeCategory::Null => {
                    Some(component.array_of())
                }
                _ => Some(TypeId::OBJECT),
            }
        }
        (TypeCategory::Reference | TypeCategory::Array, TypeCategory::Reference)
        | (TypeCategory::Reference, TypeCategory::Array) => Some(TypeId::OBJECT),
        (TypeCategory::IntLike, TypeCategory::IntLike) => Some(TypeId::INT),
        _ => None,
    }
}

/// Can a value of type `value` be used where `expected` is declared?
///
/// Deliberately loose: anything that would merge without error is accepted, except that a `long`
/// never stands in for a `double` (or vice versa) and a reference never stands in for a
/// primitive.
pub fn is_compatible(expected: &TypeId, value: &TypeId) -> bool {
    merge(expected, value).is_some()
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    fn any_type() -> impl Strategy<Value = TypeId> {
        let leaf = prop_oneof![
            Just(TypeId::BOOLEAN),
            Just(TypeId::BYTE),
            Just(TypeId::CHAR),
            Just(TypeId::SHORT),
            Just(TypeId::INT),
            Just(TypeId::LONG),
            Just(TypeId::FLOAT),
            Just(TypeId::DOUBLE),
            Just(TypeId::OBJECT),
            Just(TypeId::STRING),
            Just(TypeId::CLASS),
            Just(TypeId::Null),
        ];
        leaf.prop_recursive(3, 8, 1, |inner| {
            inner
                .prop_filter("no arrays of null", |t| *t != TypeId::Null)
                .prop_map(TypeId::array_of)
        })
    }

    proptest! {
        #[test]
        fn merge_is_idempotent(a in any_type()) {
            prop_assert_eq!(merge(&a, &a), Some(a));
        }

        #[test]
        fn merge_is_commutative(a in any_type(), b in any_type()) {
            prop_assert_eq!(merge(&a, &b), merge(&b, &a));
        }

        #[test]
        fn null_is_bottom_for_references(a in any_type()) {
            if a.is_reference() {
                prop_assert_eq!(merge(&TypeId::Null, &a), Some(a));
            } else {
                prop_assert_eq!(merge(&TypeId::Null, &a), None);
            }
        }
    }

    #[test]
    fn int_like_primitives_merge_to_int() {
        let int_likes = [
            TypeId::BOOLEAN,
            TypeId::BYTE,
            TypeId::CHAR,
            TypeId::SHORT,
            TypeId::INT,
        ];
        for a in &int_likes {
            for b in &int_likes {
                if a != b {
                    assert_eq!(merge(a, b), Some(TypeId::INT));
                }
            }
        }
    }

    #[test]
    fn incompatible_primitives() {
        assert_eq!(merge(&TypeId::INT, &TypeId::FLOAT), None);
        assert_eq!(merge(&TypeId::LONG, &TypeId::DOUBLE), None);
        assert_eq!(merge(&TypeId::INT, &TypeId::LONG), None);
        assert_eq!(merge(&TypeId::INT, &TypeId::OBJECT), None);
        assert_eq!(merge(&TypeId::LONG, &TypeId::Null), None);
    }

    #[test]
    fn references() {
        assert_eq!(
            merge(&TypeId::STRING, &TypeId::CLASS),
            Some(TypeId::OBJECT)
        );
        assert_eq!(
            merge(&TypeId::STRING, &TypeId::INT.array_of()),
            Some(TypeId::OBJECT)
        );
    }

    #[test]
    fn arrays() {
        // components merge
        assert_eq!(
            merge(&TypeId::STRING.array_of(), &TypeId::CLASS.array_of()),
            Some(TypeId::OBJECT.array_of())
        );
        assert_eq!(
            merge(&TypeId::BYTE.array_of(), &TypeId::SHORT.array_of()),
            Some(TypeId::INT.array_of())
        );

        // components don't merge
        assert_eq!(
            merge(&TypeId::INT.array_of(), &TypeId::FLOAT.array_of()),
            Some(TypeId::OBJECT)
        );
        assert_eq!(
            merge(&TypeId::INT.array_of(), &TypeId::STRING.array_of()),
            Some(TypeId::OBJECT)
        );
    }

    #[test]
    fn compatibility() {
        assert!(is_compatible(&TypeId::INT, &TypeId::SHORT));
        assert!(is_compatible(&TypeId::STRING, &TypeId::Null));
        assert!(!is_compatible(&TypeId::DOUBLE, &TypeId::LONG));
        assert!(!is_compatible(&TypeId::OBJECT, &TypeId::INT));
    }
}
