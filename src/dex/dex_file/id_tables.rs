use crate::dex::{
    Code, ConstantValue, Error, FieldId, IndexResolver, Instruction, MethodId, Name, Prototype,
    RenderDescriptor, ResolvedInstruction, Settings, TableKind, TypeId, UnresolvedReference,
};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Collects everything a unit references, deduplicated structurally
///
/// Nothing has an index until [`TableBuilder::freeze`], which happens once, after every method
/// body is finished.
#[derive(Default, Debug)]
pub struct TableBuilder {
    strings: HashSet<String>,
    types: HashSet<TypeId>,
    prototypes: HashSet<Prototype>,
    fields: HashSet<FieldId>,
    methods: HashSet<MethodId>,
}

impl TableBuilder {
    pub fn new() -> TableBuilder {
        TableBuilder::default()
    }

    pub fn add_string(&mut self, string: &str) {
        if !self.strings.contains(string) {
            self.strings.insert(string.to_owned());
        }
    }

    pub fn add_type(&mut self, typ: &TypeId) {
        if !self.types.contains(typ) {
            self.add_string(&typ.render());
            self.types.insert(typ.clone());
        }
    }

    pub fn add_prototype(&mut self, prototype: &Prototype) {
        if !self.prototypes.contains(prototype) {
            self.add_string(&prototype.shorty());
            self.add_type(&prototype.return_type);
            for parameter in &prototype.parameters {
                self.add_type(parameter);
            }
            self.prototypes.insert(prototype.clone());
        }
    }

    pub fn add_field(&mut self, field: &FieldId) {
        if !self.fields.contains(field) {
            self.add_type(&field.class);
            self.add_string(field.name.as_str());
            self.add_type(&field.field_type);
            self.fields.insert(field.clone());
        }
    }

    pub fn add_method(&mut self, method: &MethodId) {
        if !self.methods.contains(method) {
            self.add_type(&method.class);
            self.add_string(method.name.as_str());
            self.add_prototype(&method.prototype);
            self.methods.insert(method.clone());
        }
    }

    /// Add everything a constant refers to
    pub fn add_value(&mut self, value: &ConstantValue) {
        match value {
            ConstantValue::String(string) => self.add_string(string),
            ConstantValue::Type(typ) => self.add_type(typ),
            ConstantValue::Enum(field) => self.add_field(field),
            ConstantValue::Array(values) => {
                for value in values {
                    self.add_value(value);
                }
            }
            _ => (),
        }
    }

    /// Add everything referenced from the instructions and catch clauses of a method body
    pub fn add_code(&mut self, code: &Code) {
        for (_, _, insn) in &code.instructions {
            let insn = match insn {
                ResolvedInstruction::Plain { insn, .. } => insn,
                ResolvedInstruction::Branch(_) => continue,
            };
            match insn {
                Instruction::ConstString { string, .. } => self.add_string(string),
                Instruction::ConstClass { class, .. }
                | Instruction::CheckCast { class, .. }
                | Instruction::InstanceOf { class, .. }
                | Instruction::NewInstance { class, .. } => self.add_type(class),
                Instruction::NewArray { array_type, .. } => self.add_type(array_type),
                Instruction::InstanceGet { field, .. }
                | Instruction::InstancePut { field, .. }
                | Instruction::StaticGet { field, .. }
                | Instruction::StaticPut { field, .. } => self.add_field(field),
                Instruction::Invoke { method, .. } => self.add_method(method),
                _ => (),
            }
        }
        for try_item in &code.tries {
            for handler in &try_item.handlers {
                self.add_type(&handler.exception);
            }
        }
    }

    /// Sort every table into dex order and assign indices
    pub fn freeze(&self, settings: &Settings) -> Result<IdTables, Error> {
        check_limit(TableKind::Types, self.types.len(), Settings::DEX_ID_LIMIT)?;
        check_limit(TableKind::Prototypes, self.prototypes.len(), Settings::DEX_ID_LIMIT)?;
        let member_limit = settings.id_limit();
        check_limit(TableKind::Fields, self.fields.len(), member_limit)?;
        check_limit(TableKind::Methods, self.methods.len(), member_limit)?;

        let mut strings: Vec<String> = self.strings.iter().cloned().collect();
        strings.sort_by(|a, b| utf16_order(a, b));
        let string_index = index_map(&strings);

        // Type ids sort by the index of their descriptor, which is the same as by descriptor
        let mut types: Vec<(TypeId, String)> = self
            .types
            .iter()
            .map(|typ| (typ.clone(), typ.render()))
            .collect();
        types.sort_by(|(_, a), (_, b)| utf16_order(a, b));
        let types: Vec<TypeId> = types.into_iter().map(|(typ, _)| typ).collect();
        let type_index = index_map(&types);

        let type_idx = |typ: &TypeId| type_index.get(typ).copied().unwrap_or(u32::MAX);
        let string_idx = |string: &str| string_index.get(string).copied().unwrap_or(u32::MAX);

        let mut prototypes: Vec<Prototype> = self.prototypes.iter().cloned().collect();
        prototypes.sort_by_cached_key(|proto| {
            let params: Vec<u32> = proto.parameters.iter().map(type_idx).collect();
            (type_idx(&proto.return_type), params)
        });
        let prototype_index = index_map(&prototypes);

        let mut fields: Vec<FieldId> = self.fields.iter().cloned().collect();
        fields.sort_by_cached_key(|field| {
            (
                type_idx(&field.class),
                string_idx(field.name.as_str()),
                type_idx(&field.field_type),
            )
        });
        let field_index = index_map(&fields);

        let proto_idx = |proto: &Prototype| prototype_index.get(proto).copied().unwrap_or(u32::MAX);
        let mut methods: Vec<MethodId> = self.methods.iter().cloned().collect();
        methods.sort_by_cached_key(|method| {
            (
                type_idx(&method.class),
                string_idx(method.name.as_str()),
                proto_idx(&method.prototype),
            )
        });
        let method_index = index_map(&methods);

        log::debug!(
            "froze tables: {} strings, {} types, {} prototypes, {} fields, {} methods",
            strings.len(),
            types.len(),
            prototypes.len(),
            fields.len(),
            methods.len()
        );

        Ok(IdTables {
            strings,
            string_index,
            types,
            type_index,
            prototypes,
            prototype_index,
            fields,
            field_index,
            methods,
            method_index,
        })
    }
}

fn check_limit(kind: TableKind, count: usize, limit: usize) -> Result<(), Error> {
    if count > limit {
        Err(Error::StructuralLimitExceeded { kind, count, limit })
    } else {
        Ok(())
    }
}

/// Order strings by their UTF-16 code units (not by code points)
fn utf16_order(a: &str, b: &str) -> Ordering {
    a.encode_utf16().cmp(b.encode_utf16())
}

fn index_map<T: Clone + Eq + Hash>(entries: &[T]) -> HashMap<T, u32> {
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| (entry.clone(), index as u32))
        .collect()
}

/// Frozen identifier tables, in dex order
#[derive(Debug)]
pub struct IdTables {
    pub strings: Vec<String>,
    string_index: HashMap<String, u32>,
    pub types: Vec<TypeId>,
    type_index: HashMap<TypeId, u32>,
    pub prototypes: Vec<Prototype>,
    prototype_index: HashMap<Prototype, u32>,
    pub fields: Vec<FieldId>,
    field_index: HashMap<FieldId, u32>,
    pub methods: Vec<MethodId>,
    method_index: HashMap<MethodId, u32>,
}

impl IdTables {
    pub fn prototype_index(&self, prototype: &Prototype) -> Result<u32, Error> {
        self.prototype_index.get(prototype).copied().ok_or_else(|| {
            UnresolvedReference::TableEntry(format!("prototype {}", prototype.render())).into()
        })
    }
}

impl IndexResolver for IdTables {
    fn string_index(&self, string: &str) -> Result<u32, Error> {
        self.string_index.get(string).copied().ok_or_else(|| {
            UnresolvedReference::TableEntry(format!("string {:?}", string)).into()
        })
    }

    fn type_index(&self, typ: &TypeId) -> Result<u32, Error> {
        self.type_index
            .get(typ)
            .copied()
            .ok_or_else(|| UnresolvedReference::TableEntry(format!("type {}", typ)).into())
    }

    fn field_index(&self, field: &FieldId) -> Result<u32, Error> {
        self.field_index
            .get(field)
            .copied()
            .ok_or_else(|| UnresolvedReference::TableEntry(format!("field {}", field)).into())
    }

    fn method_index(&self, method: &MethodId) -> Result<u32, Error> {
        self.method_index
            .get(method)
            .copied()
            .ok_or_else(|| UnresolvedReference::TableEntry(format!("method {}", method)).into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn method(name: &str) -> MethodId {
        MethodId::new(
            TypeId::class("com/example/Big").unwrap(),
            name,
            TypeId::VOID,
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn too_many_methods() {
        let mut tables = TableBuilder::new();
        for i in 0..65537 {
            tables.add_method(&method(&format!("m{}", i)));
        }
        let err = tables.freeze(&Settings::default()).unwrap_err();
        match err {
            Error::StructuralLimitExceeded { kind, count, limit } => {
                assert_eq!(kind, TableKind::Methods);
                assert_eq!(count, 65537);
                assert_eq!(limit, 65536);
            }
            other => panic!("expected limit error, got {:?}", other),
        }
        let message = tables.freeze(&Settings::default()).unwrap_err().to_string();
        assert!(message.contains("65537"));
        assert!(message.contains("65536"));
    }

    #[test]
    fn configured_limit() {
        let settings = Settings {
            max_member_ids: 10,
            ..Settings::default()
        };
        let mut tables = TableBuilder::new();
        for i in 0..10 {
            tables.add_method(&method(&format!("m{}", i)));
        }
        assert!(tables.freeze(&settings).is_ok());
        tables.add_method(&method("one_more"));
        assert!(matches!(
            tables.freeze(&settings),
            Err(Error::StructuralLimitExceeded { count: 11, limit: 10, .. })
        ));
    }

    #[test]
    fn configured_limit_is_for_members_only() {
        let settings = Settings {
            max_member_ids: 2,
            ..Settings::default()
        };
        let mut tables = TableBuilder::new();
        tables.add_method(&method("a"));
        tables.add_method(&method("b"));
        for typ in [TypeId::INT, TypeId::LONG, TypeId::STRING, TypeId::OBJECT] {
            tables.add_type(&typ);
        }
        let frozen = tables.freeze(&settings).unwrap();
        assert_eq!(frozen.methods.len(), 2);
        assert_eq!(frozen.types.len(), 6);

        tables.add_field(&FieldId::new(TypeId::OBJECT, "x", TypeId::INT).unwrap());
        tables.add_field(&FieldId::new(TypeId::OBJECT, "y", TypeId::INT).unwrap());
        tables.add_field(&FieldId::new(TypeId::OBJECT, "z", TypeId::INT).unwrap());
        assert!(matches!(
            tables.freeze(&settings),
            Err(Error::StructuralLimitExceeded {
                kind: TableKind::Fields,
                count: 3,
                limit: 2
            })
        ));
    }

    #[test]
    fn dense_unique_indices() {
        let mut tables = TableBuilder::new();
        for i in (0..500).rev() {
            tables.add_method(&method(&format!("m{}", i)));
            // duplicates are ignored
            tables.add_method(&method(&format!("m{}", i)));
        }
        let frozen = tables.freeze(&Settings::default()).unwrap();
        assert_eq!(frozen.methods.len(), 500);

        let mut seen: Vec<u32> = frozen
            .methods
            .iter()
            .map(|m| frozen.method_index(m).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..500).collect::<Vec<u32>>());

        // sorted by name within the class
        let names: Vec<&str> = frozen.methods.iter().map(|m| m.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
    }

    #[test]
    fn table_order() {
        let mut tables = TableBuilder::new();
        tables.add_type(&TypeId::STRING);
        tables.add_type(&TypeId::INT);
        tables.add_type(&TypeId::INT.array_of());
        tables.add_string("\u{1F600}");
        tables.add_string("\u{FFFF}");

        let frozen = tables.freeze(&Settings::default()).unwrap();
        let types: Vec<String> = frozen.types.iter().map(|t| t.render()).collect();
        assert_eq!(types, vec!["I", "Ljava/lang/String;", "[I"]);

        // A surrogate pair sorts before U+FFFF in UTF-16 order
        let emoji = frozen.string_index("\u{1F600}").unwrap();
        let max_bmp = frozen.string_index("\u{FFFF}").unwrap();
        assert!(emoji < max_bmp);
    }
}
