use super::{
    adler32, encode_annotation, encode_array, encode_modified_utf8, utf16_len, IdTables,
    Serialize, Sleb128, Uleb128, Uleb128p1,
};
use crate::dex::{
    Annotation, ClassDefinition, Code, ConstantValue, Error, IndexResolver, Name,
    RenderDescriptor, Settings,
};
use sha1::{Digest, Sha1};
use std::collections::HashMap;

const MAGIC: [u8; 8] = *b"dex\n035\0";
const ENDIAN_CONSTANT: u32 = 0x1234_5678;
const HEADER_SIZE: u32 = 0x70;
const NO_INDEX: u32 = 0xFFFF_FFFF;

const TYPE_HEADER_ITEM: u16 = 0x0000;
const TYPE_STRING_ID_ITEM: u16 = 0x0001;
const TYPE_TYPE_ID_ITEM: u16 = 0x0002;
const TYPE_PROTO_ID_ITEM: u16 = 0x0003;
const TYPE_FIELD_ID_ITEM: u16 = 0x0004;
const TYPE_METHOD_ID_ITEM: u16 = 0x0005;
const TYPE_CLASS_DEF_ITEM: u16 = 0x0006;
const TYPE_MAP_LIST: u16 = 0x1000;
const TYPE_TYPE_LIST: u16 = 0x1001;
const TYPE_ANNOTATION_SET_ITEM: u16 = 0x1003;
const TYPE_CLASS_DATA_ITEM: u16 = 0x2000;
const TYPE_CODE_ITEM: u16 = 0x2001;
const TYPE_STRING_DATA_ITEM: u16 = 0x2002;
const TYPE_DEBUG_INFO_ITEM: u16 = 0x2003;
const TYPE_ANNOTATION_ITEM: u16 = 0x2004;
const TYPE_ENCODED_ARRAY_ITEM: u16 = 0x2005;
const TYPE_ANNOTATIONS_DIRECTORY_ITEM: u16 = 0x2006;

const DBG_END_SEQUENCE: u8 = 0x00;
const DBG_ADVANCE_PC: u8 = 0x01;
const DBG_ADVANCE_LINE: u8 = 0x02;
const DBG_FIRST_SPECIAL: u8 = 0x0a;
const DBG_LINE_BASE: i64 = -4;
const DBG_LINE_RANGE: i64 = 15;

/// Entry in the `map_list`
#[derive(Copy, Clone, Debug)]
struct MapItem {
    item_type: u16,
    size: u32,
    offset: u32,
}

/// Data section under construction
///
/// Items of one type are written back to back, so the map entry for a type is extended as long
/// as the same type keeps getting recorded.
struct DataSection {
    base: u32,
    bytes: Vec<u8>,
    map: Vec<MapItem>,
}

impl DataSection {
    fn new(base: u32) -> DataSection {
        DataSection {
            base,
            bytes: vec![],
            map: vec![],
        }
    }

    fn offset(&self) -> u32 {
        self.base + self.bytes.len() as u32
    }

    /// Start a new item, returning its file offset
    fn begin_item(&mut self, item_type: u16, alignment: usize) -> u32 {
        while (self.base as usize + self.bytes.len()) % alignment != 0 {
            self.bytes.push(0);
        }
        let offset = self.offset();
        match self.map.last_mut() {
            Some(last) if last.item_type == item_type => last.size += 1,
            _ => self.map.push(MapItem {
                item_type,
                size: 1,
                offset,
            }),
        }
        offset
    }
}

/// Offsets of the annotation data for one class
#[derive(Default)]
struct ClassAnnotations {
    class_items: Vec<(u32, u32)>,
    field_items: Vec<(u32, Vec<(u32, u32)>)>,
    method_items: Vec<(u32, Vec<(u32, u32)>)>,
}

impl ClassAnnotations {
    fn is_empty(&self) -> bool {
        self.class_items.is_empty() && self.field_items.is_empty() && self.method_items.is_empty()
    }
}

/// Lay out and serialize a whole dex file
///
/// `classes` must already be in `class_defs` order (supertypes first). Every reference must be
/// in `tables`.
pub fn write_dex(
    classes: &[&ClassDefinition],
    tables: &IdTables,
    settings: &Settings,
) -> Result<Vec<u8>, Error> {
    let string_ids_off = HEADER_SIZE;
    let type_ids_off = string_ids_off + 4 * tables.strings.len() as u32;
    let proto_ids_off = type_ids_off + 4 * tables.types.len() as u32;
    let field_ids_off = proto_ids_off + 12 * tables.prototypes.len() as u32;
    let method_ids_off = field_ids_off + 8 * tables.fields.len() as u32;
    let class_defs_off = method_ids_off + 8 * tables.methods.len() as u32;
    let data_off = class_defs_off + 32 * classes.len() as u32;

    let mut data = DataSection::new(data_off);

    // string_data_item
    let mut string_data_offs = Vec::with_capacity(tables.strings.len());
    for string in &tables.strings {
        string_data_offs.push(data.begin_item(TYPE_STRING_DATA_ITEM, 1));
        Uleb128(utf16_len(string) as u32).serialize(&mut data.bytes)?;
        data.bytes.extend(encode_modified_utf8(string));
        data.bytes.push(0);
    }

    // type_list (shared between prototypes and interfaces)
    let mut type_lists: HashMap<Vec<u32>, u32> = HashMap::new();
    let mut write_type_list = |types: Vec<u32>, data: &mut DataSection| -> Result<u32, Error> {
        if types.is_empty() {
            return Ok(0);
        }
        if let Some(offset) = type_lists.get(&types) {
            return Ok(*offset);
        }
        let offset = data.begin_item(TYPE_TYPE_LIST, 4);
        (types.len() as u32).serialize(&mut data.bytes)?;
        for typ in &types {
            (*typ as u16).serialize(&mut data.bytes)?;
        }
        type_lists.insert(types, offset);
        Ok(offset)
    };
    let mut proto_parameter_offs = Vec::with_capacity(tables.prototypes.len());
    for prototype in &tables.prototypes {
        let params = prototype
            .parameters
            .iter()
            .map(|param| tables.type_index(param))
            .collect::<Result<Vec<_>, Error>>()?;
        proto_parameter_offs.push(write_type_list(params, &mut data)?);
    }
    let mut interfaces_offs = Vec::with_capacity(classes.len());
    for class in classes {
        let interfaces = class
            .interfaces
            .iter()
            .map(|interface| tables.type_index(interface))
            .collect::<Result<Vec<_>, Error>>()?;
        interfaces_offs.push(write_type_list(interfaces, &mut data)?);
    }

    let annotations_offs = write_annotations(classes, tables, &mut data)?;

    // debug_info_item and code_item, keyed by method index
    let mut debug_info_offs: HashMap<u32, u32> = HashMap::new();
    if settings.emit_debug_info {
        for class in classes {
            for method in &class.methods {
                if let Some(code) = method.code.as_ref().filter(|code| !code.positions.is_empty()) {
                    let offset = write_debug_info(code, &mut data)?;
                    debug_info_offs.insert(tables.method_index(&method.method)?, offset);
                }
            }
        }
    }
    let mut code_offs: HashMap<u32, u32> = HashMap::new();
    for class in classes {
        for method in &class.methods {
            if let Some(code) = &method.code {
                let method_idx = tables.method_index(&method.method)?;
                let debug_info_off = debug_info_offs.get(&method_idx).copied().unwrap_or(0);
                let offset = write_code(code, debug_info_off, tables, &mut data)?;
                code_offs.insert(method_idx, offset);
            }
        }
    }

    let mut class_data_offs = Vec::with_capacity(classes.len());
    for class in classes {
        class_data_offs.push(write_class_data(class, tables, &code_offs, &mut data)?);
    }

    let mut static_values_offs = Vec::with_capacity(classes.len());
    for class in classes {
        static_values_offs.push(write_static_values(class, tables, &mut data)?);
    }

    // map_list (including itself and the sections before `data`)
    let map_off = data.begin_item(TYPE_MAP_LIST, 4);
    let mut map = vec![MapItem {
        item_type: TYPE_HEADER_ITEM,
        size: 1,
        offset: 0,
    }];
    let id_sections = [
        (TYPE_STRING_ID_ITEM, tables.strings.len(), string_ids_off),
        (TYPE_TYPE_ID_ITEM, tables.types.len(), type_ids_off),
        (TYPE_PROTO_ID_ITEM, tables.prototypes.len(), proto_ids_off),
        (TYPE_FIELD_ID_ITEM, tables.fields.len(), field_ids_off),
        (TYPE_METHOD_ID_ITEM, tables.methods.len(), method_ids_off),
        (TYPE_CLASS_DEF_ITEM, classes.len(), class_defs_off),
    ];
    for (item_type, size, offset) in id_sections {
        if size > 0 {
            map.push(MapItem {
                item_type,
                size: size as u32,
                offset,
            });
        }
    }
    map.extend(data.map.iter().copied());
    (map.len() as u32).serialize(&mut data.bytes)?;
    for item in &map {
        item.item_type.serialize(&mut data.bytes)?;
        0u16.serialize(&mut data.bytes)?;
        item.size.serialize(&mut data.bytes)?;
        item.offset.serialize(&mut data.bytes)?;
    }

    let data_size = data.bytes.len() as u32;
    let file_size = data_off + data_size;

    // header and id sections
    let mut out: Vec<u8> = Vec::with_capacity(file_size as usize);
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&[0; 4 + 20]);
    file_size.serialize(&mut out)?;
    HEADER_SIZE.serialize(&mut out)?;
    ENDIAN_CONSTANT.serialize(&mut out)?;
    0u32.serialize(&mut out)?; // link_size
    0u32.serialize(&mut out)?; // link_off
    map_off.serialize(&mut out)?;
    let sections = [
        (tables.strings.len(), string_ids_off),
        (tables.types.len(), type_ids_off),
        (tables.prototypes.len(), proto_ids_off),
        (tables.fields.len(), field_ids_off),
        (tables.methods.len(), method_ids_off),
        (classes.len(), class_defs_off),
    ];
    for (size, offset) in sections {
        (size as u32).serialize(&mut out)?;
        (if size == 0 { 0 } else { offset }).serialize(&mut out)?;
    }
    data_size.serialize(&mut out)?;
    data_off.serialize(&mut out)?;

    for offset in string_data_offs {
        offset.serialize(&mut out)?;
    }
    for typ in &tables.types {
        tables.string_index(&typ.render())?.serialize(&mut out)?;
    }
    for (prototype, parameters_off) in tables.prototypes.iter().zip(proto_parameter_offs) {
        tables.string_index(&prototype.shorty())?.serialize(&mut out)?;
        tables.type_index(&prototype.return_type)?.serialize(&mut out)?;
        parameters_off.serialize(&mut out)?;
    }
    for field in &tables.fields {
        (tables.type_index(&field.class)? as u16).serialize(&mut out)?;
        (tables.type_index(&field.field_type)? as u16).serialize(&mut out)?;
        tables.string_index(field.name.as_str())?.serialize(&mut out)?;
    }
    for method in &tables.methods {
        (tables.type_index(&method.class)? as u16).serialize(&mut out)?;
        (tables.prototype_index(&method.prototype)? as u16).serialize(&mut out)?;
        tables.string_index(method.name.as_str())?.serialize(&mut out)?;
    }
    for (i, class) in classes.iter().enumerate() {
        tables.type_index(&class.class)?.serialize(&mut out)?;
        class.access_flags.serialize(&mut out)?;
        let superclass_idx = match &class.superclass {
            Some(superclass) => tables.type_index(superclass)?,
            None => NO_INDEX,
        };
        superclass_idx.serialize(&mut out)?;
        interfaces_offs[i].serialize(&mut out)?;
        let source_file_idx = match &class.source_file {
            Some(source_file) => tables.string_index(source_file)?,
            None => NO_INDEX,
        };
        source_file_idx.serialize(&mut out)?;
        annotations_offs[i].serialize(&mut out)?;
        class_data_offs[i].serialize(&mut out)?;
        static_values_offs[i].serialize(&mut out)?;
    }
    debug_assert_eq!(out.len() as u32, data_off);
    out.extend(data.bytes);

    let signature = Sha1::digest(&out[32..]);
    out[12..32].copy_from_slice(&signature);
    let checksum = adler32(&out[12..]);
    out[8..12].copy_from_slice(&checksum.to_le_bytes());

    log::debug!(
        "wrote dex file: {} bytes, {} classes, {} map entries",
        file_size,
        classes.len(),
        map.len()
    );
    Ok(out)
}

/// Write every annotation item, then the sets, then the directories
///
/// Returns the `annotations_off` for each class (`0` if it has no annotations).
fn write_annotations(
    classes: &[&ClassDefinition],
    tables: &IdTables,
    data: &mut DataSection,
) -> Result<Vec<u32>, Error> {
    let write_items = |annotations: &[Annotation],
                           data: &mut DataSection|
     -> Result<Vec<(u32, u32)>, Error> {
        let mut items = vec![];
        for annotation in annotations {
            let offset = data.begin_item(TYPE_ANNOTATION_ITEM, 1);
            data.bytes.push(annotation.visibility as u8);
            encode_annotation(annotation, tables, &mut data.bytes)?;
            items.push((tables.type_index(&annotation.annotation_type)?, offset));
        }
        items.sort_unstable();
        Ok(items)
    };

    let mut per_class = Vec::with_capacity(classes.len());
    for class in classes {
        let mut offsets = ClassAnnotations {
            class_items: write_items(&class.annotations, data)?,
            ..ClassAnnotations::default()
        };
        for field in &class.fields {
            if !field.annotations.is_empty() {
                let field_idx = tables.field_index(&field.field)?;
                offsets
                    .field_items
                    .push((field_idx, write_items(&field.annotations, data)?));
            }
        }
        for method in &class.methods {
            if !method.annotations.is_empty() {
                let method_idx = tables.method_index(&method.method)?;
                offsets
                    .method_items
                    .push((method_idx, write_items(&method.annotations, data)?));
            }
        }
        offsets.field_items.sort_by_key(|(idx, _)| *idx);
        offsets.method_items.sort_by_key(|(idx, _)| *idx);
        per_class.push(offsets);
    }

    let write_set = |items: &[(u32, u32)], data: &mut DataSection| -> Result<u32, Error> {
        let offset = data.begin_item(TYPE_ANNOTATION_SET_ITEM, 4);
        (items.len() as u32).serialize(&mut data.bytes)?;
        for (_, item_off) in items {
            item_off.serialize(&mut data.bytes)?;
        }
        Ok(offset)
    };
    let mut sets = Vec::with_capacity(classes.len());
    for offsets in &per_class {
        let class_set = if offsets.class_items.is_empty() {
            0
        } else {
            write_set(&offsets.class_items, data)?
        };
        let mut field_sets = vec![];
        for (field_idx, items) in &offsets.field_items {
            field_sets.push((*field_idx, write_set(items, data)?));
        }
        let mut method_sets = vec![];
        for (method_idx, items) in &offsets.method_items {
            method_sets.push((*method_idx, write_set(items, data)?));
        }
        sets.push((class_set, field_sets, method_sets));
    }

    let mut directories = Vec::with_capacity(classes.len());
    for (offsets, (class_set, field_sets, method_sets)) in per_class.iter().zip(sets) {
        if offsets.is_empty() {
            directories.push(0);
            continue;
        }
        let offset = data.begin_item(TYPE_ANNOTATIONS_DIRECTORY_ITEM, 4);
        class_set.serialize(&mut data.bytes)?;
        (field_sets.len() as u32).serialize(&mut data.bytes)?;
        (method_sets.len() as u32).serialize(&mut data.bytes)?;
        0u32.serialize(&mut data.bytes)?; // annotated_parameters_size
        for (idx, set_off) in field_sets.iter().chain(method_sets.iter()) {
            idx.serialize(&mut data.bytes)?;
            set_off.serialize(&mut data.bytes)?;
        }
        directories.push(offset);
    }
    Ok(directories)
}

/// Write the line number program for a method
fn write_debug_info(code: &Code, data: &mut DataSection) -> Result<u32, Error> {
    let offset = data.begin_item(TYPE_DEBUG_INFO_ITEM, 1);
    let out = &mut data.bytes;

    let line_start = code.positions.first().map(|(_, line)| *line).unwrap_or(1);
    Uleb128(line_start).serialize(out)?;
    let parameters = code.method.prototype.parameters.len();
    Uleb128(parameters as u32).serialize(out)?;
    for _ in 0..parameters {
        Uleb128p1(None).serialize(out)?;
    }

    let mut address: usize = 0;
    let mut line = line_start as i64;
    let mut emitted = false;
    for (position, new_line) in &code.positions {
        let mut address_diff = (position.0 - address) as i64;
        let mut line_diff = *new_line as i64 - line;
        if emitted && line_diff == 0 {
            continue;
        }

        if !(DBG_LINE_BASE..DBG_LINE_BASE + DBG_LINE_RANGE).contains(&line_diff) {
            out.push(DBG_ADVANCE_LINE);
            Sleb128(line_diff as i32).serialize(out)?;
            line_diff = 0;
        }
        let special = |address_diff: i64, line_diff: i64| {
            (line_diff - DBG_LINE_BASE) + address_diff * DBG_LINE_RANGE + DBG_FIRST_SPECIAL as i64
        };
        if special(address_diff, line_diff) > 0xFF {
            out.push(DBG_ADVANCE_PC);
            Uleb128(address_diff as u32).serialize(out)?;
            address_diff = 0;
        }
        out.push(special(address_diff, line_diff) as u8);

        address = position.0;
        line = *new_line as i64;
        emitted = true;
    }
    out.push(DBG_END_SEQUENCE);
    Ok(offset)
}

/// Write a `code_item`, with its tries and catch handlers
fn write_code(
    code: &Code,
    debug_info_off: u32,
    tables: &IdTables,
    data: &mut DataSection,
) -> Result<u32, Error> {
    let units = code.encode_instructions(tables)?;
    let offset = data.begin_item(TYPE_CODE_ITEM, 4);
    let out = &mut data.bytes;

    code.registers_size.serialize(out)?;
    code.ins_size.serialize(out)?;
    code.outs_size.serialize(out)?;
    (code.tries.len() as u16).serialize(out)?;
    debug_info_off.serialize(out)?;
    (units.len() as u32).serialize(out)?;
    for unit in &units {
        unit.serialize(out)?;
    }
    if code.tries.is_empty() {
        return Ok(offset);
    }
    if units.len() % 2 == 1 {
        0u16.serialize(out)?;
    }

    // Identical handler lists are shared between try items
    let mut handlers: Vec<Vec<u8>> = vec![];
    let mut try_handlers = Vec::with_capacity(code.tries.len());
    for try_item in &code.tries {
        let mut encoded = vec![];
        Sleb128(try_item.handlers.len() as i32).serialize(&mut encoded)?;
        for handler in &try_item.handlers {
            Uleb128(tables.type_index(&handler.exception)?).serialize(&mut encoded)?;
            Uleb128(handler.address.0 as u32).serialize(&mut encoded)?;
        }
        let index = match handlers.iter().position(|existing| *existing == encoded) {
            Some(index) => index,
            None => {
                handlers.push(encoded);
                handlers.len() - 1
            }
        };
        try_handlers.push(index);
    }

    let mut list = vec![];
    Uleb128(handlers.len() as u32).serialize(&mut list)?;
    let mut handler_offs = Vec::with_capacity(handlers.len());
    for handler in &handlers {
        handler_offs.push(list.len());
        list.extend_from_slice(handler);
    }

    for (try_item, handler) in code.tries.iter().zip(try_handlers) {
        let insn_count = u16::try_from(try_item.end.0 - try_item.start.0).map_err(|_| {
            Error::InvalidOperation(format!(
                "Try range of {} code units in {} is too long",
                try_item.end.0 - try_item.start.0,
                code.method
            ))
        })?;
        (try_item.start.0 as u32).serialize(out)?;
        insn_count.serialize(out)?;
        (handler_offs[handler] as u16).serialize(out)?;
    }
    out.extend(list);
    Ok(offset)
}

/// Write the `class_data_item` for a class (`0` if it has no fields or methods)
fn write_class_data(
    class: &ClassDefinition,
    tables: &IdTables,
    code_offs: &HashMap<u32, u32>,
    data: &mut DataSection,
) -> Result<u32, Error> {
    if class.fields.is_empty() && class.methods.is_empty() {
        return Ok(0);
    }

    let mut static_fields = vec![];
    let mut instance_fields = vec![];
    for field in &class.fields {
        let entry = (tables.field_index(&field.field)?, field.access_flags.bits());
        if field.is_static() {
            static_fields.push(entry);
        } else {
            instance_fields.push(entry);
        }
    }
    let mut direct_methods = vec![];
    let mut virtual_methods = vec![];
    for method in &class.methods {
        let method_idx = tables.method_index(&method.method)?;
        let code_off = code_offs.get(&method_idx).copied().unwrap_or(0);
        let entry = (method_idx, method.access_flags.bits(), code_off);
        if method.is_direct() {
            direct_methods.push(entry);
        } else {
            virtual_methods.push(entry);
        }
    }
    for list in [&mut static_fields, &mut instance_fields] {
        list.sort_unstable();
    }
    for list in [&mut direct_methods, &mut virtual_methods] {
        list.sort_unstable();
    }

    let offset = data.begin_item(TYPE_CLASS_DATA_ITEM, 1);
    let out = &mut data.bytes;
    for size in [
        static_fields.len(),
        instance_fields.len(),
        direct_methods.len(),
        virtual_methods.len(),
    ] {
        Uleb128(size as u32).serialize(out)?;
    }
    for fields in [&static_fields, &instance_fields] {
        let mut previous = 0;
        for (field_idx, flags) in fields {
            Uleb128(field_idx - previous).serialize(out)?;
            Uleb128(*flags).serialize(out)?;
            previous = *field_idx;
        }
    }
    for methods in [&direct_methods, &virtual_methods] {
        let mut previous = 0;
        for (method_idx, flags, code_off) in methods {
            Uleb128(method_idx - previous).serialize(out)?;
            Uleb128(*flags).serialize(out)?;
            Uleb128(*code_off).serialize(out)?;
            previous = *method_idx;
        }
    }
    Ok(offset)
}

/// Write the initial values of static fields (`0` if no static field has one)
///
/// Values are listed in field index order, up to the last field with an explicit value. Fields
/// before that without a value get the default for their type.
fn write_static_values(
    class: &ClassDefinition,
    tables: &IdTables,
    data: &mut DataSection,
) -> Result<u32, Error> {
    let mut statics = vec![];
    for field in &class.fields {
        if field.is_static() {
            statics.push((tables.field_index(&field.field)?, field));
        }
    }
    statics.sort_unstable_by_key(|(idx, _)| *idx);

    let last = match statics
        .iter()
        .rposition(|(_, field)| field.static_value.is_some())
    {
        Some(last) => last,
        None => return Ok(0),
    };
    let mut values = Vec::with_capacity(last + 1);
    for (_, field) in &statics[..=last] {
        let value = match &field.static_value {
            Some(value) => value.clone(),
            None => ConstantValue::default_for(&field.field.field_type)
                .ok_or_else(|| Error::InvalidStaticValue(field.field.clone()))?,
        };
        values.push(value);
    }

    let offset = data.begin_item(TYPE_ENCODED_ARRAY_ITEM, 1);
    encode_array(&values, tables, &mut data.bytes)?;
    Ok(offset)
}
