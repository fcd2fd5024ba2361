use super::{IdTables, Serialize, Uleb128};
use crate::dex::{Annotation, ConstantValue, Error, IndexResolver, Name};

const VALUE_BYTE: u8 = 0x00;
const VALUE_SHORT: u8 = 0x02;
const VALUE_CHAR: u8 = 0x03;
const VALUE_INT: u8 = 0x04;
const VALUE_LONG: u8 = 0x06;
const VALUE_FLOAT: u8 = 0x10;
const VALUE_DOUBLE: u8 = 0x11;
const VALUE_STRING: u8 = 0x17;
const VALUE_TYPE: u8 = 0x18;
const VALUE_ENUM: u8 = 0x1b;
const VALUE_ARRAY: u8 = 0x1c;
const VALUE_NULL: u8 = 0x1e;
const VALUE_BOOLEAN: u8 = 0x1f;

/// Append an [`encoded_value`][0]
///
/// Numbers take as few bytes as they can: sign-extended for signed types, zero-extended for
/// `char` and indices, and zero-extended to the right for floating point.
///
/// [0]: https://source.android.com/docs/core/runtime/dex-format#encoding
pub fn encode_value(
    value: &ConstantValue,
    tables: &IdTables,
    out: &mut Vec<u8>,
) -> Result<(), Error> {
    match value {
        ConstantValue::Byte(b) => {
            out.push(VALUE_BYTE);
            out.push(*b as u8);
        }
        ConstantValue::Short(s) => signed(VALUE_SHORT, *s as i64, out),
        ConstantValue::Char(c) => unsigned(VALUE_CHAR, *c as u64, out),
        ConstantValue::Int(i) => signed(VALUE_INT, *i as i64, out),
        ConstantValue::Long(l) => signed(VALUE_LONG, *l, out),
        ConstantValue::Float(f) => right_zero_extended(VALUE_FLOAT, f.to_bits() as u64, 4, out),
        ConstantValue::Double(d) => right_zero_extended(VALUE_DOUBLE, d.to_bits(), 8, out),
        ConstantValue::String(string) => {
            unsigned(VALUE_STRING, tables.string_index(string)? as u64, out)
        }
        ConstantValue::Type(typ) => unsigned(VALUE_TYPE, tables.type_index(typ)? as u64, out),
        ConstantValue::Enum(field) => {
            unsigned(VALUE_ENUM, tables.field_index(field)? as u64, out)
        }
        ConstantValue::Array(values) => {
            out.push(VALUE_ARRAY);
            Uleb128(values.len() as u32).serialize(out)?;
            for value in values {
                encode_value(value, tables, out)?;
            }
        }
        ConstantValue::Null => out.push(VALUE_NULL),
        ConstantValue::Boolean(b) => out.push(VALUE_BOOLEAN | (*b as u8) << 5),
    }
    Ok(())
}

/// Append an `encoded_array`
pub fn encode_array(
    values: &[ConstantValue],
    tables: &IdTables,
    out: &mut Vec<u8>,
) -> Result<(), Error> {
    Uleb128(values.len() as u32).serialize(out)?;
    for value in values {
        encode_value(value, tables, out)?;
    }
    Ok(())
}

/// Append an `encoded_annotation`, elements sorted by name index
pub fn encode_annotation(
    annotation: &Annotation,
    tables: &IdTables,
    out: &mut Vec<u8>,
) -> Result<(), Error> {
    let mut elements = annotation
        .elements()
        .iter()
        .map(|(name, value)| Ok((tables.string_index(name.as_str())?, value)))
        .collect::<Result<Vec<_>, Error>>()?;
    elements.sort_by_key(|(name_idx, _)| *name_idx);

    Uleb128(tables.type_index(&annotation.annotation_type)?).serialize(out)?;
    Uleb128(elements.len() as u32).serialize(out)?;
    for (name_idx, value) in elements {
        Uleb128(name_idx).serialize(out)?;
        encode_value(value, tables, out)?;
    }
    Ok(())
}

fn header(value_type: u8, size: usize, out: &mut Vec<u8>) {
    out.push(((size - 1) as u8) << 5 | value_type);
}

fn signed(value_type: u8, value: i64, out: &mut Vec<u8>) {
    let mut size = 1;
    while size < 8 {
        let shift = 64 - 8 * size;
        if value << shift >> shift == value {
            break;
        }
        size += 1;
    }
    header(value_type, size, out);
    out.extend_from_slice(&value.to_le_bytes()[..size]);
}

fn unsigned(value_type: u8, value: u64, out: &mut Vec<u8>) {
    let bits = 64 - value.leading_zeros() as usize;
    let size = ((bits + 7) / 8).max(1);
    header(value_type, size, out);
    out.extend_from_slice(&value.to_le_bytes()[..size]);
}

/// Keep only the high-order bytes of a `width`-byte value, dropping trailing zero bytes
fn right_zero_extended(value_type: u8, bits: u64, width: usize, out: &mut Vec<u8>) {
    let zero_bytes = if bits == 0 {
        width - 1
    } else {
        (bits.trailing_zeros() as usize / 8).min(width - 1)
    };
    let size = width - zero_bytes;
    header(value_type, size, out);
    out.extend_from_slice(&bits.to_le_bytes()[zero_bytes..width]);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dex::{Settings, TableBuilder};

    fn encoded(value: ConstantValue) -> Vec<u8> {
        let mut builder = TableBuilder::new();
        builder.add_value(&value);
        let tables = builder.freeze(&Settings::default()).unwrap();
        let mut out = vec![];
        encode_value(&value, &tables, &mut out).unwrap();
        out
    }

    #[test]
    fn minimal_integers() {
        assert_eq!(encoded(ConstantValue::Int(0)), vec![0x04, 0x00]);
        assert_eq!(encoded(ConstantValue::Int(-1)), vec![0x04, 0xFF]);
        assert_eq!(encoded(ConstantValue::Int(128)), vec![0x24, 0x80, 0x00]);
        assert_eq!(
            encoded(ConstantValue::Int(i32::MIN)),
            vec![0x64, 0x00, 0x00, 0x00, 0x80]
        );
        assert_eq!(encoded(ConstantValue::Char(0xFFFF)), vec![0x23, 0xFF, 0xFF]);
        assert_eq!(encoded(ConstantValue::Long(-2)), vec![0x06, 0xFE]);
    }

    #[test]
    fn floating_point() {
        // 1.0f is 0x3F800000: only the top two bytes are kept
        assert_eq!(encoded(ConstantValue::Float(1.0)), vec![0x30, 0x80, 0x3F]);
        assert_eq!(encoded(ConstantValue::Double(0.0)), vec![0x11, 0x00]);
        // 2.0 is 0x4000000000000000
        assert_eq!(encoded(ConstantValue::Double(2.0)), vec![0x11, 0x40]);
    }

    #[test]
    fn other_shapes() {
        assert_eq!(encoded(ConstantValue::Null), vec![0x1e]);
        assert_eq!(encoded(ConstantValue::Boolean(true)), vec![0x3f]);
        assert_eq!(encoded(ConstantValue::Boolean(false)), vec![0x1f]);
        assert_eq!(encoded(ConstantValue::String("a".to_owned())), vec![0x17, 0x00]);
        assert_eq!(
            encoded(ConstantValue::Array(vec![
                ConstantValue::Byte(-1),
                ConstantValue::Null
            ])),
            vec![0x1c, 0x02, 0x00, 0xFF, 0x1e]
        );
    }
}
