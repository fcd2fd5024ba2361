use dexasm::dex::*;
use sha1::{Digest, Sha1};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Just enough of a dex reader to find things in generated files
struct DexReader<'a> {
    bytes: &'a [u8],
}

/// Fields of a `code_item`
struct CodeItem {
    registers_size: u16,
    ins_size: u16,
    outs_size: u16,
    tries: Vec<(u32, u16, Vec<(u32, u32)>)>,
    insns: Vec<u16>,
}

impl<'a> DexReader<'a> {
    fn u16_at(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.bytes[offset], self.bytes[offset + 1]])
    }

    fn u32_at(&self, offset: usize) -> u32 {
        let mut word = [0; 4];
        word.copy_from_slice(&self.bytes[offset..offset + 4]);
        u32::from_le_bytes(word)
    }

    fn uleb_at(&self, offset: &mut usize) -> u32 {
        let mut result = 0;
        let mut shift = 0;
        loop {
            let byte = self.bytes[*offset];
            *offset += 1;
            result |= ((byte & 0x7F) as u32) << shift;
            if byte & 0x80 == 0 {
                return result;
            }
            shift += 7;
        }
    }

    fn sleb_at(&self, offset: &mut usize) -> i32 {
        let mut result: i32 = 0;
        let mut shift = 0;
        loop {
            let byte = self.bytes[*offset];
            *offset += 1;
            result |= ((byte & 0x7F) as i32) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 32 && byte & 0x40 != 0 {
                    result |= -1 << shift;
                }
                return result;
            }
        }
    }

    /// String by index (only ASCII strings are used here)
    fn string(&self, idx: u32) -> String {
        let string_ids_off = self.u32_at(60) as usize;
        let mut offset = self.u32_at(string_ids_off + 4 * idx as usize) as usize;
        let len = self.uleb_at(&mut offset) as usize;
        String::from_utf8(self.bytes[offset..offset + len].to_vec()).unwrap()
    }

    fn type_descriptor(&self, idx: u32) -> String {
        let type_ids_off = self.u32_at(68) as usize;
        self.string(self.u32_at(type_ids_off + 4 * idx as usize))
    }

    fn method_name(&self, idx: u32) -> String {
        let method_ids_off = self.u32_at(92) as usize;
        self.string(self.u32_at(method_ids_off + 8 * idx as usize + 4))
    }

    /// Offset of the `class_def_item` for a class descriptor
    fn class_def(&self, descriptor: &str) -> Option<usize> {
        let class_defs_size = self.u32_at(96) as usize;
        let class_defs_off = self.u32_at(100) as usize;
        (0..class_defs_size)
            .map(|i| class_defs_off + 32 * i)
            .find(|off| self.type_descriptor(self.u32_at(*off)) == descriptor)
    }

    /// `code_off` of a method, looked up by name through the class data
    fn code_off(&self, class: &str, method: &str) -> Option<usize> {
        let class_def = self.class_def(class)?;
        let mut offset = self.u32_at(class_def + 24) as usize;
        let static_fields = self.uleb_at(&mut offset);
        let instance_fields = self.uleb_at(&mut offset);
        let direct_methods = self.uleb_at(&mut offset);
        let virtual_methods = self.uleb_at(&mut offset);
        for _ in 0..(static_fields + instance_fields) {
            self.uleb_at(&mut offset);
            self.uleb_at(&mut offset);
        }
        for count in [direct_methods, virtual_methods] {
            let mut method_idx = 0;
            for _ in 0..count {
                method_idx += self.uleb_at(&mut offset);
                let _flags = self.uleb_at(&mut offset);
                let code_off = self.uleb_at(&mut offset);
                if self.method_name(method_idx) == method {
                    return Some(code_off as usize);
                }
            }
        }
        None
    }

    /// Method indices in the class data, direct methods first
    fn method_indices(&self, class: &str) -> Vec<u32> {
        let mut indices = vec![];
        let class_def = match self.class_def(class) {
            Some(class_def) => class_def,
            None => return indices,
        };
        let mut offset = self.u32_at(class_def + 24) as usize;
        let static_fields = self.uleb_at(&mut offset);
        let instance_fields = self.uleb_at(&mut offset);
        let direct_methods = self.uleb_at(&mut offset);
        let virtual_methods = self.uleb_at(&mut offset);
        for _ in 0..(static_fields + instance_fields) {
            self.uleb_at(&mut offset);
            self.uleb_at(&mut offset);
        }
        for count in [direct_methods, virtual_methods] {
            let mut method_idx = 0;
            for _ in 0..count {
                method_idx += self.uleb_at(&mut offset);
                self.uleb_at(&mut offset);
                self.uleb_at(&mut offset);
                indices.push(method_idx);
            }
        }
        indices
    }

    fn code_item(&self, offset: usize) -> CodeItem {
        let tries_size = self.u16_at(offset + 6) as usize;
        let insns_size = self.u32_at(offset + 12) as usize;
        let insns: Vec<u16> = (0..insns_size)
            .map(|i| self.u16_at(offset + 16 + 2 * i))
            .collect();

        let mut tries_off = offset + 16 + 2 * insns_size;
        if tries_size > 0 && insns_size % 2 == 1 {
            tries_off += 2;
        }
        let handlers_off = tries_off + 8 * tries_size;
        let mut tries = vec![];
        for i in 0..tries_size {
            let try_off = tries_off + 8 * i;
            let start = self.u32_at(try_off);
            let count = self.u16_at(try_off + 4);
            let mut handler = handlers_off + self.u16_at(try_off + 6) as usize;
            let size = self.sleb_at(&mut handler);
            let handlers = (0..size.abs())
                .map(|_| {
                    let type_idx = self.uleb_at(&mut handler);
                    let address = self.uleb_at(&mut handler);
                    (type_idx, address)
                })
                .collect();
            tries.push((start, count, handlers));
        }

        CodeItem {
            registers_size: self.u16_at(offset),
            ins_size: self.u16_at(offset + 2),
            outs_size: self.u16_at(offset + 4),
            tries,
            insns,
        }
    }
}

fn adler32(bytes: &[u8]) -> u32 {
    let (mut a, mut b) = (1u32, 0u32);
    for byte in bytes {
        a = (a + *byte as u32) % 65521;
        b = (b + a) % 65521;
    }
    b << 16 | a
}

/// Checks that hold for any generated file
fn check_header(bytes: &[u8]) {
    let reader = DexReader { bytes };
    assert_eq!(&bytes[0..8], b"dex\n035\0");
    assert_eq!(reader.u32_at(32) as usize, bytes.len());
    assert_eq!(reader.u32_at(36), 0x70);
    assert_eq!(reader.u32_at(40), 0x1234_5678);
    assert_eq!(reader.u32_at(8), adler32(&bytes[12..]));
    assert_eq!(&bytes[12..32], Sha1::digest(&bytes[32..]).as_slice());

    // data section runs to the end of the file and holds the map
    let data_size = reader.u32_at(104) as usize;
    let data_off = reader.u32_at(108) as usize;
    assert_eq!(data_off + data_size, bytes.len());
    let map_off = reader.u32_at(52) as usize;
    assert!(map_off >= data_off && map_off < bytes.len());
}

fn fib_dex() -> Result<Vec<u8>, Error> {
    let mut dex = DexBuilder::new(Settings::default());
    let class = TypeId::class("com/example/Fib")?;
    dex.declare_class(
        class.clone(),
        Some("Fib.java"),
        ClassAccessFlags::PUBLIC,
        None,
        vec![],
    )?;

    // static int fib(int i) { if (i < 2) return i; return fib(i - 1) + fib(i - 2); }
    let fib = MethodId::new(class, "fib", TypeId::INT, vec![TypeId::INT])?;
    let mut code =
        dex.declare_method(fib.clone(), MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC)?;
    let i = code.parameter(0)?;
    let one = code.new_local(TypeId::INT)?;
    let two = code.new_local(TypeId::INT)?;
    let a = code.new_local(TypeId::INT)?;
    let b = code.new_local(TypeId::INT)?;
    let c = code.new_local(TypeId::INT)?;
    let d = code.new_local(TypeId::INT)?;
    let result = code.new_local(TypeId::INT)?;
    let base_case = code.new_label();

    code.set_line(3);
    code.load_constant(one, ConstantValue::Int(1))?;
    code.load_constant(two, ConstantValue::Int(2))?;
    code.compare_and_branch(Comparison::Lt, base_case, i, two)?;
    code.set_line(4);
    code.binary_op(BinaryOp::Subtract, a, i, one)?;
    code.invoke_static(&fib, Some(b), &[a])?;
    code.binary_op(BinaryOp::Subtract, c, i, two)?;
    code.invoke_static(&fib, Some(d), &[c])?;
    code.binary_op(BinaryOp::Add, result, b, d)?;
    code.return_value(result)?;
    code.mark_label(base_case)?;
    code.set_line(3);
    code.return_value(i)?;

    dex.define_code(code.result()?)?;
    dex.generate()
}

#[test]
fn fibonacci() {
    init_logging();
    let bytes = fib_dex().unwrap();
    check_header(&bytes);

    let reader = DexReader { bytes: &bytes };
    let code_off = reader.code_off("Lcom/example/Fib;", "fib").unwrap();
    assert_ne!(code_off, 0);
    let code = reader.code_item(code_off);
    assert_eq!(code.registers_size, 8);
    assert_eq!(code.ins_size, 1);
    assert_eq!(code.outs_size, 1);
    assert!(code.tries.is_empty());

    let insns = decode(&code.insns).unwrap();
    let branches: Vec<_> = insns.iter().filter(|insn| insn.is_branch()).collect();
    let invokes: Vec<_> = insns.iter().filter(|insn| insn.is_invoke()).collect();
    assert_eq!(branches.len(), 1);
    assert_eq!(branches[0].mnemonic, "if-lt");
    assert_eq!(invokes.len(), 2);
    assert!(invokes.iter().all(|insn| insn.mnemonic == "invoke-static"));

    // the branch lands on the final `return i`, where `i` is the last register
    let target =
        (branches[0].address as i64 + branches[0].branch_offset.unwrap() as i64) as usize;
    let last = insns.last().unwrap();
    assert_eq!(last.address, target);
    assert_eq!(last.mnemonic, "return");
    assert_eq!(last.registers, vec![7]);
}

#[test]
fn deterministic_output() {
    init_logging();
    assert_eq!(fib_dex().unwrap(), fib_dex().unwrap());
}

#[test]
fn try_catch() {
    init_logging();
    let mut dex = DexBuilder::new(Settings::default());
    let class = TypeId::class("com/example/Safe").unwrap();
    let arithmetic = TypeId::class("java/lang/ArithmeticException").unwrap();
    dex.declare_class(class.clone(), None, ClassAccessFlags::PUBLIC, None, vec![])
        .unwrap();

    // static int div(int a, int b) {
    //     try { return a / b; } catch (ArithmeticException e) { return 0; }
    // }
    let div = MethodId::new(class, "div", TypeId::INT, vec![TypeId::INT, TypeId::INT]).unwrap();
    let mut code = dex
        .declare_method(div, MethodAccessFlags::STATIC)
        .unwrap();
    let a = code.parameter(0).unwrap();
    let b = code.parameter(1).unwrap();
    let quotient = code.new_local(TypeId::INT).unwrap();
    let zero = code.new_local(TypeId::INT).unwrap();
    let caught = code.new_local(arithmetic.clone()).unwrap();
    let handler = code.new_label();

    code.add_catch_clause(arithmetic.clone(), handler).unwrap();
    code.binary_op(BinaryOp::Divide, quotient, a, b).unwrap();
    code.remove_catch_clause(&arithmetic).unwrap();
    code.return_value(quotient).unwrap();
    code.mark_label(handler).unwrap();
    code.move_exception(caught).unwrap();
    code.load_constant(zero, ConstantValue::Int(0)).unwrap();
    code.return_value(zero).unwrap();
    dex.define_code(code.result().unwrap()).unwrap();

    let bytes = dex.generate().unwrap();
    check_header(&bytes);
    let reader = DexReader { bytes: &bytes };
    let code_off = reader.code_off("Lcom/example/Safe;", "div").unwrap();
    let code = reader.code_item(code_off);
    assert_eq!(code.registers_size, 5);
    assert_eq!(code.ins_size, 2);
    assert_eq!(code.outs_size, 0);

    let insns = decode(&code.insns).unwrap();
    assert_eq!(code.tries.len(), 1);
    let (start, count, handlers) = &code.tries[0];
    assert_eq!(*start, 0);
    let divide = &insns[0];
    assert!(divide.mnemonic.starts_with("div-int"));
    assert_eq!(*count as usize, insns[1].address);

    assert_eq!(handlers.len(), 1);
    let (type_idx, address) = handlers[0];
    assert_eq!(
        reader.type_descriptor(type_idx),
        "Ljava/lang/ArithmeticException;"
    );
    let landing = insns
        .iter()
        .find(|insn| insn.address == address as usize)
        .unwrap();
    assert_eq!(landing.mnemonic, "move-exception");
}

#[test]
fn static_values() {
    init_logging();
    let mut dex = DexBuilder::new(Settings::default());
    let class = TypeId::class("com/example/Constants").unwrap();
    dex.declare_class(class.clone(), None, ClassAccessFlags::PUBLIC, None, vec![])
        .unwrap();

    let flags = FieldAccessFlags::PUBLIC | FieldAccessFlags::STATIC;
    let field = |name: &str, typ: TypeId| FieldId::new(class.clone(), name, typ).unwrap();
    dex.declare_field(field("C", TypeId::LONG), flags, Some(ConstantValue::Long(5)))
        .unwrap();
    dex.declare_field(field("B", TypeId::STRING), flags, None)
        .unwrap();
    dex.declare_field(field("A", TypeId::INT), flags, Some(ConstantValue::Int(7)))
        .unwrap();
    dex.declare_field(field("D", TypeId::BOOLEAN), flags, None)
        .unwrap();
    dex.declare_field(field("inst", TypeId::INT), FieldAccessFlags::PUBLIC, None)
        .unwrap();

    let bytes = dex.generate().unwrap();
    check_header(&bytes);
    let reader = DexReader { bytes: &bytes };
    let class_def = reader.class_def("Lcom/example/Constants;").unwrap();

    // A, B (defaulted to null), C; D is past the last explicit value
    let static_values_off = reader.u32_at(class_def + 28) as usize;
    assert_eq!(
        &bytes[static_values_off..static_values_off + 6],
        &[0x03, 0x04, 0x07, 0x1e, 0x06, 0x05]
    );

    // no methods, four static fields, one instance field
    let mut offset = reader.u32_at(class_def + 24) as usize;
    let sizes: Vec<u32> = (0..4).map(|_| reader.uleb_at(&mut offset)).collect();
    assert_eq!(sizes, vec![4, 1, 0, 0]);
}

#[test]
fn annotation_owner_mismatch_attaches_nothing() {
    init_logging();
    let mut dex = DexBuilder::new(Settings::default());
    let owner = TypeId::class("com/example/Owner").unwrap();
    let other = TypeId::class("com/example/Other").unwrap();
    for class in [&owner, &other] {
        dex.declare_class(class.clone(), None, ClassAccessFlags::PUBLIC, None, vec![])
            .unwrap();
    }
    let field = FieldId::new(other.clone(), "value", TypeId::INT).unwrap();
    dex.declare_field(field.clone(), FieldAccessFlags::PUBLIC, None)
        .unwrap();

    let before = dex.generate().unwrap();

    let mut annotation = Annotation::new(
        owner,
        TypeId::class("com/example/Marker").unwrap(),
        ElementKind::Field,
        AnnotationVisibility::Runtime,
    );
    annotation
        .add_element("level", ConstantValue::Int(3))
        .unwrap();
    match dex.annotate_field(&field, annotation) {
        Err(Error::AnnotationTargetMismatch {
            annotation_owner,
            target_owner,
            ..
        }) => {
            assert_eq!(annotation_owner.to_string(), "Lcom/example/Owner;");
            assert_eq!(target_owner, other);
        }
        other => panic!("expected owner mismatch, got {:?}", other),
    }

    assert_eq!(dex.generate().unwrap(), before);
}

#[test]
fn annotated_class() {
    init_logging();
    let mut dex = DexBuilder::new(Settings::default());
    let class = TypeId::class("com/example/Tagged").unwrap();
    dex.declare_class(class.clone(), None, ClassAccessFlags::PUBLIC, None, vec![])
        .unwrap();

    let mut annotation = Annotation::new(
        class.clone(),
        TypeId::class("com/example/Tag").unwrap(),
        ElementKind::Type,
        AnnotationVisibility::Runtime,
    );
    annotation
        .add_element("name", ConstantValue::String("tagged".to_owned()))
        .unwrap();
    dex.annotate_class(&class, annotation).unwrap();

    let bytes = dex.generate().unwrap();
    check_header(&bytes);
    let reader = DexReader { bytes: &bytes };
    let class_def = reader.class_def("Lcom/example/Tagged;").unwrap();
    let directory = reader.u32_at(class_def + 20) as usize;
    assert_ne!(directory, 0);

    // class_annotations_off -> annotation_set_item -> annotation_item
    let set = reader.u32_at(directory) as usize;
    assert_eq!(reader.u32_at(set), 1);
    let mut item = reader.u32_at(set + 4) as usize;
    assert_eq!(bytes[item], AnnotationVisibility::Runtime as u8);
    item += 1;
    let type_idx = reader.uleb_at(&mut item);
    assert_eq!(reader.type_descriptor(type_idx), "Lcom/example/Tag;");
    assert_eq!(reader.uleb_at(&mut item), 1);
    let name_idx = reader.uleb_at(&mut item);
    assert_eq!(reader.string(name_idx), "name");
    assert_eq!(bytes[item], 0x17);
}

#[test]
fn missing_code() {
    init_logging();
    let mut dex = DexBuilder::new(Settings::default());
    let class = TypeId::class("com/example/Empty").unwrap();
    dex.declare_class(class.clone(), None, ClassAccessFlags::PUBLIC, None, vec![])
        .unwrap();
    let method = MethodId::new(class, "run", TypeId::VOID, vec![]).unwrap();
    let _ = dex
        .declare_method(method.clone(), MethodAccessFlags::PUBLIC)
        .unwrap();

    match dex.generate() {
        Err(Error::UnresolvedReference(UnresolvedReference::MissingCode(missing))) => {
            assert_eq!(missing, method)
        }
        other => panic!("expected missing code, got {:?}", other.map(|b| b.len())),
    }
}

/// Declares an abstract class with one abstract method per name
fn crowded_dex(settings: Settings, names: &[&str]) -> Result<Vec<u8>, Error> {
    let mut dex = DexBuilder::new(settings);
    let class = TypeId::class("com/example/Crowded")?;
    dex.declare_class(
        class.clone(),
        None,
        ClassAccessFlags::PUBLIC | ClassAccessFlags::ABSTRACT,
        None,
        vec![],
    )?;
    for name in names {
        let method = MethodId::new(class.clone(), name, TypeId::VOID, vec![])?;
        let flags = MethodAccessFlags::PUBLIC | MethodAccessFlags::ABSTRACT;
        let _ = dex.declare_method(method, flags)?;
    }
    dex.generate()
}

#[test]
fn member_limit() {
    init_logging();
    let settings = Settings {
        max_member_ids: 2,
        ..Settings::default()
    };
    match crowded_dex(settings, &["a", "b", "c"]) {
        Err(Error::StructuralLimitExceeded { kind, count, limit }) => {
            assert_eq!(kind, TableKind::Methods);
            assert_eq!(count, 3);
            assert_eq!(limit, 2);
        }
        other => panic!("expected limit error, got {:?}", other.map(|b| b.len())),
    }
}

#[test]
fn member_limit_reached_exactly() {
    init_logging();
    let settings = Settings {
        max_member_ids: 2,
        ..Settings::default()
    };
    let bytes = crowded_dex(settings, &["b", "a"]).unwrap();
    check_header(&bytes);
    let reader = DexReader { bytes: &bytes };

    // three types (the class, `Object`, `V`) are fine above the member limit
    assert_eq!(reader.u32_at(64), 3);
    assert_eq!(reader.u32_at(88), 2);
    assert_eq!(reader.method_name(0), "a");
    assert_eq!(reader.method_name(1), "b");
    assert_eq!(reader.method_indices("Lcom/example/Crowded;"), vec![0, 1]);
}
