use crate::dex::{
    BaseType, EncodingOverflow, Error, FieldId, GotoForm, MethodId, TypeCategory, TypeId,
};
use std::fmt;
use std::ops::Not;

/// Resolves symbolic operands into table indices while encoding
pub trait IndexResolver {
    fn string_index(&self, string: &str) -> Result<u32, Error>;
    fn type_index(&self, typ: &TypeId) -> Result<u32, Error>;
    fn field_index(&self, field: &FieldId) -> Result<u32, Error>;
    fn method_index(&self, method: &MethodId) -> Result<u32, Error>;
}

/// Resolves every index to 0
///
/// Instruction sizes never depend on table indices, so this is enough to measure instructions
/// before the tables are frozen.
pub struct PlaceholderIndices;

impl IndexResolver for PlaceholderIndices {
    fn string_index(&self, _string: &str) -> Result<u32, Error> {
        Ok(0)
    }
    fn type_index(&self, _typ: &TypeId) -> Result<u32, Error> {
        Ok(0)
    }
    fn field_index(&self, _field: &FieldId) -> Result<u32, Error> {
        Ok(0)
    }
    fn method_index(&self, _method: &MethodId) -> Result<u32, Error> {
        Ok(0)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl Comparison {
    fn opcode_offset(self) -> u8 {
        match self {
            Comparison::Eq => 0,
            Comparison::Ne => 1,
            Comparison::Lt => 2,
            Comparison::Ge => 3,
            Comparison::Gt => 4,
            Comparison::Le => 5,
        }
    }

    /// Only `==` and `!=` apply to references
    pub fn applies_to_references(self) -> bool {
        matches!(self, Comparison::Eq | Comparison::Ne)
    }
}

impl Not for Comparison {
    type Output = Comparison;

    fn not(self) -> Comparison {
        match self {
            Comparison::Eq => Comparison::Ne,
            Comparison::Ne => Comparison::Eq,
            Comparison::Lt => Comparison::Ge,
            Comparison::Ge => Comparison::Lt,
            Comparison::Gt => Comparison::Le,
            Comparison::Le => Comparison::Gt,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    And,
    Or,
    Xor,
    ShiftLeft,
    ShiftRight,
    UnsignedShiftRight,
}

impl BinaryOp {
    /// Bitwise operators only exist for `int` and `long`
    pub fn is_bitwise(self) -> bool {
        !matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Subtract
                | BinaryOp::Multiply
                | BinaryOp::Divide
                | BinaryOp::Remainder
        )
    }

    /// The shift amount is always an `int`, even when shifting a `long`
    pub fn is_shift(self) -> bool {
        matches!(
            self,
            BinaryOp::ShiftLeft | BinaryOp::ShiftRight | BinaryOp::UnsignedShiftRight
        )
    }

    fn opcode_offset(self) -> u8 {
        match self {
            BinaryOp::Add => 0,
            BinaryOp::Subtract => 1,
            BinaryOp::Multiply => 2,
            BinaryOp::Divide => 3,
            BinaryOp::Remainder => 4,
            BinaryOp::And => 5,
            BinaryOp::Or => 6,
            BinaryOp::Xor => 7,
            BinaryOp::ShiftLeft => 8,
            BinaryOp::ShiftRight => 9,
            BinaryOp::UnsignedShiftRight => 10,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum UnaryOp {
    Negate,
    /// Bitwise complement (`int` and `long` only)
    Not,
}

/// Types that arithmetic operates on
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum NumericType {
    Int,
    Long,
    Float,
    Double,
}

impl NumericType {
    /// Arithmetic type of values in a local of this type
    pub fn of(typ: &TypeId) -> Option<NumericType> {
        match typ.category() {
            TypeCategory::IntLike => Some(NumericType::Int),
            TypeCategory::Float => Some(NumericType::Float),
            TypeCategory::Wide if *typ == TypeId::LONG => Some(NumericType::Long),
            TypeCategory::Wide => Some(NumericType::Double),
            _ => None,
        }
    }
}

/// Which flavour of `move`, `move-result`, and `return` applies to a type
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum MoveKind {
    Single,
    Wide,
    Object,
}

impl MoveKind {
    pub fn of(typ: &TypeId) -> Option<MoveKind> {
        match typ.category() {
            TypeCategory::IntLike | TypeCategory::Float => Some(MoveKind::Single),
            TypeCategory::Wide => Some(MoveKind::Wide),
            TypeCategory::Reference | TypeCategory::Array | TypeCategory::Null => {
                Some(MoveKind::Object)
            }
            TypeCategory::Void => None,
        }
    }

    fn opcode_offset(self) -> u8 {
        match self {
            MoveKind::Single => 0,
            MoveKind::Wide => 1,
            MoveKind::Object => 2,
        }
    }
}

/// Which flavour of array and field accesses applies to a type
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum AccessKind {
    Single,
    Wide,
    Object,
    Boolean,
    Byte,
    Char,
    Short,
}

impl AccessKind {
    pub fn of(typ: &TypeId) -> Option<AccessKind> {
        let kind = match typ {
            TypeId::Base(BaseType::Boolean) => AccessKind::Boolean,
            TypeId::Base(BaseType::Byte) => AccessKind::Byte,
            TypeId::Base(BaseType::Char) => AccessKind::Char,
            TypeId::Base(BaseType::Short) => AccessKind::Short,
            TypeId::Base(BaseType::Int) | TypeId::Base(BaseType::Float) => AccessKind::Single,
            TypeId::Base(BaseType::Long) | TypeId::Base(BaseType::Double) => AccessKind::Wide,
            TypeId::Object(_) | TypeId::Array(_) => AccessKind::Object,
            TypeId::Void | TypeId::Null => return None,
        };
        Some(kind)
    }

    fn opcode_offset(self) -> u8 {
        match self {
            AccessKind::Single => 0,
            AccessKind::Wide => 1,
            AccessKind::Object => 2,
            AccessKind::Boolean => 3,
            AccessKind::Byte => 4,
            AccessKind::Char => 5,
            AccessKind::Short => 6,
        }
    }
}

/// Primitive conversions, in opcode order
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Conversion {
    IntToLong,
    IntToFloat,
    IntToDouble,
    LongToInt,
    LongToFloat,
    LongToDouble,
    FloatToInt,
    FloatToLong,
    FloatToDouble,
    DoubleToInt,
    DoubleToLong,
    DoubleToFloat,
    IntToByte,
    IntToChar,
    IntToShort,
}

impl Conversion {
    /// Conversion from a local of one type into a local of another
    pub fn between(from: &TypeId, to: &TypeId) -> Option<Conversion> {
        use NumericType::*;
        let from = NumericType::of(from)?;
        let conversion = match (from, to) {
            (Int, TypeId::Base(BaseType::Byte)) => Conversion::IntToByte,
            (Int, TypeId::Base(BaseType::Char)) => Conversion::IntToChar,
            (Int, TypeId::Base(BaseType::Short)) => Conversion::IntToShort,
            _ => match (from, NumericType::of(to)?) {
                (Int, Long) => Conversion::IntToLong,
                (Int, Float) => Conversion::IntToFloat,
                (Int, Double) => Conversion::IntToDouble,
                (Long, Int) => Conversion::LongToInt,
                (Long, Float) => Conversion::LongToFloat,
                (Long, Double) => Conversion::LongToDouble,
                (Float, Int) => Conversion::FloatToInt,
                (Float, Long) => Conversion::FloatToLong,
                (Float, Double) => Conversion::FloatToDouble,
                (Double, Int) => Conversion::DoubleToInt,
                (Double, Long) => Conversion::DoubleToLong,
                (Double, Float) => Conversion::DoubleToFloat,
                _ => return None,
            },
        };
        Some(conversion)
    }

    fn opcode(self) -> u8 {
        0x81 + self as u8
    }
}

/// Comparisons producing -1, 0, or 1 into an `int`
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum CompareKind {
    /// `cmpl-float`: NaN compares as less
    FloatLessBias,
    /// `cmpg-float`: NaN compares as greater
    FloatGreaterBias,
    DoubleLessBias,
    DoubleGreaterBias,
    Long,
}

impl CompareKind {
    fn opcode(self) -> u8 {
        match self {
            CompareKind::FloatLessBias => 0x2d,
            CompareKind::FloatGreaterBias => 0x2e,
            CompareKind::DoubleLessBias => 0x2f,
            CompareKind::DoubleGreaterBias => 0x30,
            CompareKind::Long => 0x31,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum InvokeType {
    Virtual,
    Super,
    Direct,
    Static,
    Interface,
}

impl InvokeType {
    fn opcode_offset(self) -> u8 {
        match self {
            InvokeType::Virtual => 0,
            InvokeType::Super => 1,
            InvokeType::Direct => 2,
            InvokeType::Static => 3,
            InvokeType::Interface => 4,
        }
    }

    /// Does the call pass a receiver before the declared parameters?
    pub fn has_receiver(self) -> bool {
        self != InvokeType::Static
    }
}

/// Argument to an invoke (a wide argument takes a register pair)
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct InvokeArgument<R> {
    pub register: R,
    pub wide: bool,
}

/// Straight-line instructions (anything that doesn't reference a label)
///
/// Registers are abstract in `R`: while a body is under construction they are locals, and after
/// allocation they are register numbers. Other operands stay symbolic until the whole unit is
/// encoded, since table indices aren't known before then.
#[derive(Clone, PartialEq, Debug)]
pub enum Instruction<R> {
    Move {
        kind: MoveKind,
        dest: R,
        src: R,
    },
    MoveResult {
        kind: MoveKind,
        dest: R,
    },
    MoveException(R),
    ReturnVoid,
    Return {
        kind: MoveKind,
        src: R,
    },
    Const {
        dest: R,
        value: i32,
    },
    ConstWide {
        dest: R,
        value: i64,
    },
    ConstString {
        dest: R,
        string: String,
    },
    ConstClass {
        dest: R,
        class: TypeId,
    },
    CheckCast {
        reg: R,
        class: TypeId,
    },
    InstanceOf {
        dest: R,
        src: R,
        class: TypeId,
    },
    ArrayLength {
        dest: R,
        array: R,
    },
    NewInstance {
        dest: R,
        class: TypeId,
    },
    NewArray {
        dest: R,
        length: R,
        array_type: TypeId,
    },
    Throw(R),
    Compare {
        kind: CompareKind,
        dest: R,
        first: R,
        second: R,
    },
    ArrayGet {
        kind: AccessKind,
        dest: R,
        array: R,
        index: R,
    },
    ArrayPut {
        kind: AccessKind,
        src: R,
        array: R,
        index: R,
    },
    InstanceGet {
        kind: AccessKind,
        dest: R,
        object: R,
        field: FieldId,
    },
    InstancePut {
        kind: AccessKind,
        src: R,
        object: R,
        field: FieldId,
    },
    StaticGet {
        kind: AccessKind,
        dest: R,
        field: FieldId,
    },
    StaticPut {
        kind: AccessKind,
        src: R,
        field: FieldId,
    },
    Invoke {
        kind: InvokeType,
        method: MethodId,
        args: Vec<InvokeArgument<R>>,
    },
    Unary {
        op: UnaryOp,
        typ: NumericType,
        dest: R,
        src: R,
    },
    Convert {
        conversion: Conversion,
        dest: R,
        src: R,
    },
    Binary {
        op: BinaryOp,
        typ: NumericType,
        dest: R,
        first: R,
        second: R,
    },
}

/// Instructions that reference a label
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum BranchInstruction<R, L> {
    Goto(GotoForm, L),
    If(Comparison, R, R, L),
    IfZero(Comparison, R, L),
}

impl<R> Instruction<R> {
    /// Does control never continue to the next instruction?
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::ReturnVoid | Instruction::Return { .. } | Instruction::Throw(_)
        )
    }

    /// Rewrite all register operands
    pub fn map_registers<R2, E>(
        self,
        mut f: impl FnMut(R) -> Result<R2, E>,
    ) -> Result<Instruction<R2>, E> {
        use Instruction::*;
        let mapped = match self {
            Move { kind, dest, src } => Move {
                kind,
                dest: f(dest)?,
                src: f(src)?,
            },
            MoveResult { kind, dest } => MoveResult {
                kind,
                dest: f(dest)?,
            },
            MoveException(dest) => MoveException(f(dest)?),
            ReturnVoid => ReturnVoid,
            Return { kind, src } => Return { kind, src: f(src)? },
            Const { dest, value } => Const {
                dest: f(dest)?,
                value,
            },
            ConstWide { dest, value } => ConstWide {
                dest: f(dest)?,
                value,
            },
            ConstString { dest, string } => ConstString {
                dest: f(dest)?,
                string,
            },
            ConstClass { dest, class } => ConstClass {
                dest: f(dest)?,
                class,
            },
            CheckCast { reg, class } => CheckCast { reg: f(reg)?, class },
            InstanceOf { dest, src, class } => InstanceOf {
                dest: f(dest)?,
                src: f(src)?,
                class,
            },
            ArrayLength { dest, array } => ArrayLength {
                dest: f(dest)?,
                array: f(array)?,
            },
            NewInstance { dest, class } => NewInstance {
                dest: f(dest)?,
                class,
            },
            NewArray {
                dest,
                length,
                array_type,
            } => NewArray {
                dest: f(dest)?,
                length: f(length)?,
                array_type,
            },
            Throw(src) => Throw(f(src)?),
            Compare {
                kind,
                dest,
                first,
                second,
            } => Compare {
                kind,
                dest: f(dest)?,
                first: f(first)?,
                second: f(second)?,
            },
            ArrayGet {
                kind,
                dest,
                array,
                index,
            } => ArrayGet {
                kind,
                dest: f(dest)?,
                array: f(array)?,
                index: f(index)?,
            },
            ArrayPut {
                kind,
                src,
                array,
                index,
            } => ArrayPut {
                kind,
                src: f(src)?,
                array: f(array)?,
                index: f(index)?,
            },
            InstanceGet {
                kind,
                dest,
                object,
                field,
            } => InstanceGet {
                kind,
                dest: f(dest)?,
                object: f(object)?,
                field,
            },
            InstancePut {
                kind,
                src,
                object,
                field,
            } => InstancePut {
                kind,
                src: f(src)?,
                object: f(object)?,
                field,
            },
            StaticGet { kind, dest, field } => StaticGet {
                kind,
                dest: f(dest)?,
                field,
            },
            StaticPut { kind, src, field } => StaticPut {
                kind,
                src: f(src)?,
                field,
            },
            Invoke { kind, method, args } => {
                let mut mapped_args = Vec::with_capacity(args.len());
                for arg in args {
                    mapped_args.push(InvokeArgument {
                        register: f(arg.register)?,
                        wide: arg.wide,
                    });
                }
                Invoke {
                    kind,
                    method,
                    args: mapped_args,
                }
            }
            Unary { op, typ, dest, src } => Unary {
                op,
                typ,
                dest: f(dest)?,
                src: f(src)?,
            },
            Convert {
                conversion,
                dest,
                src,
            } => Convert {
                conversion,
                dest: f(dest)?,
                src: f(src)?,
            },
            Binary {
                op,
                typ,
                dest,
                first,
                second,
            } => Binary {
                op,
                typ,
                dest: f(dest)?,
                first: f(first)?,
                second: f(second)?,
            },
        };
        Ok(mapped)
    }
}

impl<R, L> BranchInstruction<R, L> {
    pub fn label(&self) -> &L {
        match self {
            BranchInstruction::Goto(_, label) => label,
            BranchInstruction::If(_, _, _, label) => label,
            BranchInstruction::IfZero(_, _, label) => label,
        }
    }

    /// Can control fall through to the next instruction?
    pub fn falls_through(&self) -> bool {
        !matches!(self, BranchInstruction::Goto(..))
    }

    pub fn map_registers<R2, E>(
        self,
        mut f: impl FnMut(R) -> Result<R2, E>,
    ) -> Result<BranchInstruction<R2, L>, E> {
        Ok(match self {
            BranchInstruction::Goto(form, label) => BranchInstruction::Goto(form, label),
            BranchInstruction::If(cmp, reg1, reg2, label) => {
                BranchInstruction::If(cmp, f(reg1)?, f(reg2)?, label)
            }
            BranchInstruction::IfZero(cmp, reg, label) => {
                BranchInstruction::IfZero(cmp, f(reg)?, label)
            }
        })
    }

    pub fn map_label<L2>(self, target: L2) -> BranchInstruction<R, L2> {
        match self {
            BranchInstruction::Goto(form, _) => BranchInstruction::Goto(form, target),
            BranchInstruction::If(cmp, reg1, reg2, _) => {
                BranchInstruction::If(cmp, reg1, reg2, target)
            }
            BranchInstruction::IfZero(cmp, reg, _) => BranchInstruction::IfZero(cmp, reg, target),
        }
    }

    /// Size in code units (doesn't depend on the offset)
    pub fn width(&self) -> usize {
        match self {
            BranchInstruction::Goto(GotoForm::Goto, _) => 1,
            BranchInstruction::Goto(GotoForm::Goto16, _) => 2,
            BranchInstruction::Goto(GotoForm::Goto32, _) => 3,
            BranchInstruction::If(..) | BranchInstruction::IfZero(..) => 2,
        }
    }

    /// Number of bits available for the offset
    pub fn offset_bits(&self) -> u8 {
        match self {
            BranchInstruction::Goto(GotoForm::Goto, _) => 8,
            BranchInstruction::Goto(GotoForm::Goto32, _) => 32,
            _ => 16,
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            BranchInstruction::Goto(GotoForm::Goto, _) => "goto",
            BranchInstruction::Goto(GotoForm::Goto16, _) => "goto/16",
            BranchInstruction::Goto(GotoForm::Goto32, _) => "goto/32",
            BranchInstruction::If(..) => "if-test",
            BranchInstruction::IfZero(..) => "if-testz",
        }
    }
}

/// Check that an offset can be encoded in a branch with `bits` available
///
/// Only `goto/32` may branch to itself.
pub fn offset_fits(offset: isize, bits: u8) -> bool {
    match bits {
        8 => offset != 0 && i8::try_from(offset).is_ok(),
        16 => offset != 0 && i16::try_from(offset).is_ok(),
        _ => i32::try_from(offset).is_ok(),
    }
}

fn nibble(mnemonic: &'static str, register: u16) -> Result<u16, Error> {
    if register < 16 {
        Ok(register)
    } else {
        Err(Error::EncodingOverflow(EncodingOverflow::RegisterOperand {
            mnemonic,
            register,
            bits: 4,
        }))
    }
}

fn byte(mnemonic: &'static str, register: u16) -> Result<u16, Error> {
    if register < 256 {
        Ok(register)
    } else {
        Err(Error::EncodingOverflow(EncodingOverflow::RegisterOperand {
            mnemonic,
            register,
            bits: 8,
        }))
    }
}

fn index16(mnemonic: &'static str, index: u32) -> Result<u16, Error> {
    u16::try_from(index).map_err(|_| {
        Error::EncodingOverflow(EncodingOverflow::Index {
            mnemonic,
            index,
            bits: 16,
        })
    })
}

/// `op` with an 8-bit `AA` operand
fn op_aa(op: u8, aa: u16) -> u16 {
    op as u16 | aa << 8
}

/// `op` with two 4-bit operands, `A` then `B`
fn op_ab(op: u8, a: u16, b: u16) -> u16 {
    op as u16 | a << 8 | b << 12
}

impl Instruction<u16> {
    /// Size in code units
    pub fn width(&self) -> Result<usize, Error> {
        let mut units = vec![];
        self.encode(&PlaceholderIndices, &mut units)?;
        Ok(units.len())
    }

    /// Append the instruction to a stream of code units
    ///
    /// The smallest encoding that fits the registers is chosen (eg. `move` over `move/from16`).
    pub fn encode(&self, indices: &impl IndexResolver, out: &mut Vec<u16>) -> Result<(), Error> {
        use Instruction::*;
        match self {
            Move { kind, dest, src } => {
                let base = 0x01 + 3 * kind.opcode_offset();
                if *dest < 16 && *src < 16 {
                    out.push(op_ab(base, *dest, *src));
                } else if *dest < 256 {
                    out.extend([op_aa(base + 1, *dest), *src]);
                } else {
                    out.extend([base as u16 + 2, *dest, *src]);
                }
            }
            MoveResult { kind, dest } => {
                out.push(op_aa(0x0a + kind.opcode_offset(), byte("move-result", *dest)?));
            }
            MoveException(dest) => out.push(op_aa(0x0d, byte("move-exception", *dest)?)),
            ReturnVoid => out.push(0x0e),
            Return { kind, src } => {
                out.push(op_aa(0x0f + kind.opcode_offset(), byte("return", *src)?));
            }
            Const { dest, value } => {
                let value = *value;
                if (-8..8).contains(&value) && *dest < 16 {
                    out.push(op_ab(0x12, *dest, value as u16 & 0xF));
                } else {
                    let dest = byte("const", *dest)?;
                    if let Ok(short) = i16::try_from(value) {
                        out.extend([op_aa(0x13, dest), short as u16]);
                    } else if value & 0xFFFF == 0 {
                        out.extend([op_aa(0x15, dest), (value >> 16) as u16]);
                    } else {
                        out.extend([op_aa(0x14, dest), value as u16, (value >> 16) as u16]);
                    }
                }
            }
            ConstWide { dest, value } => {
                let value = *value;
                let dest = byte("const-wide", *dest)?;
                if let Ok(short) = i16::try_from(value) {
                    out.extend([op_aa(0x16, dest), short as u16]);
                } else if let Ok(int) = i32::try_from(value) {
                    out.extend([op_aa(0x17, dest), int as u16, (int >> 16) as u16]);
                } else if value & 0xFFFF_FFFF_FFFF == 0 {
                    out.extend([op_aa(0x19, dest), (value >> 48) as u16]);
                } else {
                    out.push(op_aa(0x18, dest));
                    for shift in [0, 16, 32, 48] {
                        out.push((value >> shift) as u16);
                    }
                }
            }
            ConstString { dest, string } => {
                let index = index16("const-string", indices.string_index(string)?)?;
                out.extend([op_aa(0x1a, byte("const-string", *dest)?), index]);
            }
            ConstClass { dest, class } => {
                let index = index16("const-class", indices.type_index(class)?)?;
                out.extend([op_aa(0x1c, byte("const-class", *dest)?), index]);
            }
            CheckCast { reg, class } => {
                let index = index16("check-cast", indices.type_index(class)?)?;
                out.extend([op_aa(0x1f, byte("check-cast", *reg)?), index]);
            }
            InstanceOf { dest, src, class } => {
                let mnemonic = "instance-of";
                let index = index16(mnemonic, indices.type_index(class)?)?;
                let first = op_ab(0x20, nibble(mnemonic, *dest)?, nibble(mnemonic, *src)?);
                out.extend([first, index]);
            }
            ArrayLength { dest, array } => {
                let mnemonic = "array-length";
                out.push(op_ab(0x21, nibble(mnemonic, *dest)?, nibble(mnemonic, *array)?));
            }
            NewInstance { dest, class } => {
                let index = index16("new-instance", indices.type_index(class)?)?;
                out.extend([op_aa(0x22, byte("new-instance", *dest)?), index]);
            }
            NewArray {
                dest,
                length,
                array_type,
            } => {
                let mnemonic = "new-array";
                let index = index16(mnemonic, indices.type_index(array_type)?)?;
                let first = op_ab(0x23, nibble(mnemonic, *dest)?, nibble(mnemonic, *length)?);
                out.extend([first, index]);
            }
            Throw(src) => out.push(op_aa(0x27, byte("throw", *src)?)),
            Compare {
                kind,
                dest,
                first,
                second,
            } => {
                let mnemonic = "cmp";
                out.extend([
                    op_aa(kind.opcode(), byte(mnemonic, *dest)?),
                    byte(mnemonic, *first)? | byte(mnemonic, *second)? << 8,
                ]);
            }
            ArrayGet {
                kind,
                dest,
                array,
                index,
            } => {
                let mnemonic = "aget";
                out.extend([
                    op_aa(0x44 + kind.opcode_offset(), byte(mnemonic, *dest)?),
                    byte(mnemonic, *array)? | byte(mnemonic, *index)? << 8,
                ]);
            }
            ArrayPut {
                kind,
                src,
                array,
                index,
            } => {
                let mnemonic = "aput";
                out.extend([
                    op_aa(0x4b + kind.opcode_offset(), byte(mnemonic, *src)?),
                    byte(mnemonic, *array)? | byte(mnemonic, *index)? << 8,
                ]);
            }
            InstanceGet {
                kind,
                dest,
                object,
                field,
            } => {
                let mnemonic = "iget";
                let index = index16(mnemonic, indices.field_index(field)?)?;
                let op = 0x52 + kind.opcode_offset();
                let first = op_ab(op, nibble(mnemonic, *dest)?, nibble(mnemonic, *object)?);
                out.extend([first, index]);
            }
            InstancePut {
                kind,
                src,
                object,
                field,
            } => {
                let mnemonic = "iput";
                let index = index16(mnemonic, indices.field_index(field)?)?;
                let op = 0x59 + kind.opcode_offset();
                let first = op_ab(op, nibble(mnemonic, *src)?, nibble(mnemonic, *object)?);
                out.extend([first, index]);
            }
            StaticGet { kind, dest, field } => {
                let index = index16("sget", indices.field_index(field)?)?;
                out.extend([op_aa(0x60 + kind.opcode_offset(), byte("sget", *dest)?), index]);
            }
            StaticPut { kind, src, field } => {
                let index = index16("sput", indices.field_index(field)?)?;
                out.extend([op_aa(0x67 + kind.opcode_offset(), byte("sput", *src)?), index]);
            }
            Invoke { kind, method, args } => {
                let index = index16("invoke", indices.method_index(method)?)?;
                let registers: Vec<u16> = args
                    .iter()
                    .flat_map(|arg| {
                        if arg.wide {
                            vec![arg.register, arg.register + 1]
                        } else {
                            vec![arg.register]
                        }
                    })
                    .collect();

                if registers.len() <= 5 && registers.iter().all(|r| *r < 16) {
                    let nibble_at = |i: usize| registers.get(i).copied().unwrap_or(0);
                    let op = 0x6e + kind.opcode_offset();
                    out.extend([
                        op_ab(op, nibble_at(4), registers.len() as u16),
                        index,
                        nibble_at(0) | nibble_at(1) << 4 | nibble_at(2) << 8 | nibble_at(3) << 12,
                    ]);
                } else {
                    let first = registers.first().copied().unwrap_or(0);
                    let contiguous = registers
                        .iter()
                        .enumerate()
                        .all(|(i, r)| *r as usize == first as usize + i);
                    if !contiguous || registers.len() > 255 {
                        return Err(Error::EncodingOverflow(
                            EncodingOverflow::InvokeArguments {
                                method: method.clone(),
                                registers,
                            },
                        ));
                    }
                    let op = 0x74 + kind.opcode_offset();
                    out.extend([op_aa(op, registers.len() as u16), index, first]);
                }
            }
            Unary { op, typ, dest, src } => {
                let opcode = match (op, typ) {
                    (UnaryOp::Negate, NumericType::Int) => 0x7b,
                    (UnaryOp::Not, NumericType::Int) => 0x7c,
                    (UnaryOp::Negate, NumericType::Long) => 0x7d,
                    (UnaryOp::Not, NumericType::Long) => 0x7e,
                    (UnaryOp::Negate, NumericType::Float) => 0x7f,
                    (UnaryOp::Negate, NumericType::Double) => 0x80,
                    (UnaryOp::Not, _) => {
                        return Err(Error::InvalidOperation(format!(
                            "No bitwise complement for {:?}",
                            typ
                        )))
                    }
                };
                out.push(op_ab(opcode, nibble("unop", *dest)?, nibble("unop", *src)?));
            }
            Convert {
                conversion,
                dest,
                src,
            } => {
                let mnemonic = "conversion";
                out.push(op_ab(
                    conversion.opcode(),
                    nibble(mnemonic, *dest)?,
                    nibble(mnemonic, *src)?,
                ));
            }
            Binary {
                op,
                typ,
                dest,
                first,
                second,
            } => {
                let base = match typ {
                    NumericType::Int => 0x90,
                    NumericType::Long => 0x9b,
                    NumericType::Float => 0xa6,
                    NumericType::Double => 0xab,
                };
                let floating = matches!(typ, NumericType::Float | NumericType::Double);
                if floating && op.is_bitwise() {
                    return Err(Error::InvalidOperation(format!(
                        "No {:?} operation for {:?}",
                        op, typ
                    )));
                }
                let mnemonic = "binop";
                out.extend([
                    op_aa(base + op.opcode_offset(), byte(mnemonic, *dest)?),
                    byte(mnemonic, *first)? | byte(mnemonic, *second)? << 8,
                ]);
            }
        }
        Ok(())
    }
}

impl BranchInstruction<u16, i32> {
    /// Append the branch to a stream of code units
    ///
    /// The offset must already have been checked with `offset_fits`.
    pub fn encode(&self, out: &mut Vec<u16>) -> Result<(), Error> {
        match self {
            BranchInstruction::Goto(GotoForm::Goto, offset) => {
                out.push(op_aa(0x28, *offset as i8 as u8 as u16));
            }
            BranchInstruction::Goto(GotoForm::Goto16, offset) => {
                out.extend([0x29, *offset as i16 as u16]);
            }
            BranchInstruction::Goto(GotoForm::Goto32, offset) => {
                out.extend([0x2a, *offset as u16, (*offset >> 16) as u16]);
            }
            BranchInstruction::If(cmp, reg1, reg2, offset) => {
                let mnemonic = "if-test";
                out.extend([
                    op_ab(
                        0x32 + cmp.opcode_offset(),
                        nibble(mnemonic, *reg1)?,
                        nibble(mnemonic, *reg2)?,
                    ),
                    *offset as i16 as u16,
                ]);
            }
            BranchInstruction::IfZero(cmp, reg, offset) => {
                out.extend([
                    op_aa(0x38 + cmp.opcode_offset(), byte("if-testz", *reg)?),
                    *offset as i16 as u16,
                ]);
            }
        }
        Ok(())
    }
}

/// Instruction formats
///
/// See <https://source.android.com/docs/core/runtime/instruction-formats>
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Format {
    F10x,
    F12x,
    F11n,
    F11x,
    F10t,
    F20t,
    F22x,
    F21t,
    F21s,
    F21h,
    F21c,
    F23x,
    F22t,
    F22c,
    F32x,
    F30t,
    F31i,
    F31c,
    F35c,
    F3rc,
    F51l,
}

impl Format {
    /// Size in code units
    pub fn width(self) -> usize {
        use Format::*;
        match self {
            F10x | F12x | F11n | F11x | F10t => 1,
            F20t | F22x | F21t | F21s | F21h | F21c | F23x | F22t | F22c => 2,
            F32x | F30t | F31i | F31c | F35c | F3rc => 3,
            F51l => 5,
        }
    }
}

const MOVE_MNEMONICS: [&str; 9] = [
    "move",
    "move/from16",
    "move/16",
    "move-wide",
    "move-wide/from16",
    "move-wide/16",
    "move-object",
    "move-object/from16",
    "move-object/16",
];
const ACCESS_SUFFIXES: [&str; 7] = ["", "-wide", "-object", "-boolean", "-byte", "-char", "-short"];
const INVOKE_KINDS: [&str; 5] = ["virtual", "super", "direct", "static", "interface"];
const COMPARISONS: [&str; 6] = ["eq", "ne", "lt", "ge", "gt", "le"];
const BINARY_OPS: [&str; 11] = [
    "add", "sub", "mul", "div", "rem", "and", "or", "xor", "shl", "shr", "ushr",
];
const CONVERSIONS: [&str; 15] = [
    "int-to-long",
    "int-to-float",
    "int-to-double",
    "long-to-int",
    "long-to-float",
    "long-to-double",
    "float-to-int",
    "float-to-long",
    "float-to-double",
    "double-to-int",
    "double-to-long",
    "double-to-float",
    "int-to-byte",
    "int-to-char",
    "int-to-short",
];

/// Mnemonic and format of the opcodes this assembler emits
pub fn opcode_info(opcode: u8) -> Option<(String, Format)> {
    use Format::*;
    let info = match opcode {
        0x00 => ("nop".to_owned(), F10x),
        0x01..=0x09 => {
            let idx = (opcode - 0x01) as usize;
            let format = [F12x, F22x, F32x][idx % 3];
            (MOVE_MNEMONICS[idx].to_owned(), format)
        }
        0x0a => ("move-result".to_owned(), F11x),
        0x0b => ("move-result-wide".to_owned(), F11x),
        0x0c => ("move-result-object".to_owned(), F11x),
        0x0d => ("move-exception".to_owned(), F11x),
        0x0e => ("return-void".to_owned(), F10x),
        0x0f => ("return".to_owned(), F11x),
        0x10 => ("return-wide".to_owned(), F11x),
        0x11 => ("return-object".to_owned(), F11x),
        0x12 => ("const/4".to_owned(), F11n),
        0x13 => ("const/16".to_owned(), F21s),
        0x14 => ("const".to_owned(), F31i),
        0x15 => ("const/high16".to_owned(), F21h),
        0x16 => ("const-wide/16".to_owned(), F21s),
        0x17 => ("const-wide/32".to_owned(), F31i),
        0x18 => ("const-wide".to_owned(), F51l),
        0x19 => ("const-wide/high16".to_owned(), F21h),
        0x1a => ("const-string".to_owned(), F21c),
        0x1b => ("const-string/jumbo".to_owned(), F31c),
        0x1c => ("const-class".to_owned(), F21c),
        0x1f => ("check-cast".to_owned(), F21c),
        0x20 => ("instance-of".to_owned(), F22c),
        0x21 => ("array-length".to_owned(), F12x),
        0x22 => ("new-instance".to_owned(), F21c),
        0x23 => ("new-array".to_owned(), F22c),
        0x27 => ("throw".to_owned(), F11x),
        0x28 => ("goto".to_owned(), F10t),
        0x29 => ("goto/16".to_owned(), F20t),
        0x2a => ("goto/32".to_owned(), F30t),
        0x2d => ("cmpl-float".to_owned(), F23x),
        0x2e => ("cmpg-float".to_owned(), F23x),
        0x2f => ("cmpl-double".to_owned(), F23x),
        0x30 => ("cmpg-double".to_owned(), F23x),
        0x31 => ("cmp-long".to_owned(), F23x),
        0x32..=0x37 => (
            format!("if-{}", COMPARISONS[(opcode - 0x32) as usize]),
            F22t,
        ),
        0x38..=0x3d => (
            format!("if-{}z", COMPARISONS[(opcode - 0x38) as usize]),
            F21t,
        ),
        0x44..=0x4a => (
            format!("aget{}", ACCESS_SUFFIXES[(opcode - 0x44) as usize]),
            F23x,
        ),
        0x4b..=0x51 => (
            format!("aput{}", ACCESS_SUFFIXES[(opcode - 0x4b) as usize]),
            F23x,
        ),
        0x52..=0x58 => (
            format!("iget{}", ACCESS_SUFFIXES[(opcode - 0x52) as usize]),
            F22c,
        ),
        0x59..=0x5f => (
            format!("iput{}", ACCESS_SUFFIXES[(opcode - 0x59) as usize]),
            F22c,
        ),
        0x60..=0x66 => (
            format!("sget{}", ACCESS_SUFFIXES[(opcode - 0x60) as usize]),
            F21c,
        ),
        0x67..=0x6d => (
            format!("sput{}", ACCESS_SUFFIXES[(opcode - 0x67) as usize]),
            F21c,
        ),
        0x6e..=0x72 => (
            format!("invoke-{}", INVOKE_KINDS[(opcode - 0x6e) as usize]),
            F35c,
        ),
        0x74..=0x78 => (
            format!("invoke-{}/range", INVOKE_KINDS[(opcode - 0x74) as usize]),
            F3rc,
        ),
        0x7b => ("neg-int".to_owned(), F12x),
        0x7c => ("not-int".to_owned(), F12x),
        0x7d => ("neg-long".to_owned(), F12x),
        0x7e => ("not-long".to_owned(), F12x),
        0x7f => ("neg-float".to_owned(), F12x),
        0x80 => ("neg-double".to_owned(), F12x),
        0x81..=0x8f => (CONVERSIONS[(opcode - 0x81) as usize].to_owned(), F12x),
        0x90..=0xaf => {
            let idx = (opcode - 0x90) as usize;
            let (typ, op) = match idx {
                0..=10 => ("int", idx),
                11..=21 => ("long", idx - 11),
                22..=26 => ("float", idx - 22),
                _ => ("double", idx - 27),
            };
            (format!("{}-{}", BINARY_OPS[op], typ), F23x)
        }
        _ => return None,
    };
    Some(info)
}

/// One instruction decoded from a stream of code units
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DecodedInstruction {
    /// Address in code units
    pub address: usize,
    pub opcode: u8,
    pub mnemonic: String,
    pub registers: Vec<u16>,
    pub literal: Option<i64>,
    pub index: Option<u32>,
    pub branch_offset: Option<i32>,
}

impl DecodedInstruction {
    pub fn is_branch(&self) -> bool {
        self.branch_offset.is_some()
    }

    pub fn is_invoke(&self) -> bool {
        matches!(self.opcode, 0x6e..=0x72 | 0x74..=0x78)
    }
}

impl fmt::Display for DecodedInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}: {}", self.address, self.mnemonic)?;
        let mut sep = " ";
        for register in &self.registers {
            write!(f, "{}v{}", sep, register)?;
            sep = ", ";
        }
        if let Some(literal) = self.literal {
            write!(f, "{}#{}", sep, literal)?;
        }
        if let Some(index) = self.index {
            write!(f, "{}@{}", sep, index)?;
        }
        if let Some(offset) = self.branch_offset {
            write!(f, "{}{:+}", sep, offset)?;
        }
        Ok(())
    }
}

/// Decode a stream of code units back into instructions (for listings and tests)
pub fn decode(units: &[u16]) -> Result<Vec<DecodedInstruction>, Error> {
    use Format::*;

    let mut decoded = vec![];
    let mut address = 0;
    while address < units.len() {
        let first = units[address];
        let opcode = (first & 0xFF) as u8;
        let (mnemonic, format) = opcode_info(opcode).ok_or_else(|| {
            Error::InvalidOperation(format!("Unknown opcode {:#04x} at {}", opcode, address))
        })?;
        let width = format.width();
        if address + width > units.len() {
            return Err(Error::InvalidOperation(format!(
                "Truncated {} at {}",
                mnemonic, address
            )));
        }
        let unit = |i: usize| units[address + i];
        let aa = first >> 8;
        let a = (first >> 8) & 0xF;
        let b = first >> 12;
        let wide_unit = |i: usize| unit(i) as u32 | (unit(i + 1) as u32) << 16;

        let mut insn = DecodedInstruction {
            address,
            opcode,
            mnemonic,
            registers: vec![],
            literal: None,
            index: None,
            branch_offset: None,
        };
        match format {
            F10x => (),
            F12x => insn.registers = vec![a, b],
            F11n => {
                insn.registers = vec![a];
                insn.literal = Some(((b as i8) << 4 >> 4) as i64);
            }
            F11x => insn.registers = vec![aa],
            F10t => insn.branch_offset = Some(aa as u8 as i8 as i32),
            F20t => insn.branch_offset = Some(unit(1) as i16 as i32),
            F22x => insn.registers = vec![aa, unit(1)],
            F21t => {
                insn.registers = vec![aa];
                insn.branch_offset = Some(unit(1) as i16 as i32);
            }
            F21s => {
                insn.registers = vec![aa];
                insn.literal = Some(unit(1) as i16 as i64);
            }
            F21h => {
                insn.registers = vec![aa];
                let shift = if opcode == 0x19 { 48 } else { 16 };
                insn.literal = Some(((unit(1) as i16 as i64) << shift) as i64);
            }
            F21c => {
                insn.registers = vec![aa];
                insn.index = Some(unit(1) as u32);
            }
            F23x => insn.registers = vec![aa, unit(1) & 0xFF, unit(1) >> 8],
            F22t => {
                insn.registers = vec![a, b];
                insn.branch_offset = Some(unit(1) as i16 as i32);
            }
            F22c => {
                insn.registers = vec![a, b];
                insn.index = Some(unit(1) as u32);
            }
            F32x => insn.registers = vec![unit(1), unit(2)],
            F30t => insn.branch_offset = Some(wide_unit(1) as i32),
            F31i => {
                insn.registers = vec![aa];
                insn.literal = Some(wide_unit(1) as i32 as i64);
            }
            F31c => {
                insn.registers = vec![aa];
                insn.index = Some(wide_unit(1));
            }
            F35c => {
                let count = b as usize;
                let packed = unit(2);
                let all = [
                    packed & 0xF,
                    (packed >> 4) & 0xF,
                    (packed >> 8) & 0xF,
                    packed >> 12,
                    a,
                ];
                insn.registers = all[..count.min(5)].to_vec();
                insn.index = Some(unit(1) as u32);
            }
            F3rc => {
                let first_reg = unit(2);
                insn.registers = (0..aa).map(|i| first_reg + i).collect();
                insn.index = Some(unit(1) as u32);
            }
            F51l => {
                insn.registers = vec![aa];
                let value = (0..4).fold(0u64, |acc, i| acc | (unit(1 + i) as u64) << (16 * i));
                insn.literal = Some(value as i64);
            }
        }
        decoded.push(insn);
        address += width;
    }
    Ok(decoded)
}
