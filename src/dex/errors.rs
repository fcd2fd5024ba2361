use super::{ConstantValue, FieldId, Label, Local, MethodId, TypeId};
use std::fmt::{Display, Formatter, Result as FmtResult};

#[derive(Debug)]
pub enum Error {
    /// A table holds more distinct entries than can be addressed
    StructuralLimitExceeded {
        kind: TableKind,
        count: usize,
        limit: usize,
    },

    /// Something was used but never defined or declared
    UnresolvedReference(UnresolvedReference),

    /// A computed operand does not fit the field reserved for it
    EncodingOverflow(EncodingOverflow),

    /// Two control flow edges reaching `label` disagree on the type of `local` in a way that
    /// cannot be reconciled
    TypeMergeFailure {
        label: Label,
        local: Local,
        first: TypeId,
        second: TypeId,
    },

    /// Annotation declared for one class is being attached to a member of another
    AnnotationTargetMismatch {
        annotation_owner: TypeId,
        target: String,
        target_owner: TypeId,
    },

    /// Annotation element values (arrays, types) which cannot be encoded yet
    UnsupportedValueShape(ConstantValue),

    /// Class, field, or method has already been declared
    AlreadyDeclared(String),

    /// Locals can only be created before the first instruction is emitted
    LocalsAfterInstructions(MethodId),

    /// An instruction was emitted where control cannot reach (eg. right after a `return`)
    UnreachableCode(MethodId),

    LabelAlreadyMarked(Label),

    /// A label is marked, but it can't be reached: there is no fall through into it and no
    /// branch to it has been emitted yet
    PlacingLabelBeforeReference(Label),

    /// Local or label from one method body was used in another
    ForeignHandle(String),

    /// Value of one type used where another is required
    TypeMismatch {
        context: String,
        expected: TypeId,
        found: TypeId,
    },

    /// Operation which doesn't make sense for its operands (eg. `xor` on `float`)
    InvalidOperation(String),

    /// Method body can still fall off its end
    MethodCodeNotFinished(MethodId),

    /// Annotation targets a different kind of element (eg. a field annotation on a method)
    AnnotationElementKind {
        annotation_type: TypeId,
        target: String,
    },

    /// Same annotation type attached twice to one element
    DuplicateAnnotation {
        annotation_type: TypeId,
        target: String,
    },

    /// Static value is only allowed on static fields and must match the field type
    InvalidStaticValue(FieldId),

    InvalidDescriptor(String),

    IoError(std::io::Error),
}

/// Tables with a 16-bit index
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum TableKind {
    Types,
    Prototypes,
    Fields,
    Methods,
}

#[derive(Debug)]
pub enum UnresolvedReference {
    /// Label branched to (or used as a catch handler) but never marked
    Label(Label),

    /// Local read before it was assigned on some path
    Local(Local),

    /// Class was never declared in this unit
    Type(TypeId),

    /// Field was never declared in its class
    Field(FieldId),

    /// Method was never declared in its class
    Method(MethodId),

    /// Concrete method declared, but never given code
    MissingCode(MethodId),

    /// Entry missing from frozen tables (indicates a bug in collecting references)
    TableEntry(String),
}

#[derive(Debug)]
pub enum EncodingOverflow {
    /// Signed branch offset does not fit its instruction
    BranchOffset {
        label: Label,
        offset: isize,
        bits: u8,
    },

    /// Locals need more registers than the frame has
    RegisterCapacity {
        local: Local,
        needed: usize,
        capacity: usize,
    },

    /// A wide local would start in the last register of the frame
    WideLocalAtLastSlot { local: Local, slot: usize },

    /// Register number does not fit the operand field of an instruction
    RegisterOperand {
        mnemonic: &'static str,
        register: u16,
        bits: u8,
    },

    /// Invoke arguments that fit neither 5 nibbles nor a contiguous register range
    InvokeArguments { method: MethodId, registers: Vec<u16> },

    /// Table index does not fit the operand field of an instruction
    Index {
        mnemonic: &'static str,
        index: u32,
        bits: u8,
    },
}

impl Display for TableKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            TableKind::Types => "types",
            TableKind::Prototypes => "prototypes",
            TableKind::Fields => "fields",
            TableKind::Methods => "methods",
        };
        f.write_str(name)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Error::StructuralLimitExceeded { kind, count, limit } => {
                write!(f, "Too many {}: {}; max is {}", kind, count, limit)
            }
            Error::UnresolvedReference(unresolved) => match unresolved {
                UnresolvedReference::Label(label) => {
                    write!(f, "Label {:?} is referenced but never marked", label)
                }
                UnresolvedReference::Local(local) => {
                    write!(f, "Local {:?} is read before it is assigned", local)
                }
                UnresolvedReference::Type(typ) => write!(f, "Undeclared type {}", typ),
                UnresolvedReference::Field(field) => write!(f, "Undeclared field {}", field),
                UnresolvedReference::Method(method) => write!(f, "Undeclared method {}", method),
                UnresolvedReference::MissingCode(method) => {
                    write!(f, "Method {} has no code", method)
                }
                UnresolvedReference::TableEntry(entry) => {
                    write!(f, "No table entry for {}", entry)
                }
            },
            Error::EncodingOverflow(overflow) => match overflow {
                EncodingOverflow::BranchOffset {
                    label,
                    offset,
                    bits,
                } => write!(
                    f,
                    "Branch offset {} to {:?} does not fit in {} bits",
                    offset, label, bits
                ),
                EncodingOverflow::RegisterCapacity {
                    local,
                    needed,
                    capacity,
                } => write!(
                    f,
                    "Local {:?} needs {} registers; max is {}",
                    local, needed, capacity
                ),
                EncodingOverflow::WideLocalAtLastSlot { local, slot } => write!(
                    f,
                    "Wide local {:?} would start at the last register v{}",
                    local, slot
                ),
                EncodingOverflow::RegisterOperand {
                    mnemonic,
                    register,
                    bits,
                } => write!(
                    f,
                    "Register v{} does not fit in {} bits of {}",
                    register, bits, mnemonic
                ),
                EncodingOverflow::InvokeArguments { method, registers } => write!(
                    f,
                    "Arguments {:?} of call to {} are neither short nor contiguous",
                    registers, method
                ),
                EncodingOverflow::Index {
                    mnemonic,
                    index,
                    bits,
                } => write!(
                    f,
                    "Index {} does not fit in {} bits of {}",
                    index, bits, mnemonic
                ),
            },
            Error::TypeMergeFailure {
                label,
                local,
                first,
                second,
            } => write!(
                f,
                "Local {:?} has types {} and {} at {:?} which cannot be merged",
                local, first, second, label
            ),
            Error::AnnotationTargetMismatch {
                annotation_owner,
                target,
                target_owner,
            } => write!(
                f,
                "Annotation declared for {} cannot be attached to {} in {}",
                annotation_owner, target, target_owner
            ),
            Error::UnsupportedValueShape(value) => {
                write!(f, "Annotation value {:?} is not supported yet", value)
            }
            Error::AlreadyDeclared(what) => write!(f, "{} is already declared", what),
            Error::LocalsAfterInstructions(method) => write!(
                f,
                "Cannot allocate locals after adding instructions to {}",
                method
            ),
            Error::UnreachableCode(method) => write!(
                f,
                "Instruction in {} is unreachable (mark a label first)",
                method
            ),
            Error::LabelAlreadyMarked(label) => write!(f, "Label {:?} is already marked", label),
            Error::PlacingLabelBeforeReference(label) => write!(
                f,
                "Label {:?} cannot be reached: nothing falls through or branches to it yet",
                label
            ),
            Error::ForeignHandle(what) => {
                write!(f, "{} belongs to a different method body", what)
            }
            Error::TypeMismatch {
                context,
                expected,
                found,
            } => write!(f, "{}: expected {} but found {}", context, expected, found),
            Error::InvalidOperation(msg) => f.write_str(msg),
            Error::MethodCodeNotFinished(method) => {
                write!(f, "Code of {} can fall off its end", method)
            }
            Error::AnnotationElementKind {
                annotation_type,
                target,
            } => write!(
                f,
                "Annotation {} does not target the kind of element {} is",
                annotation_type, target
            ),
            Error::DuplicateAnnotation {
                annotation_type,
                target,
            } => write!(
                f,
                "Annotation {} is already attached to {}",
                annotation_type, target
            ),
            Error::InvalidStaticValue(field) => {
                write!(f, "Invalid static value for field {}", field)
            }
            Error::InvalidDescriptor(msg) => write!(f, "Invalid descriptor: {}", msg),
            Error::IoError(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::IoError(err)
    }
}

impl From<UnresolvedReference> for Error {
    fn from(unresolved: UnresolvedReference) -> Error {
        Error::UnresolvedReference(unresolved)
    }
}

impl From<EncodingOverflow> for Error {
    fn from(overflow: EncodingOverflow) -> Error {
        Error::EncodingOverflow(overflow)
    }
}
