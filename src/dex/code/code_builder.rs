use super::{
    resolve, AccessKind, BinaryOp, BodyId, BodyLabelGenerator, BranchInstruction, CatchHandler,
    Code, CompareKind, Comparison, Conversion, Instruction, InvokeArgument, InvokeType, Label,
    LabelGenerator, Local, MoveKind, NumericType, RegisterAllocator, Registers, StreamItem,
    TryItem, UnaryOp,
};
use crate::dex::verifier::{is_compatible, Frame};
use crate::dex::{
    ConstantValue, Error, FieldId, GotoForm, MethodAccessFlags, MethodId, Settings, TypeCategory,
    TypeId, UnresolvedReference,
};
use crate::util::Width;

/// How `NaN` operands compare in `cmpl`/`cmpg`
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum NanBias {
    /// `NaN` compares as less than everything (`cmpl-*`)
    Less,
    /// `NaN` compares as greater than everything (`cmpg-*`)
    Greater,
}

/// Builds the body of one method, top to bottom
///
/// ### Locals and registers
///
/// The receiver (for instance methods) and parameters are created along with the builder, and
/// further locals can be created with [`CodeBuilder::new_local`] up until the first instruction.
/// At that point the frame is laid out once and for all (see [`RegisterAllocator`]).
///
/// ### Tracking types
///
/// The builder keeps the type of the value in every local at the current point (a frame), and
/// every label gets the merge of the frames of all the edges into it: branches, fall through, and
/// instructions that may throw inside a try range. A local that gets incompatible types on
/// different edges is reported as soon as the second edge is added.
///
/// ### Tracking reachability
///
/// After an unconditional transfer of control (`goto`, `return`, `throw`), nothing can be emitted
/// until a label is marked, and that label must already have been branched to (otherwise there
/// would be no way to know its frame, and the code would be dead anyway).
pub struct CodeBuilder {
    body: BodyId,
    method: MethodId,
    access_flags: MethodAccessFlags,
    register_limit: usize,
    goto_form: GotoForm,
    emit_positions: bool,

    locals: RegisterAllocator,
    receiver: Option<Local>,
    parameters: Vec<Local>,

    /// Set on the first instruction (or label mark), after which locals are fixed
    registers: Option<Registers>,

    label_generator: BodyLabelGenerator,
    labels: Vec<LabelState>,

    /// Instructions so far, with registers still symbolic
    stream: Vec<StreamItem<Local>>,

    /// Frame at the current point (`None` if the current point is unreachable)
    current: Option<Frame>,

    /// Active catch clauses, outermost first
    catches: Vec<(TypeId, Label)>,
    open_range: Option<(usize, Vec<(TypeId, Label)>)>,
    try_ranges: Vec<TryRange>,
    next_code_address: usize,

    /// The last thing in the stream is the mark of a catch handler
    at_handler_start: bool,

    outs_size: usize,
}

#[derive(Default)]
struct LabelState {
    frame: Option<Frame>,
    marked: bool,
    handler: bool,
}

/// Code between two code addresses covered by the same catch clauses
struct TryRange {
    start: usize,
    end: usize,
    catches: Vec<(TypeId, Label)>,
}

impl CodeBuilder {
    /// Create a builder for a new method
    pub fn new(method: MethodId, access_flags: MethodAccessFlags, settings: &Settings) -> Self {
        let body = BodyId::fresh();
        let mut locals = RegisterAllocator::new(body);

        let receiver = if access_flags.contains(MethodAccessFlags::STATIC) {
            None
        } else {
            Some(locals.declare(method.class.clone(), true))
        };
        let parameters = method
            .prototype
            .parameters
            .iter()
            .map(|typ| locals.declare(typ.clone(), true))
            .collect();

        CodeBuilder {
            body,
            method,
            access_flags,
            register_limit: settings.register_limit(),
            goto_form: settings.goto_form,
            emit_positions: settings.emit_debug_info,
            locals,
            receiver,
            parameters,
            registers: None,
            label_generator: BodyLabelGenerator::new(body),
            labels: vec![],
            stream: vec![],
            current: None,
            catches: vec![],
            open_range: None,
            try_ranges: vec![],
            next_code_address: 0,
            at_handler_start: false,
            outs_size: 0,
        }
    }

    pub fn method(&self) -> &MethodId {
        &self.method
    }

    /// Receiver of an instance method
    pub fn this_local(&self) -> Result<Local, Error> {
        self.receiver.ok_or_else(|| {
            Error::InvalidOperation(format!("Static method {} has no 'this'", self.method))
        })
    }

    /// Local holding the parameter at this position
    pub fn parameter(&self, index: usize) -> Result<Local, Error> {
        self.parameters.get(index).copied().ok_or_else(|| {
            Error::InvalidOperation(format!(
                "Method {} has no parameter {}",
                self.method, index
            ))
        })
    }

    /// Create a new local of the given type
    ///
    /// Locals cannot be added once any instructions have been emitted.
    pub fn new_local(&mut self, typ: TypeId) -> Result<Local, Error> {
        if self.registers.is_some() {
            return Err(Error::LocalsAfterInstructions(self.method.clone()));
        }
        if matches!(typ, TypeId::Void | TypeId::Null) {
            return Err(Error::InvalidOperation(format!(
                "Local cannot have type {}",
                typ
            )));
        }
        Ok(self.locals.declare(typ, false))
    }

    /// Generate a fresh label
    pub fn new_label(&mut self) -> Label {
        self.labels.push(LabelState::default());
        self.label_generator.fresh_label()
    }

    /// Declared type of a local
    pub fn local_type(&self, local: Local) -> Result<&TypeId, Error> {
        self.locals
            .local_type(local)
            .ok_or_else(|| Error::ForeignHandle(format!("{:?}", local)))
    }

    /// Fix the register frame and enter the method
    fn start(&mut self) -> Result<(), Error> {
        if self.registers.is_some() {
            return Ok(());
        }
        let registers = self.locals.allocate(self.register_limit)?;

        let mut entry = Frame::unassigned(self.locals.len());
        for local in self.receiver.iter().chain(self.parameters.iter()) {
            let typ = self.local_type(*local)?.clone();
            entry.set(local.index, typ);
        }
        self.current = Some(entry);
        self.registers = Some(registers);
        Ok(())
    }

    fn check_label(&self, label: Label) -> Result<(), Error> {
        if label.body == self.body && label.index < self.labels.len() {
            Ok(())
        } else {
            Err(Error::ForeignHandle(format!("{:?}", label)))
        }
    }

    /// Frame at the current point, which must be reachable
    fn current_frame(&mut self) -> Result<&Frame, Error> {
        self.start()?;
        match self.current {
            Some(ref frame) => Ok(frame),
            None => Err(Error::UnreachableCode(self.method.clone())),
        }
    }

    /// Type of the value currently in a local
    fn read(&mut self, local: Local) -> Result<TypeId, Error> {
        let _ = self.local_type(local)?;
        self.current_frame()?
            .get(local.index)
            .cloned()
            .ok_or(Error::UnresolvedReference(UnresolvedReference::Local(local)))
    }

    /// Merge a frame into the frame expected at a label
    fn flow_to(&mut self, label: Label, frame: &Frame) -> Result<(), Error> {
        let body = self.body;
        let state = &mut self.labels[label.index];
        match state.frame {
            None => state.frame = Some(frame.clone()),
            Some(ref mut existing) => {
                existing
                    .merge_from(frame)
                    .map_err(|conflict| Error::TypeMergeFailure {
                        label,
                        local: Local {
                            body,
                            index: conflict.local,
                        },
                        first: conflict.first,
                        second: conflict.second,
                    })?;
            }
        }
        Ok(())
    }

    /// Send the current frame to every active catch handler
    fn flow_to_handlers(&mut self) -> Result<(), Error> {
        if let Some(frame) = self.current.clone() {
            let handlers: Vec<Label> = self.catches.iter().map(|(_, label)| *label).collect();
            for handler in handlers {
                self.flow_to(handler, &frame)?;
            }
        }
        Ok(())
    }

    /// Push a straight-line instruction, then record what it writes
    fn emit(
        &mut self,
        insn: Instruction<Local>,
        writes: Option<(Local, TypeId)>,
    ) -> Result<(), Error> {
        let _ = self.current_frame()?;
        if can_throw(&insn) {
            self.flow_to_handlers()?;
        }

        let terminates = insn.is_terminator();
        self.stream.push(StreamItem::Instruction(insn));
        self.at_handler_start = false;

        if let (Some(frame), Some((local, typ))) = (self.current.as_mut(), writes) {
            frame.set(local.index, typ);
        }
        if terminates {
            self.current = None;
        }
        Ok(())
    }

    fn emit_branch(&mut self, branch: BranchInstruction<Local, Label>) -> Result<(), Error> {
        let label = *branch.label();
        self.check_label(label)?;
        let frame = self.current_frame()?.clone();
        self.flow_to(label, &frame)?;

        let falls_through = branch.falls_through();
        self.stream.push(StreamItem::Branch(branch));
        self.at_handler_start = false;
        if !falls_through {
            self.current = None;
        }
        Ok(())
    }

    /// Bind a label to the current point
    ///
    /// If control can fall into the label, that edge is merged with the branches to it seen so
    /// far.
    pub fn mark_label(&mut self, label: Label) -> Result<(), Error> {
        self.check_label(label)?;
        self.start()?;
        if self.labels[label.index].marked {
            return Err(Error::LabelAlreadyMarked(label));
        }

        if let Some(frame) = self.current.clone() {
            self.flow_to(label, &frame)?;
        }

        let state = &mut self.labels[label.index];
        let frame = match state.frame {
            Some(ref frame) => frame.clone(),
            None => return Err(Error::PlacingLabelBeforeReference(label)),
        };
        state.marked = true;
        self.at_handler_start = state.handler;
        self.current = Some(frame);
        self.stream.push(StreamItem::Mark(label));
        Ok(())
    }

    /// Unconditionally jump to a label
    pub fn jump(&mut self, label: Label) -> Result<(), Error> {
        self.emit_branch(BranchInstruction::Goto(self.goto_form, label))
    }

    /// Branch to `label` if `first <cmp> second`
    ///
    /// Both locals must be `int`-like, or both references when comparing for (in)equality.
    pub fn compare_and_branch(
        &mut self,
        cmp: Comparison,
        label: Label,
        first: Local,
        second: Local,
    ) -> Result<(), Error> {
        let first_type = self.read(first)?;
        let second_type = self.read(second)?;
        let both_ints = first_type.is_int_like() && second_type.is_int_like();
        let both_refs = first_type.is_reference() && second_type.is_reference();
        if !(both_ints || both_refs && cmp.applies_to_references()) {
            return Err(Error::InvalidOperation(format!(
                "Cannot compare {} and {} with {:?}",
                first_type, second_type, cmp
            )));
        }
        self.emit_branch(BranchInstruction::If(cmp, first, second, label))
    }

    /// Branch to `label` if `value <cmp> 0` (or `null`, for references)
    pub fn compare_zero_and_branch(
        &mut self,
        cmp: Comparison,
        label: Label,
        value: Local,
    ) -> Result<(), Error> {
        let typ = self.read(value)?;
        if !(typ.is_int_like() || typ.is_reference() && cmp.applies_to_references()) {
            return Err(Error::InvalidOperation(format!(
                "Cannot compare {} against zero with {:?}",
                typ, cmp
            )));
        }
        self.emit_branch(BranchInstruction::IfZero(cmp, value, label))
    }

    /// Store a constant into a local
    pub fn load_constant(&mut self, dest: Local, value: ConstantValue) -> Result<(), Error> {
        let dest_type = self.local_type(dest)?.clone();
        let value_type = value.type_id().ok_or_else(|| {
            Error::InvalidOperation(format!("Cannot load {:?} into a register", value))
        })?;
        expect_type("load-constant", &dest_type, &value_type)?;

        let insn = match value {
            ConstantValue::Boolean(b) => Instruction::Const {
                dest,
                value: b as i32,
            },
            ConstantValue::Byte(b) => Instruction::Const {
                dest,
                value: b as i32,
            },
            ConstantValue::Short(s) => Instruction::Const {
                dest,
                value: s as i32,
            },
            ConstantValue::Char(c) => Instruction::Const {
                dest,
                value: c as i32,
            },
            ConstantValue::Int(i) => Instruction::Const { dest, value: i },
            ConstantValue::Float(f) => Instruction::Const {
                dest,
                value: f.to_bits() as i32,
            },
            ConstantValue::Long(l) => Instruction::ConstWide { dest, value: l },
            ConstantValue::Double(d) => Instruction::ConstWide {
                dest,
                value: d.to_bits() as i64,
            },
            ConstantValue::String(string) => Instruction::ConstString { dest, string },
            ConstantValue::Type(class) => Instruction::ConstClass { dest, class },
            ConstantValue::Null => Instruction::Const { dest, value: 0 },
            other @ (ConstantValue::Enum(_) | ConstantValue::Array(_)) => {
                return Err(Error::InvalidOperation(format!(
                    "Cannot load {:?} into a register",
                    other
                )))
            }
        };

        let written = if value_type == TypeId::Null {
            TypeId::Null
        } else {
            dest_type
        };
        self.emit(insn, Some((dest, written)))
    }

    /// Copy the value of one local into another
    ///
    /// The locals only need to be of the same register kind: the destination takes on the type
    /// of the value moved into it.
    pub fn move_value(&mut self, dest: Local, src: Local) -> Result<(), Error> {
        let dest_type = self.local_type(dest)?.clone();
        let src_type = self.read(src)?;
        let kind = MoveKind::of(&dest_type);
        if kind != MoveKind::of(&src_type) {
            return Err(type_mismatch("move", &dest_type, &src_type));
        }
        let kind = kind.ok_or_else(|| type_mismatch("move", &dest_type, &src_type))?;
        self.emit(Instruction::Move { kind, dest, src }, Some((dest, src_type)))
    }

    /// `dest = <op> src`
    pub fn unary_op(&mut self, op: UnaryOp, dest: Local, src: Local) -> Result<(), Error> {
        let dest_type = self.local_type(dest)?.clone();
        let src_type = self.read(src)?;
        let typ = numeric("unary operand", &dest_type)?;
        if NumericType::of(&src_type) != Some(typ) {
            return Err(type_mismatch("unary operand", &dest_type, &src_type));
        }
        if op == UnaryOp::Not && !matches!(typ, NumericType::Int | NumericType::Long) {
            return Err(Error::InvalidOperation(format!(
                "No bitwise complement for {}",
                dest_type
            )));
        }
        self.emit(Instruction::Unary { op, typ, dest, src }, Some((dest, dest_type)))
    }

    /// `dest = first <op> second`
    pub fn binary_op(
        &mut self,
        op: BinaryOp,
        dest: Local,
        first: Local,
        second: Local,
    ) -> Result<(), Error> {
        let dest_type = self.local_type(dest)?.clone();
        let first_type = self.read(first)?;
        let second_type = self.read(second)?;
        let typ = numeric("binary operand", &dest_type)?;

        if NumericType::of(&first_type) != Some(typ) {
            return Err(type_mismatch("binary operand", &dest_type, &first_type));
        }
        let second_expected = if op.is_shift() {
            NumericType::Int
        } else {
            typ
        };
        if NumericType::of(&second_type) != Some(second_expected) {
            return Err(type_mismatch("binary operand", &dest_type, &second_type));
        }
        if op.is_bitwise() && matches!(typ, NumericType::Float | NumericType::Double) {
            return Err(Error::InvalidOperation(format!(
                "No {:?} operation for {}",
                op, dest_type
            )));
        }

        let insn = Instruction::Binary {
            op,
            typ,
            dest,
            first,
            second,
        };
        self.emit(insn, Some((dest, dest_type)))
    }

    /// Convert a primitive value from the type of `src` into the type of `dest`
    pub fn numeric_cast(&mut self, dest: Local, src: Local) -> Result<(), Error> {
        let dest_type = self.local_type(dest)?.clone();
        let src_type = self.read(src)?;
        let conversion = Conversion::between(&src_type, &dest_type).ok_or_else(|| {
            Error::InvalidOperation(format!("No conversion from {} to {}", src_type, dest_type))
        })?;
        let insn = Instruction::Convert {
            conversion,
            dest,
            src,
        };
        self.emit(insn, Some((dest, dest_type)))
    }

    /// `dest = compare(first, second)` for two `long`s
    pub fn compare_long(&mut self, dest: Local, first: Local, second: Local) -> Result<(), Error> {
        self.compare(dest, first, second, CompareKind::Long, &TypeId::LONG)
    }

    /// `dest = compare(first, second)` for two `float`s or two `double`s
    pub fn compare_floating(
        &mut self,
        bias: NanBias,
        dest: Local,
        first: Local,
        second: Local,
    ) -> Result<(), Error> {
        let operand_type = self.local_type(first)?.clone();
        let kind = match (operand_type.category(), bias) {
            (TypeCategory::Float, NanBias::Less) => CompareKind::FloatLessBias,
            (TypeCategory::Float, NanBias::Greater) => CompareKind::FloatGreaterBias,
            (TypeCategory::Wide, NanBias::Less) if operand_type == TypeId::DOUBLE => {
                CompareKind::DoubleLessBias
            }
            (TypeCategory::Wide, NanBias::Greater) if operand_type == TypeId::DOUBLE => {
                CompareKind::DoubleGreaterBias
            }
            _ => return Err(type_mismatch("cmp operand", &TypeId::DOUBLE, &operand_type)),
        };
        self.compare(dest, first, second, kind, &operand_type)
    }

    fn compare(
        &mut self,
        dest: Local,
        first: Local,
        second: Local,
        kind: CompareKind,
        operand_type: &TypeId,
    ) -> Result<(), Error> {
        let dest_type = self.local_type(dest)?.clone();
        let first_type = self.read(first)?;
        let second_type = self.read(second)?;
        expect_type("cmp result", &dest_type, &TypeId::INT)?;
        expect_type("cmp operand", operand_type, &first_type)?;
        expect_type("cmp operand", operand_type, &second_type)?;
        let insn = Instruction::Compare {
            kind,
            dest,
            first,
            second,
        };
        self.emit(insn, Some((dest, dest_type)))
    }

    /// Read an instance field
    pub fn instance_get(
        &mut self,
        field: &FieldId,
        dest: Local,
        object: Local,
    ) -> Result<(), Error> {
        let dest_type = self.local_type(dest)?.clone();
        let object_type = self.read(object)?;
        expect_type("iget instance", &field.class, &object_type)?;
        expect_type("iget", &dest_type, &field.field_type)?;
        let insn = Instruction::InstanceGet {
            kind: access_kind(&field.field_type)?,
            dest,
            object,
            field: field.clone(),
        };
        self.emit(insn, Some((dest, dest_type)))
    }

    /// Write an instance field
    pub fn instance_put(
        &mut self,
        field: &FieldId,
        object: Local,
        src: Local,
    ) -> Result<(), Error> {
        let object_type = self.read(object)?;
        let src_type = self.read(src)?;
        expect_type("iput instance", &field.class, &object_type)?;
        expect_type("iput", &field.field_type, &src_type)?;
        let insn = Instruction::InstancePut {
            kind: access_kind(&field.field_type)?,
            src,
            object,
            field: field.clone(),
        };
        self.emit(insn, None)
    }

    /// Read a static field
    pub fn static_get(&mut self, field: &FieldId, dest: Local) -> Result<(), Error> {
        let dest_type = self.local_type(dest)?.clone();
        expect_type("sget", &dest_type, &field.field_type)?;
        let insn = Instruction::StaticGet {
            kind: access_kind(&field.field_type)?,
            dest,
            field: field.clone(),
        };
        self.emit(insn, Some((dest, dest_type)))
    }

    /// Write a static field
    pub fn static_put(&mut self, field: &FieldId, src: Local) -> Result<(), Error> {
        let src_type = self.read(src)?;
        expect_type("sput", &field.field_type, &src_type)?;
        let insn = Instruction::StaticPut {
            kind: access_kind(&field.field_type)?,
            src,
            field: field.clone(),
        };
        self.emit(insn, None)
    }

    /// Call a method, optionally moving the return value into `result`
    ///
    /// For anything but static calls, the first argument is the receiver.
    pub fn invoke(
        &mut self,
        kind: InvokeType,
        method: &MethodId,
        result: Option<Local>,
        args: &[Local],
    ) -> Result<(), Error> {
        let receiver = kind.has_receiver() as usize;
        let expected = method.prototype.parameters.len() + receiver;
        if args.len() != expected {
            return Err(Error::InvalidOperation(format!(
                "Call to {} expects {} arguments but got {}",
                method,
                expected,
                args.len()
            )));
        }

        let mut invoke_args = Vec::with_capacity(args.len());
        let mut words = 0;
        for (i, arg) in args.iter().enumerate() {
            let arg_type = self.read(*arg)?;
            let param_type = if i < receiver {
                &method.class
            } else {
                &method.prototype.parameters[i - receiver]
            };
            expect_type("argument", param_type, &arg_type)?;
            words += param_type.width();
            invoke_args.push(InvokeArgument {
                register: *arg,
                wide: param_type.width() == 2,
            });
        }

        let return_type = &method.prototype.return_type;
        if let Some(result) = result {
            let result_type = self.local_type(result)?;
            if *return_type == TypeId::Void {
                return Err(type_mismatch("result", result_type, return_type));
            }
            expect_type("result", result_type, return_type)?;
        }

        self.outs_size = self.outs_size.max(words);
        let insn = Instruction::Invoke {
            kind,
            method: method.clone(),
            args: invoke_args,
        };
        self.emit(insn, None)?;

        if let Some(result) = result {
            let result_type = self.local_type(result)?.clone();
            let kind = MoveKind::of(return_type)
                .ok_or_else(|| type_mismatch("result", &result_type, return_type))?;
            self.emit(
                Instruction::MoveResult { kind, dest: result },
                Some((result, result_type)),
            )?;
        }
        Ok(())
    }

    pub fn invoke_static(
        &mut self,
        method: &MethodId,
        result: Option<Local>,
        args: &[Local],
    ) -> Result<(), Error> {
        self.invoke(InvokeType::Static, method, result, args)
    }

    pub fn invoke_virtual(
        &mut self,
        method: &MethodId,
        result: Option<Local>,
        instance: Local,
        args: &[Local],
    ) -> Result<(), Error> {
        self.invoke_with_receiver(InvokeType::Virtual, method, result, instance, args)
    }

    pub fn invoke_direct(
        &mut self,
        method: &MethodId,
        result: Option<Local>,
        instance: Local,
        args: &[Local],
    ) -> Result<(), Error> {
        self.invoke_with_receiver(InvokeType::Direct, method, result, instance, args)
    }

    pub fn invoke_super(
        &mut self,
        method: &MethodId,
        result: Option<Local>,
        instance: Local,
        args: &[Local],
    ) -> Result<(), Error> {
        self.invoke_with_receiver(InvokeType::Super, method, result, instance, args)
    }

    pub fn invoke_interface(
        &mut self,
        method: &MethodId,
        result: Option<Local>,
        instance: Local,
        args: &[Local],
    ) -> Result<(), Error> {
        self.invoke_with_receiver(InvokeType::Interface, method, result, instance, args)
    }

    fn invoke_with_receiver(
        &mut self,
        kind: InvokeType,
        method: &MethodId,
        result: Option<Local>,
        instance: Local,
        args: &[Local],
    ) -> Result<(), Error> {
        let mut all_args = Vec::with_capacity(args.len() + 1);
        all_args.push(instance);
        all_args.extend_from_slice(args);
        self.invoke(kind, method, result, &all_args)
    }

    /// Allocate an object and call its constructor
    pub fn new_instance(
        &mut self,
        dest: Local,
        constructor: &MethodId,
        args: &[Local],
    ) -> Result<(), Error> {
        if !constructor.is_constructor() {
            return Err(Error::InvalidOperation(format!(
                "{} is not a constructor",
                constructor
            )));
        }
        let dest_type = self.local_type(dest)?.clone();
        if dest_type != constructor.class {
            return Err(type_mismatch("new-instance", &dest_type, &constructor.class));
        }
        let insn = Instruction::NewInstance {
            dest,
            class: dest_type.clone(),
        };
        self.emit(insn, Some((dest, dest_type)))?;
        self.invoke_direct(constructor, None, dest, args)
    }

    /// `dest = src instanceof typ`
    pub fn instance_of(&mut self, dest: Local, src: Local, typ: &TypeId) -> Result<(), Error> {
        let dest_type = self.local_type(dest)?.clone();
        let src_type = self.read(src)?;
        expect_type("instance-of result", &dest_type, &TypeId::BOOLEAN)?;
        expect_type("instance-of operand", &TypeId::OBJECT, &src_type)?;
        reference("instance-of", typ)?;
        let insn = Instruction::InstanceOf {
            dest,
            src,
            class: typ.clone(),
        };
        self.emit(insn, Some((dest, dest_type)))
    }

    /// `dest = (T) src` where `T` is the type of `dest`
    pub fn type_cast(&mut self, dest: Local, src: Local) -> Result<(), Error> {
        let dest_type = self.local_type(dest)?.clone();
        let src_type = self.read(src)?;
        reference("check-cast", &dest_type)?;
        expect_type("check-cast operand", &TypeId::OBJECT, &src_type)?;
        if dest != src {
            let insn = Instruction::Move {
                kind: MoveKind::Object,
                dest,
                src,
            };
            self.emit(insn, Some((dest, src_type)))?;
        }
        let insn = Instruction::CheckCast {
            reg: dest,
            class: dest_type.clone(),
        };
        self.emit(insn, Some((dest, dest_type)))
    }

    /// `dest = array.length`
    pub fn array_length(&mut self, dest: Local, array: Local) -> Result<(), Error> {
        let dest_type = self.local_type(dest)?.clone();
        let array_type = self.read(array)?;
        expect_type("array-length result", &dest_type, &TypeId::INT)?;
        if array_type.category() != TypeCategory::Array {
            return Err(type_mismatch(
                "array-length operand",
                &TypeId::OBJECT.array_of(),
                &array_type,
            ));
        }
        self.emit(Instruction::ArrayLength { dest, array }, Some((dest, dest_type)))
    }

    /// `dest = new T[length]` where `T[]` is the type of `dest`
    pub fn new_array(&mut self, dest: Local, length: Local) -> Result<(), Error> {
        let dest_type = self.local_type(dest)?.clone();
        let length_type = self.read(length)?;
        expect_type("new-array length", &TypeId::INT, &length_type)?;
        if dest_type.category() != TypeCategory::Array {
            return Err(Error::InvalidOperation(format!(
                "new-array into non-array local of type {}",
                dest_type
            )));
        }
        let insn = Instruction::NewArray {
            dest,
            length,
            array_type: dest_type.clone(),
        };
        self.emit(insn, Some((dest, dest_type)))
    }

    /// `dest = array[index]`
    pub fn array_get(&mut self, dest: Local, array: Local, index: Local) -> Result<(), Error> {
        let dest_type = self.local_type(dest)?.clone();
        let component = self.array_component(array, index)?;
        expect_type("aget", &dest_type, &component)?;
        let insn = Instruction::ArrayGet {
            kind: access_kind(&component)?,
            dest,
            array,
            index,
        };
        self.emit(insn, Some((dest, dest_type)))
    }

    /// `array[index] = src`
    pub fn array_put(&mut self, array: Local, index: Local, src: Local) -> Result<(), Error> {
        let component = self.array_component(array, index)?;
        let src_type = self.read(src)?;
        expect_type("aput", &component, &src_type)?;
        let insn = Instruction::ArrayPut {
            kind: access_kind(&component)?,
            src,
            array,
            index,
        };
        self.emit(insn, None)
    }

    fn array_component(&mut self, array: Local, index: Local) -> Result<TypeId, Error> {
        let declared = self.local_type(array)?.clone();
        let _ = self.read(array)?;
        let index_type = self.read(index)?;
        expect_type("array index", &TypeId::INT, &index_type)?;
        declared.component().cloned().ok_or_else(|| {
            type_mismatch("array operand", &TypeId::OBJECT.array_of(), &declared)
        })
    }

    /// Return from a `void` method
    pub fn return_void(&mut self) -> Result<(), Error> {
        let return_type = &self.method.prototype.return_type;
        if *return_type != TypeId::Void {
            return Err(type_mismatch("return", return_type, &TypeId::Void));
        }
        self.emit(Instruction::ReturnVoid, None)
    }

    /// Return the value of a local
    pub fn return_value(&mut self, src: Local) -> Result<(), Error> {
        let src_type = self.read(src)?;
        let return_type = self.method.prototype.return_type.clone();
        if return_type == TypeId::Void {
            return Err(type_mismatch("return", &return_type, &src_type));
        }
        expect_type("return", &return_type, &src_type)?;
        let kind = MoveKind::of(&return_type)
            .ok_or_else(|| type_mismatch("return", &return_type, &src_type))?;
        self.emit(Instruction::Return { kind, src }, None)
    }

    /// Throw the exception in a local
    pub fn throw_value(&mut self, src: Local) -> Result<(), Error> {
        let src_type = self.read(src)?;
        expect_type("throw", &TypeId::THROWABLE, &src_type)?;
        self.emit(Instruction::Throw(src), None)
    }

    /// Send exceptions of type `exception` thrown from here on to `handler`
    ///
    /// Catch clauses nest: the most recently added clause is tried first.
    pub fn add_catch_clause(&mut self, exception: TypeId, handler: Label) -> Result<(), Error> {
        self.check_label(handler)?;
        reference("catch clause", &exception)?;
        if self.catches.iter().any(|(typ, _)| *typ == exception) {
            return Err(Error::InvalidOperation(format!(
                "Catch clause for {} is already active",
                exception
            )));
        }
        self.start()?;
        self.catches.push((exception, handler));
        self.labels[handler.index].handler = true;
        self.flow_to_handlers()?;
        self.split_try_range();
        Ok(())
    }

    /// Stop sending exceptions of type `exception` to their handler, returning that handler
    pub fn remove_catch_clause(&mut self, exception: &TypeId) -> Result<Label, Error> {
        let position = self
            .catches
            .iter()
            .position(|(typ, _)| typ == exception)
            .ok_or_else(|| {
                Error::InvalidOperation(format!("No active catch clause for {}", exception))
            })?;
        let (_, handler) = self.catches.remove(position);
        self.split_try_range();
        Ok(handler)
    }

    /// Move the caught exception into a local (must start a catch handler)
    pub fn move_exception(&mut self, dest: Local) -> Result<(), Error> {
        let dest_type = self.local_type(dest)?.clone();
        reference("move-exception", &dest_type)?;
        if !self.at_handler_start {
            return Err(Error::InvalidOperation(
                "move-exception must be the first instruction of a catch handler".to_owned(),
            ));
        }
        self.emit(Instruction::MoveException(dest), Some((dest, dest_type)))
    }

    /// Attribute the following instructions to a source line
    pub fn set_line(&mut self, line: u32) {
        if self.emit_positions {
            self.stream.push(StreamItem::Position(line));
        }
    }

    /// Close the current try range (if any) and open one for the active catch clauses
    fn split_try_range(&mut self) {
        let address = self.next_code_address;
        self.next_code_address += 1;
        self.stream.push(StreamItem::CodeAddress(address));

        if let Some((start, catches)) = self.open_range.take() {
            self.try_ranges.push(TryRange {
                start,
                end: address,
                catches,
            });
        }
        if !self.catches.is_empty() {
            self.open_range = Some((address, self.catches.clone()));
        }
    }

    /// Turn the builder into the method code
    ///
    /// This is where registers are substituted in and branch offsets get resolved.
    pub fn result(mut self) -> Result<Code, Error> {
        if self.registers.is_none() || self.current.is_some() {
            return Err(Error::MethodCodeNotFinished(self.method));
        }
        if self.open_range.is_some() {
            self.catches.clear();
            self.split_try_range();
        }

        let registers = match self.registers {
            Some(registers) => registers,
            None => return Err(Error::MethodCodeNotFinished(self.method)),
        };
        let items = self
            .stream
            .into_iter()
            .map(|item| item.map_registers(|local| Ok::<u16, Error>(registers.register(local))))
            .collect::<Result<Vec<_>, Error>>()?;
        let resolved = resolve(items)?;

        let mut tries = vec![];
        for range in self.try_ranges {
            let start = resolved.code_addresses[&range.start];
            let end = resolved.code_addresses[&range.end];
            if start == end {
                continue;
            }
            let mut handlers = vec![];
            for (exception, label) in range.catches.into_iter().rev() {
                let address = *resolved.label_addresses.get(&label).ok_or(
                    Error::UnresolvedReference(UnresolvedReference::Label(label)),
                )?;
                handlers.push(CatchHandler { exception, address });
            }
            tries.push(TryItem {
                start,
                end,
                handlers,
            });
        }

        let code = Code {
            method: self.method,
            access_flags: self.access_flags,
            registers_size: registers.frame_size(),
            ins_size: registers.ins_size(),
            outs_size: self.outs_size as u16,
            instructions: resolved.instructions,
            tries,
            positions: resolved.positions,
        };
        log::trace!(
            "built {} ({} registers, {} code units, {} tries)",
            code.method,
            code.registers_size,
            code.insns_size(),
            code.tries.len()
        );
        Ok(code)
    }
}

/// Can this instruction transfer control to a catch handler?
fn can_throw(insn: &Instruction<Local>) -> bool {
    match insn {
        Instruction::Move { .. }
        | Instruction::MoveResult { .. }
        | Instruction::MoveException(_)
        | Instruction::ReturnVoid
        | Instruction::Return { .. }
        | Instruction::Const { .. }
        | Instruction::ConstWide { .. }
        | Instruction::Unary { .. }
        | Instruction::Convert { .. } => false,
        Instruction::Binary { op, typ, .. } => {
            matches!(op, BinaryOp::Divide | BinaryOp::Remainder)
                && matches!(typ, NumericType::Int | NumericType::Long)
        }
        _ => true,
    }
}

fn type_mismatch(context: &str, expected: &TypeId, found: &TypeId) -> Error {
    Error::TypeMismatch {
        context: context.to_owned(),
        expected: expected.clone(),
        found: found.clone(),
    }
}

/// Check that a value of type `found` can be used where `expected` is declared
fn expect_type(context: &str, expected: &TypeId, found: &TypeId) -> Result<(), Error> {
    if is_compatible(expected, found) {
        Ok(())
    } else {
        Err(type_mismatch(context, expected, found))
    }
}

fn numeric(context: &str, typ: &TypeId) -> Result<NumericType, Error> {
    NumericType::of(typ).ok_or_else(|| type_mismatch(context, &TypeId::INT, typ))
}

fn reference(context: &str, typ: &TypeId) -> Result<(), Error> {
    match typ.category() {
        TypeCategory::Reference | TypeCategory::Array => Ok(()),
        _ => Err(type_mismatch(context, &TypeId::OBJECT, typ)),
    }
}

fn access_kind(typ: &TypeId) -> Result<AccessKind, Error> {
    AccessKind::of(typ).ok_or_else(|| type_mismatch("access", &TypeId::OBJECT, typ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dex::code::{decode, ResolvedInstruction};
    use crate::dex::EncodingOverflow;

    fn static_method(name: &str, ret: TypeId, params: Vec<TypeId>) -> MethodId {
        MethodId::new(TypeId::class("com/example/Test").unwrap(), name, ret, params).unwrap()
    }

    fn builder(ret: TypeId, params: Vec<TypeId>) -> CodeBuilder {
        CodeBuilder::new(
            static_method("test", ret, params),
            MethodAccessFlags::STATIC | MethodAccessFlags::PUBLIC,
            &Settings::default(),
        )
    }

    fn mnemonics(code: &Code) -> Vec<String> {
        decode(&code.placeholder_units().unwrap())
            .unwrap()
            .into_iter()
            .map(|insn| insn.mnemonic)
            .collect()
    }

    #[test]
    fn counting_loop() {
        // int test(int n) { int i = 0; while (i < n) { i = i + 1; } return i; }
        let mut code = builder(TypeId::INT, vec![TypeId::INT]);
        let n = code.parameter(0).unwrap();
        let i = code.new_local(TypeId::INT).unwrap();
        let one = code.new_local(TypeId::INT).unwrap();
        let top = code.new_label();
        let done = code.new_label();

        code.load_constant(i, ConstantValue::Int(0)).unwrap();
        code.load_constant(one, ConstantValue::Int(1)).unwrap();
        code.mark_label(top).unwrap();
        code.compare_and_branch(Comparison::Ge, done, i, n).unwrap();
        code.binary_op(BinaryOp::Add, i, i, one).unwrap();
        code.jump(top).unwrap();
        code.mark_label(done).unwrap();
        code.return_value(i).unwrap();

        let code = code.result().unwrap();
        assert_eq!(code.registers_size, 3);
        assert_eq!(code.ins_size, 1);
        assert_eq!(
            mnemonics(&code),
            vec!["const/4", "const/4", "if-ge", "add-int", "goto/16", "return"]
        );

        let decoded = decode(&code.placeholder_units().unwrap()).unwrap();
        let branch = &decoded[2];
        let back = &decoded[4];
        assert_eq!(branch.branch_offset, Some(8 - 2));
        assert_eq!(back.address, 6);
        assert_eq!(back.branch_offset, Some(-4));
    }

    #[test]
    fn merge_failure_at_label() {
        // a float local gets the bits of an int on one path and a float on the other
        let mut code = builder(TypeId::VOID, vec![TypeId::INT]);
        let flag = code.parameter(0).unwrap();
        let x = code.new_local(TypeId::FLOAT).unwrap();
        let y = code.new_local(TypeId::INT).unwrap();
        let join = code.new_label();

        code.load_constant(x, ConstantValue::Float(1.5)).unwrap();
        code.load_constant(y, ConstantValue::Int(2)).unwrap();
        code.compare_zero_and_branch(Comparison::Eq, join, flag).unwrap();
        code.move_value(x, y).unwrap();
        match code.mark_label(join) {
            Err(Error::TypeMergeFailure {
                label,
                local,
                first,
                second,
            }) => {
                assert_eq!(label, join);
                assert_eq!(local, x);
                assert_eq!(first, TypeId::FLOAT);
                assert_eq!(second, TypeId::INT);
            }
            other => panic!("expected merge failure, got {:?}", other),
        }
    }

    #[test]
    fn null_merges_with_reference() {
        let mut code = builder(TypeId::STRING, vec![TypeId::INT]);
        let flag = code.parameter(0).unwrap();
        let s = code.new_local(TypeId::STRING).unwrap();
        let join = code.new_label();

        code.load_constant(s, ConstantValue::Null).unwrap();
        code.compare_zero_and_branch(Comparison::Eq, join, flag).unwrap();
        code.load_constant(s, ConstantValue::String("hi".to_owned()))
            .unwrap();
        code.mark_label(join).unwrap();
        code.return_value(s).unwrap();
        assert!(code.result().is_ok());
    }

    #[test]
    fn unassigned_on_one_path() {
        let mut code = builder(TypeId::INT, vec![TypeId::INT]);
        let flag = code.parameter(0).unwrap();
        let x = code.new_local(TypeId::INT).unwrap();
        let join = code.new_label();

        code.compare_zero_and_branch(Comparison::Eq, join, flag).unwrap();
        code.load_constant(x, ConstantValue::Int(4)).unwrap();
        code.mark_label(join).unwrap();
        assert!(matches!(
            code.return_value(x),
            Err(Error::UnresolvedReference(UnresolvedReference::Local(local))) if local == x
        ));
    }

    #[test]
    fn usage_errors() {
        let mut code = builder(TypeId::VOID, vec![]);
        let x = code.new_local(TypeId::INT).unwrap();
        code.load_constant(x, ConstantValue::Int(1)).unwrap();
        assert!(matches!(
            code.new_local(TypeId::INT),
            Err(Error::LocalsAfterInstructions(_))
        ));
        assert!(matches!(
            code.load_constant(x, ConstantValue::Long(1)),
            Err(Error::TypeMismatch { .. })
        ));
        code.return_void().unwrap();
        assert!(matches!(
            code.load_constant(x, ConstantValue::Int(1)),
            Err(Error::UnreachableCode(_))
        ));

        let dead = code.new_label();
        assert!(matches!(
            code.mark_label(dead),
            Err(Error::PlacingLabelBeforeReference(_))
        ));

        let mut other = builder(TypeId::VOID, vec![]);
        let foreign = other.new_label();
        assert!(matches!(code.jump(foreign), Err(Error::ForeignHandle(_))));
    }

    #[test]
    fn unfinished_code() {
        let mut code = builder(TypeId::VOID, vec![]);
        let x = code.new_local(TypeId::INT).unwrap();
        code.load_constant(x, ConstantValue::Int(1)).unwrap();
        assert!(matches!(
            code.result(),
            Err(Error::MethodCodeNotFinished(_))
        ));

        assert!(matches!(
            builder(TypeId::VOID, vec![]).result(),
            Err(Error::MethodCodeNotFinished(_))
        ));
    }

    #[test]
    fn branch_to_unmarked_label() {
        let mut code = builder(TypeId::VOID, vec![TypeId::INT]);
        let flag = code.parameter(0).unwrap();
        let never = code.new_label();
        code.compare_zero_and_branch(Comparison::Ne, never, flag).unwrap();
        code.return_void().unwrap();
        assert!(matches!(
            code.result(),
            Err(Error::UnresolvedReference(UnresolvedReference::Label(label))) if label == never
        ));
    }

    #[test]
    fn register_capacity() {
        let settings = Settings {
            max_registers: 3,
            ..Settings::default()
        };
        let parameters = vec![TypeId::INT, TypeId::INT, TypeId::LONG];
        let method = static_method("wide", TypeId::VOID, parameters);
        let mut code = CodeBuilder::new(method, MethodAccessFlags::STATIC, &settings);
        assert!(matches!(
            code.return_void(),
            Err(Error::EncodingOverflow(EncodingOverflow::WideLocalAtLastSlot { slot: 2, .. }))
        ));
    }

    #[test]
    fn try_catch() {
        let thrower = static_method("thrower", TypeId::VOID, vec![]);
        let exception = TypeId::class("java/lang/IllegalStateException").unwrap();

        let mut code = builder(TypeId::INT, vec![]);
        let result = code.new_local(TypeId::INT).unwrap();
        let caught = code.new_local(exception.clone()).unwrap();
        let handler = code.new_label();

        code.load_constant(result, ConstantValue::Int(1)).unwrap();
        code.add_catch_clause(exception.clone(), handler).unwrap();
        code.invoke_static(&thrower, None, &[]).unwrap();
        assert_eq!(code.remove_catch_clause(&exception).unwrap(), handler);
        code.return_value(result).unwrap();

        code.mark_label(handler).unwrap();
        code.move_exception(caught).unwrap();
        code.load_constant(result, ConstantValue::Int(2)).unwrap();
        code.return_value(result).unwrap();

        let code = code.result().unwrap();
        assert_eq!(code.tries.len(), 1);
        let try_item = &code.tries[0];
        assert_eq!(try_item.start.0, 1);
        assert_eq!(try_item.end.0, 4);
        assert_eq!(try_item.handlers.len(), 1);
        assert_eq!(try_item.handlers[0].exception, exception);
        assert_eq!(try_item.handlers[0].address.0, 5);
        assert_eq!(
            mnemonics(&code),
            vec![
                "const/4",
                "invoke-static",
                "return",
                "move-exception",
                "const/4",
                "return"
            ]
        );
    }

    #[test]
    fn move_exception_outside_handler() {
        let mut code = builder(TypeId::VOID, vec![]);
        let caught = code.new_local(TypeId::THROWABLE).unwrap();
        assert!(matches!(
            code.move_exception(caught),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn invoke_result_types() {
        let callee = static_method("callee", TypeId::LONG, vec![TypeId::INT]);
        let mut code = builder(TypeId::VOID, vec![TypeId::INT]);
        let arg = code.parameter(0).unwrap();
        let wrong = code.new_local(TypeId::DOUBLE).unwrap();
        let right = code.new_local(TypeId::LONG).unwrap();

        assert!(matches!(
            code.invoke_static(&callee, Some(wrong), &[arg]),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(matches!(
            code.invoke_static(&callee, None, &[]),
            Err(Error::InvalidOperation(_))
        ));
        code.invoke_static(&callee, Some(right), &[arg]).unwrap();
        code.return_void().unwrap();

        let code = code.result().unwrap();
        assert_eq!(code.outs_size, 1);
        assert_eq!(
            mnemonics(&code),
            vec!["invoke-static", "move-result-wide", "return-void"]
        );
        assert!(matches!(
            code.instructions.get_index(0).map(|(_, insn)| insn),
            Some(ResolvedInstruction::Plain {
                insn: Instruction::Invoke { .. },
                width: 3
            })
        ));
    }

    #[test]
    fn objects_and_arrays() {
        let builder_type = TypeId::class("java/lang/StringBuilder").unwrap();
        let constructor =
            MethodId::new(builder_type.clone(), "<init>", TypeId::VOID, vec![]).unwrap();

        let mut code = builder(TypeId::OBJECT, vec![TypeId::INT]);
        let n = code.parameter(0).unwrap();
        let fresh = code.new_local(builder_type.clone()).unwrap();
        let array = code.new_local(TypeId::OBJECT.array_of()).unwrap();
        let zero = code.new_local(TypeId::INT).unwrap();
        let element = code.new_local(TypeId::OBJECT).unwrap();
        let length = code.new_local(TypeId::INT).unwrap();
        let matches = code.new_local(TypeId::BOOLEAN).unwrap();
        let narrowed = code.new_local(builder_type.clone()).unwrap();
        let wide = code.new_local(TypeId::LONG).unwrap();
        let half = code.new_local(TypeId::FLOAT).unwrap();
        let ordering = code.new_local(TypeId::INT).unwrap();

        code.new_instance(fresh, &constructor, &[]).unwrap();
        code.new_array(array, n).unwrap();
        code.load_constant(zero, ConstantValue::Int(0)).unwrap();
        code.array_put(array, zero, fresh).unwrap();
        code.array_get(element, array, zero).unwrap();
        code.array_length(length, array).unwrap();
        code.instance_of(matches, element, &builder_type).unwrap();
        code.type_cast(narrowed, element).unwrap();
        assert_eq!(code.local_type(narrowed).unwrap(), &builder_type);
        code.numeric_cast(wide, length).unwrap();
        code.load_constant(half, ConstantValue::Float(0.5)).unwrap();
        code.compare_floating(NanBias::Less, ordering, half, half)
            .unwrap();

        // arrays only index with ints, and only arrays have a length
        assert!(matches!(
            code.array_get(element, array, wide),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(matches!(
            code.array_length(length, element),
            Err(Error::TypeMismatch { .. })
        ));
        code.return_value(narrowed).unwrap();

        let code = code.result().unwrap();
        let mnemonics = mnemonics(&code);
        for expected in [
            "new-instance",
            "invoke-direct",
            "new-array",
            "aput-object",
            "aget-object",
            "array-length",
            "instance-of",
            "check-cast",
            "int-to-long",
            "cmpl-float",
            "return-object",
        ] {
            assert!(
                mnemonics.iter().any(|m| m == expected),
                "missing {} in {:?}",
                expected,
                mnemonics
            );
        }
        assert_eq!(code.outs_size, 1);
    }

    #[test]
    fn throw_ends_the_block() {
        let mut code = builder(TypeId::VOID, vec![]);
        let error = code.new_local(TypeId::THROWABLE).unwrap();
        let number = code.new_local(TypeId::INT).unwrap();
        code.load_constant(error, ConstantValue::Null).unwrap();
        assert!(matches!(
            code.throw_value(number),
            Err(Error::UnresolvedReference(UnresolvedReference::Local(_)))
        ));
        code.throw_value(error).unwrap();
        assert!(matches!(
            code.return_void(),
            Err(Error::UnreachableCode(_))
        ));
        assert_eq!(mnemonics(&code.result().unwrap()), vec!["const/4", "throw"]);
    }
}
