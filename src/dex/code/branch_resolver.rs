use super::{offset_fits, BranchInstruction, Instruction, Label};
use crate::dex::{EncodingOverflow, Error, UnresolvedReference};
use crate::util::{Offset, OffsetVec, Width};
use std::collections::HashMap;

/// Item in the instruction stream of a method body, in program order
///
/// Nothing in the stream has an address yet: that is only assigned by [`resolve`], once the
/// whole body exists.
#[derive(Clone, Debug)]
pub enum StreamItem<R> {
    Instruction(Instruction<R>),
    Branch(BranchInstruction<R, Label>),

    /// Zero-size marker whose address gets recorded (used for the bounds of try ranges)
    CodeAddress(usize),

    /// Label is bound to the address of the next instruction
    Mark(Label),

    /// Following instructions come from this source line
    Position(u32),
}

impl<R> StreamItem<R> {
    pub fn map_registers<R2, E>(
        self,
        f: impl FnMut(R) -> Result<R2, E>,
    ) -> Result<StreamItem<R2>, E> {
        Ok(match self {
            StreamItem::Instruction(insn) => StreamItem::Instruction(insn.map_registers(f)?),
            StreamItem::Branch(branch) => StreamItem::Branch(branch.map_registers(f)?),
            StreamItem::CodeAddress(id) => StreamItem::CodeAddress(id),
            StreamItem::Mark(label) => StreamItem::Mark(label),
            StreamItem::Position(line) => StreamItem::Position(line),
        })
    }
}

/// Instruction with registers and branch offsets fixed
#[derive(Clone, PartialEq, Debug)]
pub enum ResolvedInstruction {
    Plain {
        insn: Instruction<u16>,
        width: usize,
    },
    Branch(BranchInstruction<u16, i32>),
}

impl Width for ResolvedInstruction {
    fn width(&self) -> usize {
        match self {
            ResolvedInstruction::Plain { width, .. } => *width,
            ResolvedInstruction::Branch(branch) => branch.width(),
        }
    }
}

/// Output of layout: every instruction has an address (in 16-bit code units)
#[derive(Debug)]
pub struct ResolvedStream {
    pub instructions: OffsetVec<ResolvedInstruction>,
    pub label_addresses: HashMap<Label, Offset>,
    pub code_addresses: HashMap<usize, Offset>,
    pub positions: Vec<(Offset, u32)>,
}

/// Pending rewrite of a branch once its target label has an address
struct Patch {
    entry: usize,
    address: Offset,
    label: Label,
}

/// Lay out the stream and fix branch offsets
///
/// One left to right pass assigns addresses, recording a patch for every branch. Only then are
/// offsets computed, as the signed distance from the branch instruction to its target. Forward
/// and backward branches are handled the same way.
pub fn resolve(items: Vec<StreamItem<u16>>) -> Result<ResolvedStream, Error> {
    let mut instructions = OffsetVec::new();
    let mut label_addresses = HashMap::new();
    let mut code_addresses = HashMap::new();
    let mut positions = vec![];
    let mut patches = vec![];

    for item in items {
        match item {
            StreamItem::Instruction(insn) => {
                let width = insn.width()?;
                instructions.push(ResolvedInstruction::Plain { insn, width });
            }
            StreamItem::Branch(branch) => {
                let label = *branch.label();
                let entry = instructions.len();
                let address = instructions.push(ResolvedInstruction::Branch(branch.map_label(0)));
                patches.push(Patch {
                    entry,
                    address,
                    label,
                });
            }
            StreamItem::CodeAddress(id) => {
                code_addresses.insert(id, instructions.offset_len());
            }
            StreamItem::Mark(label) => {
                label_addresses.insert(label, instructions.offset_len());
            }
            StreamItem::Position(line) => positions.push((instructions.offset_len(), line)),
        }
    }

    for patch in patches {
        let target = *label_addresses
            .get(&patch.label)
            .ok_or(Error::UnresolvedReference(UnresolvedReference::Label(
                patch.label,
            )))?;
        let offset = target - patch.address;

        if let Some((_, ResolvedInstruction::Branch(branch))) =
            instructions.get_index_mut(patch.entry)
        {
            let bits = branch.offset_bits();
            if !offset_fits(offset, bits) {
                return Err(Error::EncodingOverflow(EncodingOverflow::BranchOffset {
                    label: patch.label,
                    offset,
                    bits,
                }));
            }
            *branch = branch.clone().map_label(offset as i32);
        }
    }

    Ok(ResolvedStream {
        instructions,
        label_addresses,
        code_addresses,
        positions,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dex::code::{BodyId, BodyLabelGenerator, Comparison, LabelGenerator};
    use crate::dex::{BinaryOp, GotoForm, NumericType};

    fn add(dest: u16) -> StreamItem<u16> {
        StreamItem::Instruction(Instruction::Binary {
            op: BinaryOp::Add,
            typ: NumericType::Int,
            dest,
            first: dest,
            second: 1,
        })
    }

    fn offsets(stream: &ResolvedStream) -> Vec<(usize, i32)> {
        stream
            .instructions
            .iter()
            .filter_map(|(offset, _, insn)| match insn {
                ResolvedInstruction::Branch(branch) => Some((offset.0, *branch.label())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn loop_with_backward_and_forward_branches() {
        let mut labels = BodyLabelGenerator::new(BodyId::fresh());
        let top = labels.fresh_label();
        let exit = labels.fresh_label();

        let items = vec![
            StreamItem::Instruction(Instruction::Const { dest: 0, value: 0 }),
            StreamItem::Mark(top),
            StreamItem::Branch(BranchInstruction::If(Comparison::Ge, 0, 2, exit)),
            add(0),
            add(0),
            StreamItem::Branch(BranchInstruction::Goto(GotoForm::Goto16, top)),
            StreamItem::Mark(exit),
            StreamItem::Instruction(Instruction::Return {
                kind: crate::dex::MoveKind::Single,
                src: 0,
            }),
        ];

        let stream = resolve(items).unwrap();
        assert_eq!(stream.label_addresses[&top], Offset(1));
        assert_eq!(stream.label_addresses[&exit], Offset(9));

        // if-ge at 1 jumps forward 8, goto/16 at 7 jumps back 6
        assert_eq!(offsets(&stream), vec![(1, 8), (7, -6)]);
    }

    #[test]
    fn unmarked_label() {
        let mut labels = BodyLabelGenerator::new(BodyId::fresh());
        let nowhere = labels.fresh_label();
        let items = vec![StreamItem::Branch(BranchInstruction::IfZero(
            Comparison::Eq,
            0,
            nowhere,
        ))];
        assert!(matches!(
            resolve(items),
            Err(Error::UnresolvedReference(UnresolvedReference::Label(label))) if label == nowhere
        ));
    }

    #[test]
    fn short_goto_overflow() {
        let mut labels = BodyLabelGenerator::new(BodyId::fresh());
        let far = labels.fresh_label();
        let mut items = vec![StreamItem::Branch(BranchInstruction::Goto(
            GotoForm::Goto,
            far,
        ))];
        for _ in 0..100 {
            items.push(add(0));
        }
        items.push(StreamItem::Mark(far));
        items.push(StreamItem::Instruction(Instruction::ReturnVoid));

        assert!(matches!(
            resolve(items),
            Err(Error::EncodingOverflow(EncodingOverflow::BranchOffset {
                offset: 201,
                bits: 8,
                ..
            }))
        ));
    }
}
