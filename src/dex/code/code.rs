use super::{
    decode, DecodedInstruction, IndexResolver, PlaceholderIndices, ResolvedInstruction,
};
use crate::dex::{Error, MethodAccessFlags, MethodId, TypeId};
use crate::util::{Offset, OffsetVec};

/// Finished body of a method
///
/// Registers and branch offsets are final, but references to strings, types, fields, and methods
/// are still symbolic until the whole unit is written out.
#[derive(Debug)]
pub struct Code {
    pub method: MethodId,
    pub access_flags: MethodAccessFlags,
    pub registers_size: u16,
    pub ins_size: u16,
    pub outs_size: u16,
    pub instructions: OffsetVec<ResolvedInstruction>,
    pub tries: Vec<TryItem>,

    /// Source line of the instructions from each address on
    pub positions: Vec<(Offset, u32)>,
}

/// Range of code units `[start, end)` with the handlers covering it, in priority order
#[derive(Debug)]
pub struct TryItem {
    pub start: Offset,
    pub end: Offset,
    pub handlers: Vec<CatchHandler>,
}

#[derive(Debug)]
pub struct CatchHandler {
    pub exception: TypeId,
    pub address: Offset,
}

impl Code {
    /// Size of the instructions in code units
    pub fn insns_size(&self) -> usize {
        self.instructions.offset_len().0
    }

    /// Encode the instructions with real table indices
    pub fn encode_instructions(&self, indices: &impl IndexResolver) -> Result<Vec<u16>, Error> {
        let mut units = Vec::with_capacity(self.insns_size());
        for (_, _, insn) in &self.instructions {
            match insn {
                ResolvedInstruction::Plain { insn, .. } => insn.encode(indices, &mut units)?,
                ResolvedInstruction::Branch(branch) => branch.encode(&mut units)?,
            }
        }
        Ok(units)
    }

    /// Encode the instructions with every index set to 0
    pub fn placeholder_units(&self) -> Result<Vec<u16>, Error> {
        self.encode_instructions(&PlaceholderIndices)
    }

    /// Human readable listing of the instructions
    pub fn listing(&self) -> Result<Vec<DecodedInstruction>, Error> {
        decode(&self.placeholder_units()?)
    }
}
