use super::BodyId;
use crate::dex::{EncodingOverflow, Error, TypeId};
use crate::util::{OffsetVec, Width};
use std::fmt;

/// Handle to a typed local variable in one method body
///
/// Parameters (and the receiver of instance methods) are locals too: they are created along with
/// the `CodeBuilder`.
#[derive(Copy, Clone, Hash, Eq, PartialEq)]
pub struct Local {
    pub(crate) body: BodyId,
    pub(crate) index: usize,
}

impl Local {
    /// Position of the local in declaration order
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Debug for Local {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_fmt(format_args!("local{}", self.index))
    }
}

#[derive(Clone, Debug)]
pub struct LocalSlot {
    pub typ: TypeId,
    pub parameter: bool,
}

impl Width for LocalSlot {
    fn width(&self) -> usize {
        self.typ.width()
    }
}

/// Assigns registers to locals
///
/// Slots are handed out in declaration order, parameters first, with no reuse: a local owns its
/// slot(s) for the whole method. The frame is the sum of all the widths.
pub struct RegisterAllocator {
    body: BodyId,
    slots: OffsetVec<LocalSlot>,
}

impl RegisterAllocator {
    pub fn new(body: BodyId) -> RegisterAllocator {
        RegisterAllocator {
            body,
            slots: OffsetVec::new(),
        }
    }

    pub fn declare(&mut self, typ: TypeId, parameter: bool) -> Local {
        let index = self.slots.len();
        self.slots.push(LocalSlot { typ, parameter });
        Local {
            body: self.body,
            index,
        }
    }

    /// Number of locals declared
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Declared type of a local (`None` if it comes from another body)
    pub fn local_type(&self, local: Local) -> Option<&TypeId> {
        if local.body != self.body {
            return None;
        }
        self.slots.get_index(local.index).map(|(_, slot)| &slot.typ)
    }

    /// Lay out the frame, checking that every local fits in `capacity` registers
    pub fn allocate(&self, capacity: usize) -> Result<Registers, Error> {
        let mut starts = Vec::with_capacity(self.slots.len());
        let mut ins_size = 0;

        for (offset, index, slot) in &self.slots {
            let local = Local {
                body: self.body,
                index,
            };
            let width = slot.width();
            if width == 2 && offset.0 + 1 == capacity {
                return Err(Error::EncodingOverflow(
                    EncodingOverflow::WideLocalAtLastSlot {
                        local,
                        slot: offset.0,
                    },
                ));
            }
            if offset.0 + width > capacity {
                return Err(Error::EncodingOverflow(EncodingOverflow::RegisterCapacity {
                    local,
                    needed: offset.0 + width,
                    capacity,
                }));
            }
            if slot.parameter {
                ins_size += width;
            }
            starts.push(offset.0);
        }

        let frame_size = self.slots.offset_len().0;

        // Dalvik passes arguments in the last `ins_size` registers, so parameter slots rotate to
        // the top of the frame and everything else shifts down.
        let registers = starts
            .into_iter()
            .map(|slot| {
                if slot < ins_size {
                    (slot + frame_size - ins_size) as u16
                } else {
                    (slot - ins_size) as u16
                }
            })
            .collect();

        log::trace!(
            "allocated {} locals into {} registers ({} ins)",
            self.slots.len(),
            frame_size,
            ins_size
        );

        Ok(Registers {
            registers,
            frame_size: frame_size as u16,
            ins_size: ins_size as u16,
        })
    }
}

/// Result of register allocation
#[derive(Clone, Debug)]
pub struct Registers {
    /// First register of each local, indexed by local
    registers: Vec<u16>,
    frame_size: u16,
    ins_size: u16,
}

impl Registers {
    /// First register of the local
    pub fn register(&self, local: Local) -> u16 {
        self.registers[local.index]
    }

    /// Total registers used
    pub fn frame_size(&self) -> u16 {
        self.frame_size
    }

    /// Registers taken by the receiver and parameters
    pub fn ins_size(&self) -> u16 {
        self.ins_size
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parameters_move_to_the_top() {
        let mut allocator = RegisterAllocator::new(BodyId::fresh());
        let this = allocator.declare(TypeId::OBJECT, true);
        let long_param = allocator.declare(TypeId::LONG, true);
        let first = allocator.declare(TypeId::INT, false);
        let second = allocator.declare(TypeId::DOUBLE, false);
        let third = allocator.declare(TypeId::STRING, false);

        let registers = allocator.allocate(100).unwrap();
        assert_eq!(registers.frame_size(), 7);
        assert_eq!(registers.ins_size(), 3);
        assert_eq!(registers.register(first), 0);
        assert_eq!(registers.register(second), 1);
        assert_eq!(registers.register(third), 3);
        assert_eq!(registers.register(this), 4);
        assert_eq!(registers.register(long_param), 5);
    }

    #[test]
    fn wide_last_parameter_overflows() {
        let mut allocator = RegisterAllocator::new(BodyId::fresh());
        allocator.declare(TypeId::INT, true);
        allocator.declare(TypeId::INT, true);
        let wide = allocator.declare(TypeId::LONG, true);

        match allocator.allocate(3) {
            Err(Error::EncodingOverflow(EncodingOverflow::WideLocalAtLastSlot { local, slot })) => {
                assert_eq!(local, wide);
                assert_eq!(slot, 2);
            }
            other => panic!("expected wide local overflow, got {:?}", other),
        }

        // With one more register, it fits
        assert_eq!(allocator.allocate(4).unwrap().frame_size(), 4);
    }

    #[test]
    fn too_many_locals() {
        let mut allocator = RegisterAllocator::new(BodyId::fresh());
        for _ in 0..4 {
            allocator.declare(TypeId::INT, false);
        }
        assert!(matches!(
            allocator.allocate(3),
            Err(Error::EncodingOverflow(EncodingOverflow::RegisterCapacity {
                needed: 4,
                capacity: 3,
                ..
            }))
        ));
    }
}
