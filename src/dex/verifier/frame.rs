use super::merge;
use crate::dex::TypeId;

/// Types of the values held in every local at some program point
///
/// Locals are indexed in declaration order. `None` means the local has not been assigned on
/// every path reaching this point, so it cannot be read.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Frame {
    pub locals: Vec<Option<TypeId>>,
}

/// Local whose types on two incoming edges have no join
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MergeConflict {
    pub local: usize,
    pub first: TypeId,
    pub second: TypeId,
}

impl Frame {
    /// Frame where no local is assigned yet
    pub fn unassigned(local_count: usize) -> Frame {
        Frame {
            locals: vec![None; local_count],
        }
    }

    pub fn get(&self, local: usize) -> Option<&TypeId> {
        self.locals.get(local).and_then(Option::as_ref)
    }

    pub fn set(&mut self, local: usize, typ: TypeId) {
        if let Some(slot) = self.locals.get_mut(local) {
            *slot = Some(typ);
        }
    }

    /// Merge the frame from another incoming edge into this one
    ///
    /// Locals unassigned on either edge are unassigned in the result.
    pub fn merge_from(&mut self, incoming: &Frame) -> Result<(), MergeConflict> {
        for (local, (slot, other)) in self.locals.iter_mut().zip(&incoming.locals).enumerate() {
            let merged = match (slot.as_ref(), other) {
                (Some(first), Some(second)) => match merge(first, second) {
                    Some(merged) => Some(merged),
                    None => {
                        return Err(MergeConflict {
                            local,
                            first: first.clone(),
                            second: second.clone(),
                        })
                    }
                },
                _ => None,
            };
            *slot = merged;
        }
        Ok(())
    }
}
