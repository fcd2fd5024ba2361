use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Identifies one method body under construction
///
/// Labels and locals carry the body they were created for so that handles leaking from one
/// `CodeBuilder` into another get caught.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct BodyId(usize);

static NEXT_BODY_ID: AtomicUsize = AtomicUsize::new(0);

impl BodyId {
    pub fn fresh() -> BodyId {
        BodyId(NEXT_BODY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Opaque branch target
///
/// A label is marked at most once, but can be branched to any number of times from before or
/// after the point where it is marked.
#[derive(Copy, Clone, Hash, Eq, PartialEq)]
pub struct Label {
    pub(crate) body: BodyId,
    pub(crate) index: usize,
}

impl Label {
    /// Position of the label in creation order
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Generates new labels
pub trait LabelGenerator<Label> {
    /// Generate a fresh label
    fn fresh_label(&mut self) -> Label;
}

/// Label generator for one method body
pub struct BodyLabelGenerator {
    body: BodyId,
    next: usize,
}

impl BodyLabelGenerator {
    pub fn new(body: BodyId) -> BodyLabelGenerator {
        BodyLabelGenerator { body, next: 0 }
    }

    /// Number of labels handed out so far
    pub fn count(&self) -> usize {
        self.next
    }
}

impl LabelGenerator<Label> for BodyLabelGenerator {
    fn fresh_label(&mut self) -> Label {
        let label = Label {
            body: self.body,
            index: self.next,
        };
        self.next += 1;
        label
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_fmt(format_args!("L{}", self.index))
    }
}
