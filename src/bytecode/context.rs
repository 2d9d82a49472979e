use crate::bytecode::compile_error::CompileError;

/// Labels visible to an action or semantic predicate.
///
/// Maps each label to the absolute stack slot holding its value. Order is
/// declaration order; rebinding a label keeps its original position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Env {
    labels: Vec<(String, i32)>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, label: &str, slot: i32) {
        match self.labels.iter_mut().find(|(name, _)| name == label) {
            Some(entry) => entry.1 = slot,
            None => self.labels.push((label.to_string(), slot)),
        }
    }

    /// Parameter names in declaration order.
    pub fn names(&self) -> Vec<String> {
        self.labels.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Slot of every label as an offset below the stack top at `sp`.
    pub fn offsets(&self, sp: i32) -> Result<Vec<u32>, CompileError> {
        self.labels
            .iter()
            .map(|(label, slot)| {
                u32::try_from(sp - slot).map_err(|_| CompileError::InvalidSlot {
                    label: label.clone(),
                    slot: *slot,
                    sp,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Per-node generation state passed by value down the recursion.
///
/// `sp` is the slot of the current stack top relative to the rule's frame;
/// a rule starts at `-1` so its first pushed value lands in slot 0.
/// `action` is the code of an action whose call the current sequence must
/// emit once all its elements matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context<'a> {
    pub sp: i32,
    pub action: Option<&'a str>,
}

impl<'a> Context<'a> {
    pub fn rule() -> Self {
        Self { sp: -1, action: None }
    }

    /// Same context with `n` more values on the stack and no action.
    pub fn push(self, n: i32) -> Self {
        Self {
            sp: self.sp + n,
            action: None,
        }
    }

    /// Same context with `n` more values on the stack, keeping the action.
    pub fn step(self, n: i32) -> Self {
        Self {
            sp: self.sp + n,
            action: self.action,
        }
    }

    pub fn with_action(self, code: &'a str) -> Self {
        Self {
            sp: self.sp,
            action: Some(code),
        }
    }
}
