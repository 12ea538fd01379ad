use std::fmt;

use crate::object::SurrogateRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Create,
    Update,
    Destroy,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Create => write!(f, "CREATE"),
            CommandKind::Update => write!(f, "UPDATE"),
            CommandKind::Destroy => write!(f, "DESTROY"),
        }
    }
}

/// One queued create, update or destroy of a surrogate.
///
/// The target is flattened only when the queue is applied, so later field
/// changes made inside the same transaction are written too.
#[derive(Debug, Clone)]
pub struct RecordCommand {
    kind: CommandKind,
    target: SurrogateRef,
}

impl RecordCommand {
    pub fn new(kind: CommandKind, target: SurrogateRef) -> Self {
        Self { kind, target }
    }

    pub fn create(target: SurrogateRef) -> Self {
        Self::new(CommandKind::Create, target)
    }

    pub fn update(target: SurrogateRef) -> Self {
        Self::new(CommandKind::Update, target)
    }

    pub fn destroy(target: SurrogateRef) -> Self {
        Self::new(CommandKind::Destroy, target)
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn target(&self) -> &SurrogateRef {
        &self.target
    }
}
