use std::sync::Arc;

/// Boundary of a reset window: the records between `Begin` and `End` are the
/// complete current state. An empty window is a single `Empty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMarker {
    Begin,
    End,
    Empty,
}

/// One item on a listener's delivery queue.
#[derive(Debug)]
pub enum Notification<K> {
    Add(Arc<K>),
    Update { old: Arc<K>, new: Arc<K> },
    Delete { obj: Arc<K>, final_state_unknown: bool },
    Reset(ResetMarker),
}

impl<K> Clone for Notification<K> {
    fn clone(&self) -> Self {
        match self {
            Notification::Add(o) => Notification::Add(Arc::clone(o)),
            Notification::Update { old, new } => Notification::Update { old: Arc::clone(old), new: Arc::clone(new) },
            Notification::Delete { obj, final_state_unknown } => {
                Notification::Delete { obj: Arc::clone(obj), final_state_unknown: *final_state_unknown }
            }
            Notification::Reset(m) => Notification::Reset(*m),
        }
    }
}

impl<K> Notification<K> {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Add(_) => "add",
            Notification::Update { .. } => "update",
            Notification::Delete { .. } => "delete",
            Notification::Reset(_) => "reset",
        }
    }
}
