//! View of one event by id.

use crate::backend::EventBackend;
use crate::error::Result;
use crate::feed::{ChangeKind, StoreChange};
use crate::pointer::{EventPointer, Pointer};
use crate::types::EventId;

use super::{Model, Reaction, ViewState};

/// Shows the event with a given id, or `Missing`.
#[derive(Debug)]
pub struct SingleEventModel {
    id: EventId,
    state: ViewState,
}

impl SingleEventModel {
    /// A view of `id`, unseeded.
    pub fn new(id: EventId) -> Self {
        Self {
            id,
            state: ViewState::Unseeded,
        }
    }

    /// The id this view follows.
    pub fn id(&self) -> &EventId {
        &self.id
    }
}

impl Model for SingleEventModel {
    type Output = ViewState;

    fn seed(&mut self, backend: &dyn EventBackend) -> Result<()> {
        self.state = match backend.get(&self.id)? {
            Some(event) => ViewState::Current(event),
            None => ViewState::Missing,
        };
        Ok(())
    }

    fn apply(&mut self, change: &StoreChange) -> Reaction {
        if change.event.id != self.id {
            return Reaction::Ignored;
        }
        self.state = match change.kind {
            ChangeKind::Inserted => ViewState::Current(change.event.clone()),
            ChangeKind::Removed => ViewState::Missing,
        };
        Reaction::Updated
    }

    fn output(&self) -> ViewState {
        self.state.clone()
    }

    fn held(&self) -> Vec<EventId> {
        self.state.event().map(|e| e.id.clone()).into_iter().collect()
    }

    fn missing(&self) -> Option<Pointer> {
        Some(Pointer::Event(EventPointer::new(self.id.clone())))
    }

    fn reset(&mut self) {
        self.state = ViewState::Unseeded;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::ChangeSeq;
    use crate::index::MemoryIndex;
    use crate::types::EventBuilder;
    use std::sync::Arc;

    fn change(kind: ChangeKind, event: &Arc<crate::types::Event>) -> StoreChange {
        StoreChange {
            seq: ChangeSeq::from_raw(1),
            kind,
            event: event.clone(),
        }
    }

    #[test]
    fn test_transitions() {
        let event = Arc::new(EventBuilder::new(1, "pk").build());
        let other = Arc::new(EventBuilder::new(1, "pk").content("other").build());
        let mut model = SingleEventModel::new(event.id.clone());
        assert_eq!(model.output(), ViewState::Unseeded);

        model.seed(&MemoryIndex::new()).unwrap();
        assert!(model.output().is_missing());
        assert!(model.held().is_empty());

        assert_eq!(model.apply(&change(ChangeKind::Inserted, &other)), Reaction::Ignored);
        assert_eq!(model.apply(&change(ChangeKind::Inserted, &event)), Reaction::Updated);
        assert_eq!(model.output(), ViewState::Current(event.clone()));
        assert_eq!(model.held(), vec![event.id.clone()]);

        model.apply(&change(ChangeKind::Removed, &event));
        assert!(model.output().is_missing());
    }
}
