use crate::dataset::DataSet;
use crate::executor::JobMeta;
use crate::scheduler::RefreshMode;
use std::fmt;
use std::sync::Arc;

/// Names of the events a consumer can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DataChanged,
    FullRefreshComplete,
    PartialUpdateComplete,
    RefreshStart,
    SearchStart,
    SearchProgress,
    SearchDone,
    SearchError,
    SearchFail,
    SearchCancel,
    SchemaError,
}

impl EventKind {
    fn is_search_status(self) -> bool {
        matches!(
            self,
            EventKind::SearchStart
                | EventKind::SearchProgress
                | EventKind::SearchDone
                | EventKind::SearchError
                | EventKind::SearchFail
                | EventKind::SearchCancel
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    /// The visible data set was replaced; carries the new snapshot.
    DataChanged(Arc<DataSet>),
    FullRefreshComplete,
    PartialUpdateComplete,
    RefreshStart { mode: RefreshMode },
    SearchStart,
    SearchProgress(JobMeta),
    SearchDone(JobMeta),
    SearchError(String),
    SearchFail(String),
    SearchCancel,
    SchemaError { missing: Vec<String> },
}

impl ManagerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ManagerEvent::DataChanged(_) => EventKind::DataChanged,
            ManagerEvent::FullRefreshComplete => EventKind::FullRefreshComplete,
            ManagerEvent::PartialUpdateComplete => EventKind::PartialUpdateComplete,
            ManagerEvent::RefreshStart { .. } => EventKind::RefreshStart,
            ManagerEvent::SearchStart => EventKind::SearchStart,
            ManagerEvent::SearchProgress(_) => EventKind::SearchProgress,
            ManagerEvent::SearchDone(_) => EventKind::SearchDone,
            ManagerEvent::SearchError(_) => EventKind::SearchError,
            ManagerEvent::SearchFail(_) => EventKind::SearchFail,
            ManagerEvent::SearchCancel => EventKind::SearchCancel,
            ManagerEvent::SchemaError { .. } => EventKind::SchemaError,
        }
    }
}

/// Handle returned by `subscribe`; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

type Handler = Box<dyn FnMut(&ManagerEvent)>;

struct Listener {
    id: u64,
    kind: EventKind,
    handler: Handler,
}

/// Typed publish/subscribe list. Handlers only see the kind they asked for.
#[derive(Default)]
pub struct EventBus {
    next_id: u64,
    listeners: Vec<Listener>,
    last_search: Option<ManagerEvent>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.len())
            .field("last_search", &self.last_search.as_ref().map(|e| e.kind()))
            .finish()
    }
}

impl EventBus {
    pub fn subscribe(
        &mut self,
        kind: EventKind,
        handler: impl FnMut(&ManagerEvent) + 'static,
    ) -> Subscription {
        self.next_id += 1;
        self.listeners.push(Listener {
            id: self.next_id,
            kind,
            handler: Box::new(handler),
        });
        Subscription(self.next_id)
    }

    /// Returns false when the subscription was already gone.
    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.id != subscription.0);
        self.listeners.len() != before
    }

    pub fn emit(&mut self, event: ManagerEvent) {
        let kind = event.kind();
        if kind.is_search_status() {
            self.last_search = Some(event.clone());
        }
        for listener in self.listeners.iter_mut().filter(|l| l.kind == kind) {
            (listener.handler)(&event);
        }
    }

    pub fn last_search_event(&self) -> Option<EventKind> {
        self.last_search.as_ref().map(ManagerEvent::kind)
    }

    /// Re-deliver the most recent search status event, if any.
    pub fn replay_last_search_event(&mut self) -> bool {
        match self.last_search.clone() {
            Some(event) => {
                self.emit(event);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
