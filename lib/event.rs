//! Change events and listener plumbing.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

use crate::path;

/// A non-owning reference to a node: its path at the time of reference and its unique id.
///
/// An id of `0` refers to a path that has no materialized node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
    /// Absolute remote path.
    pub path: String,
    /// Unique node id, `0` when not materialized.
    pub id: u64,
}

impl NodeRef {
    /// A reference to the node `id` at `path`.
    #[must_use]
    pub fn new(path: impl Into<String>, id: u64) -> Self {
        Self {
            path: path.into(),
            id,
        }
    }

    /// A reference to a path with no live node.
    #[must_use]
    pub fn unmaterialized(path: impl Into<String>) -> Self {
        Self::new(path, 0)
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A child appeared.
    Created,
    /// Content or metadata changed.
    Changed,
    /// The file went away.
    Deleted,
    /// The file was renamed; carries the previous name.
    Renamed { old_name: String },
    /// Access bits changed.
    AttributeChanged,
}

/// A file-system change observed on `source`, concerning `file`.
///
/// `source` is the node whose listeners receive the event: either `file` itself or its parent
/// directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    /// What happened.
    pub kind: EventKind,
    /// The node whose listeners received the event.
    pub source: NodeRef,
    /// The node that changed.
    pub file: NodeRef,
    /// Whether the change was initiated through this filesystem rather than observed.
    pub expected: bool,
    /// When the change was noticed.
    pub time: SystemTime,
}

impl FsEvent {
    /// An event stamped with the current time.
    #[must_use]
    pub fn new(kind: EventKind, source: NodeRef, file: NodeRef, expected: bool) -> Self {
        Self {
            kind,
            source,
            file,
            expected,
            time: SystemTime::now(),
        }
    }
}

/// Receives change events for a node.
pub trait FileChangeListener: Send + Sync {
    fn on_event(&self, event: &FsEvent);
}

/// The listeners attached to one node.
#[derive(Default)]
pub struct ListenerList {
    listeners: RwLock<Vec<Arc<dyn FileChangeListener>>>,
}

impl std::fmt::Debug for ListenerList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerList")
            .field("len", &self.len())
            .finish()
    }
}

impl ListenerList {
    /// Registers `listener`.
    pub fn add(&self, listener: Arc<dyn FileChangeListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Removes `listener` by identity. Returns whether it was attached.
    pub fn remove(&self, listener: &Arc<dyn FileChangeListener>) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Detaches and returns every listener.
    pub fn drain(&self) -> Vec<Arc<dyn FileChangeListener>> {
        std::mem::take(
            &mut *self
                .listeners
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Number of attached listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether there is nothing to hold.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` to every listener. Listeners are snapshotted first so a listener may
    /// (de)register others while being notified.
    pub fn fire(&self, event: &FsEvent) {
        let snapshot: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in snapshot {
            listener.on_event(event);
        }
    }
}

/// Identities needed to present a delegate's event from a link's point of view.
#[derive(Debug, Clone, Copy)]
pub struct LinkEventContext<'a> {
    /// The link node the event is re-dispatched on.
    pub link: &'a NodeRef,
    /// The node the link currently resolves to.
    pub delegate: &'a NodeRef,
    /// Materialized link-child wrappers below the link.
    pub link_children: &'a [NodeRef],
}

/// Rewrites an event observed on a link's delegate into the link's own terms.
///
/// References to the delegate become references to the link. References below the delegate
/// become the corresponding path below the link, resolved to a cached link-child wrapper when
/// one exists. Anything else is left untouched.
#[must_use]
pub fn translate_for_link(event: &FsEvent, ctx: &LinkEventContext<'_>) -> FsEvent {
    let translate = |node: &NodeRef| -> NodeRef {
        if node.path == ctx.delegate.path {
            return ctx.link.clone();
        }
        match path::rebase(&node.path, &ctx.delegate.path, &ctx.link.path) {
            Some(rebased) => ctx
                .link_children
                .iter()
                .find(|child| child.path == rebased)
                .cloned()
                .unwrap_or_else(|| NodeRef::unmaterialized(rebased)),
            None => node.clone(),
        }
    };
    FsEvent {
        kind: event.kind.clone(),
        source: translate(&event.source),
        file: translate(&event.file),
        expected: event.expected,
        time: event.time,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<FsEvent>>);

    impl FileChangeListener for Recorder {
        fn on_event(&self, event: &FsEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn delegate_identity_becomes_link_identity() {
        let link = NodeRef::new("/home/cur", 7);
        let delegate = NodeRef::new("/opt/v2", 3);
        let raw = FsEvent::new(EventKind::Changed, delegate.clone(), delegate.clone(), false);

        let out = translate_for_link(
            &raw,
            &LinkEventContext {
                link: &link,
                delegate: &delegate,
                link_children: &[],
            },
        );
        assert_eq!(out.source, link);
        assert_eq!(out.file, link);
        assert_eq!(out.time, raw.time);
        assert_eq!(raw.source, delegate, "input event must be left untouched");
    }

    #[test]
    fn delegate_children_map_to_link_children() {
        let link = NodeRef::new("/home/cur", 7);
        let delegate = NodeRef::new("/opt/v2", 3);
        let cached = NodeRef::new("/home/cur/a.txt", 11);
        let raw = FsEvent::new(
            EventKind::Created,
            delegate.clone(),
            NodeRef::new("/opt/v2/a.txt", 4),
            true,
        );
        let other = FsEvent::new(
            EventKind::Deleted,
            delegate.clone(),
            NodeRef::new("/opt/v2/sub/b.txt", 5),
            true,
        );
        let ctx = LinkEventContext {
            link: &link,
            delegate: &delegate,
            link_children: std::slice::from_ref(&cached),
        };

        let out = translate_for_link(&raw, &ctx);
        assert_eq!(out.source, link);
        assert_eq!(out.file, cached);

        let out = translate_for_link(&other, &ctx);
        assert_eq!(out.file, NodeRef::unmaterialized("/home/cur/sub/b.txt"));
    }

    #[test]
    fn unrelated_paths_are_kept() {
        let link = NodeRef::new("/l", 1);
        let delegate = NodeRef::new("/d", 2);
        let unrelated = NodeRef::new("/dd/x", 9);
        let raw = FsEvent::new(EventKind::Changed, unrelated.clone(), unrelated.clone(), false);
        let out = translate_for_link(
            &raw,
            &LinkEventContext {
                link: &link,
                delegate: &delegate,
                link_children: &[],
            },
        );
        assert_eq!(out.file, unrelated);
    }

    #[test]
    fn listener_list_fires_and_removes_by_identity() {
        let list = ListenerList::default();
        let recorder = Arc::new(Recorder::default());
        let as_listener: Arc<dyn FileChangeListener> = recorder.clone();
        list.add(Arc::clone(&as_listener));
        list.fire(&FsEvent::new(
            EventKind::Deleted,
            NodeRef::unmaterialized("/a"),
            NodeRef::unmaterialized("/a"),
            false,
        ));
        assert_eq!(recorder.0.lock().unwrap().len(), 1);

        assert!(list.remove(&as_listener));
        assert!(!list.remove(&as_listener));
        assert!(list.is_empty());
    }
}
