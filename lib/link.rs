//! Symbolic-link resolution.
//!
//! A link resolves in steps: raw target string, normalized absolute path, the node at that path
//! (possibly another link), and finally the canonical delegate, the first node on the chain that
//! is not a link. [`LinkWalk`] carries the visited set for one resolution so that loops end in a
//! [`LinkResolution`] instead of unbounded recursion.

use std::sync::{Arc, Weak};

use rustc_hash::FxHashSet;
use tracing::trace;

use crate::event::{FileChangeListener, FsEvent, LinkEventContext, NodeRef, translate_for_link};
use crate::factory::NodeFactory;
use crate::node::RemoteNode;
use crate::path;

/// Links followed by one resolution before it is declared a cycle.
pub const MAX_LINK_HOPS: usize = 40;

/// The outcome of resolving a link to its canonical delegate.
#[derive(Debug, Clone)]
pub enum LinkResolution {
    /// The chain ends in a node that is not a link.
    Resolved(Arc<RemoteNode>),
    /// Some path on the chain does not exist.
    Dangling { target: String },
    /// The chain leads back to the link it started from, or below it.
    SelfReference,
    /// The chain revisits a link other than the one it started from.
    Cycle { revisited: String },
}

impl LinkResolution {
    /// Whether the link should be reported as cyclic.
    ///
    /// Besides real loops this covers a non-empty target that fails to resolve; an empty
    /// target only dangles.
    #[must_use]
    pub fn is_cyclic(&self) -> bool {
        match self {
            Self::Resolved(_) => false,
            Self::Dangling { target } => !target.is_empty(),
            Self::SelfReference | Self::Cycle { .. } => true,
        }
    }

    /// The canonical delegate, if the chain resolved.
    #[must_use]
    pub fn delegate(&self) -> Option<&Arc<RemoteNode>> {
        match self {
            Self::Resolved(node) => Some(node),
            _ => None,
        }
    }

    /// Like [`delegate`](Self::delegate), consuming the resolution.
    #[must_use]
    pub fn into_delegate(self) -> Option<Arc<RemoteNode>> {
        match self {
            Self::Resolved(node) => Some(node),
            _ => None,
        }
    }
}

/// State of one link-chain traversal.
#[derive(Debug)]
pub struct LinkWalk {
    origin: String,
    visited: FxHashSet<String>,
    hops: usize,
}

impl LinkWalk {
    /// Starts a walk for the link at `origin`.
    #[must_use]
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            visited: FxHashSet::default(),
            hops: 0,
        }
    }

    /// Path of the link the walk started from.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Follows the link at `link_path`, whose raw target is `target`.
    ///
    /// Returns the normalized path to continue with, or the terminal outcome when the step
    /// cannot be taken.
    pub fn follow(&mut self, link_path: &str, target: &str) -> Result<String, LinkResolution> {
        self.hops += 1;
        if self.hops > MAX_LINK_HOPS {
            return Err(LinkResolution::Cycle {
                revisited: link_path.to_owned(),
            });
        }
        if link_path == self.origin {
            if self.hops > 1 {
                return Err(LinkResolution::SelfReference);
            }
        } else if !self.visited.insert(link_path.to_owned()) {
            trace!(origin = %self.origin, link_path, "link chain revisits a link");
            return Err(LinkResolution::Cycle {
                revisited: link_path.to_owned(),
            });
        }

        let Some(resolved) = path::resolve_link_target(link_path, target) else {
            return Err(LinkResolution::Dangling {
                target: target.to_owned(),
            });
        };
        if resolved == self.origin || path::is_descendant(&resolved, &self.origin) {
            trace!(origin = %self.origin, %resolved, "link resolves into itself");
            return Err(LinkResolution::SelfReference);
        }
        Ok(resolved)
    }
}

/// Re-dispatches events seen on a link's canonical delegate to the link's own listeners.
pub struct LinkForwarder {
    link: Weak<RemoteNode>,
    delegate: NodeRef,
    factory: Weak<NodeFactory>,
}

impl LinkForwarder {
    /// A forwarder from `delegate` to the listeners of `link`.
    #[must_use]
    pub fn new(link: &Arc<RemoteNode>, delegate: &RemoteNode, factory: &Arc<NodeFactory>) -> Self {
        Self {
            link: Arc::downgrade(link),
            delegate: delegate.node_ref(),
            factory: Arc::downgrade(factory),
        }
    }

    /// Path of the node this forwarder listens on.
    #[must_use]
    pub fn delegate_path(&self) -> &str {
        &self.delegate.path
    }
}

impl FileChangeListener for LinkForwarder {
    fn on_event(&self, event: &FsEvent) {
        let Some(link) = self.link.upgrade().filter(|l| l.is_valid()) else {
            return;
        };
        let link_children: Vec<NodeRef> = self
            .factory
            .upgrade()
            .map(|factory| {
                factory
                    .cached_descendants(&link)
                    .iter()
                    .map(|n| n.node_ref())
                    .collect()
            })
            .unwrap_or_default();
        let link_ref = link.node_ref();
        let translated = translate_for_link(
            event,
            &LinkEventContext {
                link: &link_ref,
                delegate: &self.delegate,
                link_children: &link_children,
            },
        );
        link.listeners().fire(&translated);
    }
}
