//! Link resolution on top of the node graph.

use std::sync::Arc;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use tracing::{debug, trace};

use super::{FsError, RemoteFileSystem};
use crate::event::FileChangeListener;
use crate::link::{LinkForwarder, LinkResolution, LinkWalk};
use crate::node::{Forwarding, NodeKind, RemoteNode};
use crate::path;
use crate::transport::Transport;

impl<T: Transport> RemoteFileSystem<T> {
    /// Follows `node` to the first node on its link chain that is not a link.
    ///
    /// Nodes that are not links resolve to themselves.
    pub async fn canonical_delegate(
        &self,
        node: &Arc<RemoteNode>,
    ) -> Result<LinkResolution, FsError> {
        Self::ensure_valid(node)?;
        match node.kind() {
            NodeKind::Symlink(_) => self.resolve_link(node).await,
            NodeKind::LinkChild { delegate } if delegate.is_link() => {
                let delegate = Arc::clone(delegate);
                self.resolve_link(&delegate).await
            }
            NodeKind::LinkChild { delegate } => {
                if delegate.is_valid() {
                    Ok(LinkResolution::Resolved(Arc::clone(delegate)))
                } else {
                    Ok(LinkResolution::Dangling {
                        target: delegate.path(),
                    })
                }
            }
            NodeKind::Directory(_) | NodeKind::PlainFile { .. } | NodeKind::Special { .. } => {
                Ok(LinkResolution::Resolved(Arc::clone(node)))
            }
        }
    }

    /// Whether `node` is a link whose chain loops or whose non-empty target does not resolve.
    pub async fn is_cyclic_link(&self, node: &Arc<RemoteNode>) -> Result<bool, FsError> {
        if !node.is_link() && node.link_child_delegate().is_none() {
            return Ok(false);
        }
        Ok(self.canonical_delegate(node).await?.is_cyclic())
    }

    /// The node `link` ultimately points at.
    pub async fn read_symbolic_link(
        &self,
        link: &Arc<RemoteNode>,
    ) -> Result<Arc<RemoteNode>, FsError> {
        if !link.is_link() {
            return Err(FsError::NotALink { path: link.path() });
        }
        self.content_target(link, "read link").await
    }

    /// The raw target string of `link`, as stored on the remote.
    pub fn read_symbolic_link_path(&self, link: &RemoteNode) -> Result<String, FsError> {
        Self::ensure_valid(link)?;
        link.as_link()
            .map(crate::node::LinkState::target)
            .ok_or_else(|| FsError::NotALink { path: link.path() })
    }

    /// The node an operation on `node` acts on: the canonical delegate for links, `node`
    /// itself otherwise.
    pub(super) async fn content_target(
        &self,
        node: &Arc<RemoteNode>,
        operation: &'static str,
    ) -> Result<Arc<RemoteNode>, FsError> {
        match self.canonical_delegate(node).await? {
            LinkResolution::Resolved(delegate) => Ok(delegate),
            LinkResolution::SelfReference | LinkResolution::Cycle { .. } => {
                Err(FsError::CyclicLink { path: node.path() })
            }
            LinkResolution::Dangling { target } => {
                debug!(link = %node, %target, operation, "link does not resolve");
                Err(FsError::not_found(operation, node.path()))
            }
        }
    }

    async fn resolve_link(&self, link: &Arc<RemoteNode>) -> Result<LinkResolution, FsError> {
        let Some(state) = link.as_link() else {
            return Ok(LinkResolution::Resolved(Arc::clone(link)));
        };
        let link_path = link.path();
        let mut walk = LinkWalk::new(link_path.clone());
        match walk.follow(&link_path, &state.target()) {
            Ok(next) => self.resolve_path(next, &mut walk).await,
            Err(outcome) => Ok(outcome),
        }
    }

    /// Walks `pending` from the root, restarting at each link met on the way.
    async fn resolve_path(
        &self,
        mut pending: String,
        walk: &mut LinkWalk,
    ) -> Result<LinkResolution, FsError> {
        'restart: loop {
            trace!(origin = walk.origin(), %pending, "resolving link path");
            let components: Vec<String> =
                path::components(&pending).map(str::to_owned).collect();
            let mut current = self.root();
            for (idx, name) in components.iter().enumerate() {
                if !current.is_directory() {
                    return Ok(LinkResolution::Dangling { target: pending });
                }
                let next = match self.directory_child(&current, name).await {
                    Ok(Some(next)) => next,
                    Ok(None) | Err(FsError::NotFound { .. }) => {
                        return Ok(LinkResolution::Dangling { target: pending });
                    }
                    Err(e) => return Err(e),
                };
                if let Some(state) = next.as_link() {
                    match walk.follow(&next.path(), &state.target()) {
                        Ok(resolved) => {
                            pending = components[idx + 1..]
                                .iter()
                                .fold(resolved, |acc, c| path::join(&acc, c));
                            continue 'restart;
                        }
                        Err(outcome) => return Ok(outcome),
                    }
                }
                current = next;
            }
            return Ok(LinkResolution::Resolved(current));
        }
    }

    /// Points the event forwarding of `link` at its current canonical delegate.
    ///
    /// Forwarding only exists while the link has listeners of its own.
    pub(super) fn sync_link_forwarding<'a>(
        &'a self,
        link: &'a Arc<RemoteNode>,
    ) -> BoxFuture<'a, Result<(), FsError>> {
        async move {
            let Some(state) = link.as_link() else {
                return Ok(());
            };
            if let Some(previous) = state.take_forwarding() {
                self.drop_forwarding(&previous);
            }
            if !link.is_valid() || link.listeners().is_empty() {
                return Ok(());
            }
            let LinkResolution::Resolved(delegate) = self.resolve_link(link).await? else {
                debug!(link = %link, "link does not resolve, not forwarding events");
                return Ok(());
            };

            let listener: Arc<dyn FileChangeListener> =
                Arc::new(LinkForwarder::new(link, &delegate, &self.inner.factory));
            self.inner
                .factory
                .add_listener(&delegate.path(), Arc::clone(&listener));
            debug!(link = %link, delegate = %delegate, "forwarding delegate events");
            if let Some(raced) = state.replace_forwarding(Forwarding { delegate, listener }) {
                self.drop_forwarding(&raced);
            }
            Ok(())
        }
        .boxed()
    }

    pub(super) fn drop_forwarding(&self, forwarding: &Forwarding) {
        forwarding.delegate.listeners().remove(&forwarding.listener);
        self.inner
            .factory
            .remove_listener(&forwarding.delegate.path(), &forwarding.listener);
    }
}
