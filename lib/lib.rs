//! remote-fs shared library: a local, identity-preserving cache of a remote file tree.

/// Caching primitives.
pub mod cache;
pub mod config;
/// Directory entry records and their line format.
pub mod entry;
pub mod event;
pub mod factory;
/// The consumer-facing filesystem view.
pub mod fs;
pub mod link;
pub mod node;
/// Remote path manipulation.
pub mod path;
pub mod storage;
/// Remote protocols.
pub mod transport;
pub mod zipper;
