/// Path-keyed identity cache.
pub mod identity;
