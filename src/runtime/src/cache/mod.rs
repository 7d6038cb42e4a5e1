//! Build cache.
//!
//! `LayerCache` maps stage keys to the layer tarballs they produced.

pub mod layer_cache;

pub use layer_cache::{CachedLayer, LayerCache, LayerMeta};
