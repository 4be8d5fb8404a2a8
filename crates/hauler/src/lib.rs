//! An OCI image layout used as a content store.
//!
//! The store keeps images, Helm charts, files and their signatures as
//! content-addressed blobs plus one sorted `index.json`, so a single
//! directory can be packed into an archive, carried across an air gap,
//! loaded on the other side and served as a registry.
//!
//! Builders produce an [`Artifact`]; [`Store::add`] commits it atomically
//! through a staging layout. Everything else (registry serving, remote
//! pushes, extraction) reads back through the [`Store`].

#![forbid(unsafe_code)]

pub mod archive;
pub mod artifact;
pub mod blob;
pub mod config;
pub mod descriptor;
pub mod digest;
pub mod error;
pub mod index;
pub mod kind;
pub mod reference;
mod staging;
pub mod store;
pub mod target;
pub mod upload;

#[cfg(any(test, feature = "test"))]
pub mod test;

pub use artifact::{Artifact, BlobReader, Layer, Opener};
pub use config::StoreConfig;
pub use descriptor::{Descriptor, Manifest, ManifestDocument};
pub use digest::{Algorithm, Digest};
pub use error::{Error, Result};
pub use kind::Kind;
pub use reference::Reference;
pub use store::{CopyReport, FsckReport, GcResult, RemoveOutcome, Store};
pub use target::{DirectoryTarget, Target};
