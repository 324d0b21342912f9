//! `marketgrid-core`: shared vocabulary of the sync & inference layer.
//!
//! This crate contains **pure** building blocks (no runtime, no IO):
//! principals, the recognized entity collections, the immutable [`Snapshot`]
//! and the error taxonomy every other crate reports through.

pub mod collection;
pub mod error;
pub mod id;
pub mod principal;
pub mod snapshot;

pub use collection::Collection;
pub use error::{GridError, GridResult, InferenceFailure};
pub use id::PrincipalId;
pub use principal::{Principal, Role};
pub use snapshot::{RawSnapshot, Snapshot};
