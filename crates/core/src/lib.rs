//! kmirror core types: resource keys, delta records, selectors and config.
//!
//! Everything here is plain data shared by the store, the reflector and the
//! informer crates. No I/O happens in this crate.

#![forbid(unsafe_code)]

pub mod config;
pub mod delta;
pub mod error;
pub mod key;
pub mod selector;

pub use config::MirrorConfig;
pub use delta::{Delta, DeltaType, Deltas};
pub use error::{Error, Result};
pub use key::{resource_version, ObjectKey};
pub use selector::{LabelSelector, ListOptions, Requirement};

pub mod prelude {
    pub use super::{
        resource_version, Delta, DeltaType, Deltas, Error, LabelSelector, ListOptions, MirrorConfig, ObjectKey,
        Requirement, Result,
    };
}
