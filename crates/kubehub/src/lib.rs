//! kmirror kubehub: the list/watch boundary, its Kubernetes and in-memory
//! implementations, and the reflector that drives them into a delta queue.

#![forbid(unsafe_code)]

mod backoff;
mod fake;
mod kube_source;
mod reflector;
mod source;

pub use backoff::Backoff;
pub use fake::{Calls, FakeSource};
pub use kube_source::{parse_gvk_key, KubeSource};
pub use reflector::Reflector;
pub use source::{Listed, Source, SourceError, WatchEvent, WatchStream};
