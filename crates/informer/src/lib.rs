//! kmirror informer: reconciles queued deltas into the store and fans the
//! resulting notifications out to independent subscribers.

#![forbid(unsafe_code)]

mod distributor;
mod handler;
mod informer;
mod listener;
mod notification;
mod reconcile;

pub use distributor::{Distributor, NotificationSink};
pub use handler::ResourceEventHandler;
pub use informer::{SharedInformer, Subscription};
pub use listener::MIN_RESYNC_PERIOD;
pub use notification::{Notification, ResetMarker};
pub use reconcile::{ReconcileHandle, ReconcileLoop, ResyncGate};
