use std::sync::Arc;

use async_trait::async_trait;

use crate::ResetMarker;

/// Callbacks for one subscription. Calls for a listener arrive one at a time
/// and in order; an error or panic is logged and delivery moves on.
#[async_trait]
pub trait ResourceEventHandler<K>: Send + Sync + 'static
where
    K: Send + Sync + 'static,
{
    async fn on_add(&self, obj: Arc<K>) -> anyhow::Result<()>;

    async fn on_update(&self, old: Arc<K>, new: Arc<K>) -> anyhow::Result<()>;

    /// `final_state_unknown` is set when the deletion was inferred from a
    /// relist; `obj` is then the last state the mirror knew.
    async fn on_delete(&self, obj: Arc<K>, final_state_unknown: bool) -> anyhow::Result<()>;

    /// Brackets the full-state replay a new subscriber receives.
    async fn on_reset(&self, _marker: ResetMarker) -> anyhow::Result<()> { Ok(()) }
}
