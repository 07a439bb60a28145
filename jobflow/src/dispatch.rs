// Dispatch seam between the flow engine and the outer action router

use crate::models::{Action, Response};
use async_trait::async_trait;

/// Dispatcher sends an action to whatever handles it and returns the response.
///
/// Returning `Err` is treated like a thrown dispatch: the step converts it to
/// an `error` response carrying the error message.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, action: Action) -> anyhow::Result<Response>;
}

#[async_trait]
impl<D: Dispatcher + ?Sized> Dispatcher for std::sync::Arc<D> {
    async fn dispatch(&self, action: Action) -> anyhow::Result<Response> {
        (**self).dispatch(action).await
    }
}
