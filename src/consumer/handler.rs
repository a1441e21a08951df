use async_trait::async_trait;

use crate::queue::Message;

/// Business callback invoked by consumer workers.
///
/// `handle` may be called several times for the same message when it
/// fails; implementations should be idempotent on `Message::id`.
///
/// # Example
///
/// ```rust,ignore
/// struct OrderHandler;
///
/// #[async_trait]
/// impl MessageHandler for OrderHandler {
///     async fn handle(&self, message: &Message) -> anyhow::Result<()> {
///         let order: Order = serde_json::from_slice(&message.data)?;
///         process(order).await
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> anyhow::Result<()>;

    /// Called after every failed `handle`. Returning an error abandons the
    /// message immediately instead of retrying it.
    async fn on_error(&self, _message: &Message, _error: &anyhow::Error) -> anyhow::Result<()> {
        Ok(())
    }
}
