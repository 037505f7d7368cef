//! Dispatch of payloads to the first handler that accepts them.

use std::sync::Arc;

use stratum_core::{CancelSignal, OperationHandler, OperationOutcome, OperationPayload};
use tracing::debug;

use crate::error::{QueueError, QueueResult};

/// Ordered list of operation handlers.
#[derive(Default, Clone)]
pub struct OperationRouter {
    handlers: Vec<Arc<dyn OperationHandler>>,
}

impl std::fmt::Debug for OperationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|handler| handler.name()))
            .finish()
    }
}

impl OperationRouter {
    /// Router with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler; earlier registrations win ties.
    pub fn register(&mut self, handler: Arc<dyn OperationHandler>) {
        debug!(handler = handler.name(), "operation handler registered");
        self.handlers.push(handler);
    }

    /// Builder form of [`OperationRouter::register`].
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn OperationHandler>) -> Self {
        self.register(handler);
        self
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// First handler whose `can_handle` accepts `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NoHandlerFound`] when none does.
    pub fn route(&self, payload: &OperationPayload) -> QueueResult<&Arc<dyn OperationHandler>> {
        self.handlers
            .iter()
            .find(|handler| handler.can_handle(payload))
            .ok_or(QueueError::NoHandlerFound {
                kind: payload.kind(),
            })
    }

    /// Route and run `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NoHandlerFound`] when routing fails and
    /// [`QueueError::Handler`] when the handler returns an error.
    pub async fn execute(
        &self,
        payload: &OperationPayload,
        cancel: CancelSignal,
    ) -> QueueResult<OperationOutcome> {
        let handler = self.route(payload)?;
        debug!(handler = handler.name(), kind = %payload.kind(), "routing operation");
        handler
            .execute(payload, cancel)
            .await
            .map_err(|source| QueueError::Handler {
                kind: payload.kind(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::{BulkArchiveKind, OperationKind};
    use stratum_test_support::{ScriptedHandler, bulk_archive, file_transfer};

    #[tokio::test]
    async fn first_accepting_handler_wins() -> anyhow::Result<()> {
        let transfers =
            Arc::new(ScriptedHandler::succeeding(1).accepting(&[OperationKind::FileTransfer]));
        let first = Arc::new(ScriptedHandler::succeeding(2));
        let second = Arc::new(ScriptedHandler::succeeding(3));
        let router = OperationRouter::new()
            .with_handler(transfers.clone())
            .with_handler(first.clone())
            .with_handler(second.clone());

        let payload = bulk_archive(BulkArchiveKind::Copy, &["a1"], "work");
        let outcome = router.execute(&payload, CancelSignal::never()).await?;
        assert_eq!(outcome.bytes_moved, 2);
        assert_eq!(first.executed(), 1);
        assert_eq!(second.executed(), 0);
        assert_eq!(transfers.executed(), 0);

        let payload = OperationPayload::FileTransfer(file_transfer("a", "x", "b", "y"));
        assert_eq!(router.execute(&payload, CancelSignal::never()).await?.bytes_moved, 1);
        Ok(())
    }

    #[tokio::test]
    async fn unroutable_payload_fails() {
        let router = OperationRouter::new()
            .with_handler(Arc::new(
                ScriptedHandler::succeeding(0).accepting(&[OperationKind::FileTransfer]),
            ));
        let payload = bulk_archive(BulkArchiveKind::Extract, &["a1"], "work");
        let err = router
            .execute(&payload, CancelSignal::never())
            .await
            .expect_err("no handler");
        assert!(matches!(
            err,
            QueueError::NoHandlerFound {
                kind: OperationKind::BulkExtract
            }
        ));
    }

    #[tokio::test]
    async fn handler_errors_are_wrapped() {
        let router = OperationRouter::new().with_handler(Arc::new(ScriptedHandler::erroring("io")));
        let payload = bulk_archive(BulkArchiveKind::Copy, &["a1"], "work");
        let err = router
            .execute(&payload, CancelSignal::never())
            .await
            .expect_err("handler error");
        assert!(matches!(err, QueueError::Handler { .. }));
        assert_eq!(err.operation_message(), "io");
        assert_eq!(router.len(), 1);
    }
}
