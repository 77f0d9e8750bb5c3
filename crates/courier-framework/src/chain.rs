//! The error-handler chain.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;

use crate::context::{CallbackContext, DispatchEnv};
use crate::error::HandlerFailure;
use crate::handler::{BoxedCallback, invoke};

/// Error handlers, run in registration order for every callback failure.
///
/// A failing error handler is logged and the next one still runs. With no
/// handlers registered the failure is only logged.
#[derive(Default)]
pub struct ErrorChain {
    handlers: RwLock<Vec<BoxedCallback>>,
}

impl ErrorChain {
    /// Appends an error handler.
    pub fn push(&self, handler: BoxedCallback) {
        self.handlers.write().push(handler);
    }

    /// Number of registered error handlers.
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Runs every error handler against `failure`.
    pub async fn dispatch(&self, failure: HandlerFailure, env: &DispatchEnv) {
        let handlers = self.handlers.read().clone();
        if handlers.is_empty() {
            error!(
                handler = %failure.handler,
                update_id = failure.update.update_id,
                error = %failure.error,
                "Unhandled callback failure"
            );
            return;
        }

        let failure = Arc::new(failure);
        for (index, handler) in handlers.iter().enumerate() {
            let ctx = CallbackContext::new(Arc::clone(&failure.update), env.clone())
                .with_failure(Arc::clone(&failure));
            if let Err(e) = invoke(handler, Arc::new(ctx)).await {
                error!(
                    index,
                    handler = %failure.handler,
                    update_id = failure.update.update_id,
                    original = %failure.error,
                    error = %e,
                    "Error handler failed"
                );
            }
        }
    }
}

impl std::fmt::Debug for ErrorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorChain")
            .field("handlers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::extractor::Failure;
    use crate::handler::into_callback;
    use courier_core::{Chat, Message, Update};
    use parking_lot::Mutex;

    fn failure() -> HandlerFailure {
        let update = Update::message_update(9, Message::new(1, Chat::private(1)));
        HandlerFailure::new("broken", Arc::new(update), DispatchError::callback("boom"))
    }

    #[tokio::test]
    async fn test_handlers_run_in_order_despite_failures() {
        let chain = Arc::new(ErrorChain::default());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        chain.push(into_callback(move |Failure(f): Failure| {
            let log = log.clone();
            async move {
                log.lock().push(format!("first:{}", f.handler));
                Err::<(), _>("error handler broke")
            }
        }));
        let log = seen.clone();
        chain.push(into_callback(move |Failure(f): Failure| {
            let log = log.clone();
            async move { log.lock().push(format!("second:{}", f.update.update_id)) }
        }));

        let env = DispatchEnv::new(None, chain.clone());
        chain.dispatch(failure(), &env).await;

        assert_eq!(*seen.lock(), vec!["first:broken", "second:9"]);
    }

    #[tokio::test]
    async fn test_empty_chain_only_logs() {
        let chain = Arc::new(ErrorChain::default());
        let env = DispatchEnv::new(None, chain.clone());
        assert!(chain.is_empty());
        chain.dispatch(failure(), &env).await;
    }
}
