//! The standard filter + callback handler and its builder.

use std::sync::Arc;

use async_trait::async_trait;

use courier_core::Update;

use super::callback::{BoxedCallback, Callback, into_callback, invoke};
use super::traits::UpdateHandler;
use crate::context::CallbackContext;
use crate::error::DispatchResult;
use crate::filter::{BoxedFilter, Filter, FilterResult, MatchResult};
use crate::transition::Transition;

/// A handler that runs a callback when its filter matches.
///
/// Data produced by the filter is merged into the callback context before the
/// callback runs.
#[derive(Clone)]
pub struct Handler {
    name: Arc<str>,
    filter: BoxedFilter,
    callback: BoxedCallback,
    block: Option<bool>,
}

impl Handler {
    /// Creates a handler from a filter and a callback.
    pub fn new<F, T>(filter: impl Filter, callback: F) -> Self
    where
        F: Callback<T>,
        T: 'static,
    {
        HandlerBuilder::new("update", filter).callback(callback)
    }

    /// The handler's filter.
    pub fn filter(&self) -> &BoxedFilter {
        &self.filter
    }
}

#[async_trait]
impl UpdateHandler for Handler {
    fn name(&self) -> &str {
        &self.name
    }

    fn block(&self) -> Option<bool> {
        self.block
    }

    async fn check(&self, update: &Update) -> FilterResult {
        self.filter.check(update)
    }

    async fn handle(
        &self,
        ctx: Arc<CallbackContext>,
        matched: MatchResult,
    ) -> DispatchResult<Transition> {
        ctx.merge_matches(matched.into_data());
        invoke(&self.callback, ctx).await
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("filter", &self.filter)
            .field("block", &self.block)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// HandlerBuilder
// ============================================================================

/// Collects a handler's configuration until its callback is supplied.
///
/// Created by the routing functions such as [`on_message`](crate::on_message).
///
/// ```rust,ignore
/// let handler = on_message(filter::text())
///     .name("echo")
///     .block(false)
///     .callback(echo);
/// ```
#[must_use = "a handler builder does nothing until `.callback()` is called"]
pub struct HandlerBuilder {
    kind: &'static str,
    filter: BoxedFilter,
    name: Option<String>,
    block: Option<bool>,
}

impl HandlerBuilder {
    /// Starts a builder for a handler of the given kind.
    pub fn new(kind: &'static str, filter: impl Filter) -> Self {
        Self {
            kind,
            filter: BoxedFilter::new(filter),
            name: None,
            block: None,
        }
    }

    /// Sets the handler name. Defaults to the kind and the callback's type.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Overrides the dispatcher's default blocking behaviour.
    pub fn block(mut self, block: bool) -> Self {
        self.block = Some(block);
        self
    }

    /// Adds a filter that must match as well.
    pub fn filter(mut self, extra: impl Filter) -> Self {
        self.filter = self.filter.and(extra);
        self
    }

    /// Finishes the handler with its callback.
    pub fn callback<F, T>(self, callback: F) -> Handler
    where
        F: Callback<T>,
        T: 'static,
    {
        let name = self
            .name
            .unwrap_or_else(|| format!("{}:{}", self.kind, std::any::type_name::<F>()));
        Handler {
            name: Arc::from(name),
            filter: self.filter,
            callback: into_callback(callback),
            block: self.block,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ErrorChain;
    use crate::context::DispatchEnv;
    use crate::extractor::Matches;
    use crate::filter::{self, data_filter_fn};
    use courier_core::{Chat, Message};
    use serde_json::json;

    fn update(text: &str) -> Update {
        Update::message_update(1, Message::new(1, Chat::private(1)).with_text(text))
    }

    #[tokio::test]
    async fn test_match_data_reaches_callback() {
        let handler = HandlerBuilder::new("test", filter::text_starts_with("say"))
            .name("say")
            .callback(|m: Matches| async move {
                assert_eq!(m.get("rest"), Some(&json!("hi")));
            });
        assert_eq!(handler.name(), "say");

        let update = Arc::new(update("say hi"));
        let matched = handler.check(&update).await.unwrap();
        assert!(matched.is_match());

        let env = DispatchEnv::new(None, Arc::new(ErrorChain::default()));
        let ctx = Arc::new(CallbackContext::new(update, env));
        handler.handle(ctx.clone(), matched).await.unwrap();
        assert_eq!(ctx.match_value("rest"), Some(json!("hi")));
    }

    #[tokio::test]
    async fn test_extra_filter_is_conjunctive() {
        let handler = HandlerBuilder::new("test", filter::text())
            .filter(data_filter_fn("never", |_| None))
            .block(false)
            .callback(|| async {});
        assert_eq!(handler.block(), Some(false));
        assert!(!handler.check(&update("x")).await.unwrap().is_match());
    }
}
