//! Pull-based update sources.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use courier_core::{ApiError, ApiResult, BoxedBot, Update};

use crate::config::PollingConfig;

/// Something the application can poll for updates.
///
/// `offset` is one past the last update the application finished; sources
/// that keep server-side state use it to confirm delivery.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn fetch(&self, offset: Option<i64>) -> ApiResult<Vec<Update>>;

    /// Confirms everything below `offset` once polling stops.
    async fn acknowledge(&self, _offset: i64) -> ApiResult<()> {
        Ok(())
    }
}

/// Long polling with `getUpdates` through a [`Bot`](courier_core::Bot).
pub struct BotPollingSource {
    bot: BoxedBot,
    config: PollingConfig,
}

impl BotPollingSource {
    pub fn new(bot: BoxedBot, config: PollingConfig) -> Self {
        Self { bot, config }
    }

    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    fn params(&self, offset: Option<i64>, timeout: u64, limit: u32) -> Value {
        let mut params = json!({ "timeout": timeout, "limit": limit });
        if let Some(offset) = offset {
            params["offset"] = Value::from(offset);
        }
        if !self.config.allowed_updates.is_empty() {
            params["allowed_updates"] = json!(self.config.allowed_updates);
        }
        params
    }
}

#[async_trait]
impl UpdateSource for BotPollingSource {
    async fn fetch(&self, offset: Option<i64>) -> ApiResult<Vec<Update>> {
        let params = self.params(offset, self.config.timeout_secs, self.config.limit);
        let result = self.bot.call_api("getUpdates", params).await?;
        let Value::Array(raw) = result else {
            return Err(ApiError::Serialization(
                "getUpdates did not return an array".to_string(),
            ));
        };

        let mut updates = Vec::with_capacity(raw.len());
        for value in raw {
            let update_id = value.get("update_id").and_then(Value::as_i64);
            match serde_json::from_value::<Update>(value) {
                Ok(update) => updates.push(update),
                Err(e) => warn!(?update_id, error = %e, "Skipping undecodable update"),
            }
        }
        debug!(count = updates.len(), ?offset, "Fetched updates");
        Ok(updates)
    }

    async fn acknowledge(&self, offset: i64) -> ApiResult<()> {
        self.bot
            .call_api("getUpdates", self.params(Some(offset), 0, 1))
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for BotPollingSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotPollingSource")
            .field("bot_id", &self.bot.id())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::{Arc, Mutex};

    use courier_core::Bot;

    use super::*;

    struct ScriptedBot {
        calls: Mutex<Vec<Value>>,
        reply: Value,
    }

    #[async_trait]
    impl Bot for ScriptedBot {
        fn id(&self) -> i64 {
            1
        }

        fn username(&self) -> Option<&str> {
            None
        }

        async fn call_api(&self, method: &str, params: Value) -> ApiResult<Value> {
            assert_eq!(method, "getUpdates");
            self.calls.lock().unwrap().push(params);
            Ok(self.reply.clone())
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    fn source(reply: Value, allowed: &[&str]) -> (Arc<ScriptedBot>, BotPollingSource) {
        let bot = Arc::new(ScriptedBot {
            calls: Mutex::new(Vec::new()),
            reply,
        });
        let config = PollingConfig {
            allowed_updates: allowed.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        (bot.clone(), BotPollingSource::new(bot, config))
    }

    #[tokio::test]
    async fn test_fetch_skips_undecodable() {
        let reply = json!([
            {"update_id": 5, "message": {"message_id": 1, "chat": {"id": 2, "type": "private"}, "text": "hi"}},
            {"update_id": 6, "message": "garbage"},
        ]);
        let (bot, source) = source(reply, &["message"]);

        let updates = source.fetch(Some(5)).await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].update_id, 5);

        let params = bot.calls.lock().unwrap()[0].clone();
        assert_eq!(params["offset"], json!(5));
        assert_eq!(params["limit"], json!(100));
        assert_eq!(params["allowed_updates"], json!(["message"]));
    }

    #[tokio::test]
    async fn test_non_array_result_is_an_error() {
        let (_, source) = source(json!({"ok": true}), &[]);
        assert!(matches!(
            source.fetch(None).await,
            Err(ApiError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_acknowledge_is_a_zero_timeout_poll() {
        let (bot, source) = source(json!([]), &[]);
        source.acknowledge(42).await.unwrap();

        let params = bot.calls.lock().unwrap()[0].clone();
        assert_eq!(params, json!({"timeout": 0, "limit": 1, "offset": 42}));
    }
}
