//! The outbound bot collaborator.
//!
//! The dispatch core never talks to the platform itself. Callbacks receive a
//! [`BoxedBot`] and use it for whatever outbound calls they need; the runtime
//! also uses it to poll for updates.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::ApiResult;
use crate::types::Message;

/// A connected bot account.
///
/// Implementations only need [`call_api`](Bot::call_api); the typed helpers
/// are built on top of it.
#[async_trait]
pub trait Bot: Send + Sync {
    /// The bot's own user id.
    fn id(&self) -> i64;

    /// The bot's username, used to resolve `/command@username`.
    fn username(&self) -> Option<&str>;

    /// Calls a raw API method with JSON parameters and returns the `result`
    /// field of the response.
    async fn call_api(&self, method: &str, params: Value) -> ApiResult<Value>;

    /// Sends a text message to a chat.
    async fn send_message(&self, chat_id: i64, text: &str) -> ApiResult<Message> {
        let result = self
            .call_api("sendMessage", json!({ "chat_id": chat_id, "text": text }))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Answers a callback query, optionally with a notification text.
    async fn answer_callback_query(&self, query_id: &str, text: Option<&str>) -> ApiResult<()> {
        let mut params = json!({ "callback_query_id": query_id });
        if let Some(text) = text {
            params["text"] = Value::from(text);
        }
        self.call_api("answerCallbackQuery", params).await?;
        Ok(())
    }

    /// Approves a pending chat join request.
    async fn approve_chat_join_request(&self, chat_id: i64, user_id: i64) -> ApiResult<()> {
        self.call_api(
            "approveChatJoinRequest",
            json!({ "chat_id": chat_id, "user_id": user_id }),
        )
        .await?;
        Ok(())
    }

    /// Returns self as an `Arc<dyn Any>` for safe downcasting.
    ///
    /// Implementors should simply return `self`.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A shared Bot trait object.
pub type BoxedBot = Arc<dyn Bot>;

/// Attempts to downcast a [`BoxedBot`] to a concrete bot type.
pub fn downcast_bot<T: Bot + 'static>(bot: BoxedBot) -> Option<Arc<T>> {
    bot.as_any().downcast::<T>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockBot {
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl Bot for MockBot {
        fn id(&self) -> i64 {
            1
        }

        fn username(&self) -> Option<&str> {
            Some("mock_bot")
        }

        async fn call_api(&self, method: &str, params: Value) -> ApiResult<Value> {
            self.calls
                .lock()
                .unwrap()
                .push((method.to_string(), params.clone()));
            match method {
                "sendMessage" => Ok(json!({
                    "message_id": 11,
                    "chat": {"id": params["chat_id"], "type": "private"},
                    "text": params["text"],
                })),
                _ => Err(ApiError::NotConnected),
            }
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[tokio::test]
    async fn test_send_message_decodes_result() {
        let bot = MockBot::default();
        let sent = bot.send_message(77, "hi").await.unwrap();
        assert_eq!(sent.chat.id, 77);
        assert_eq!(sent.text(), Some("hi"));
        assert_eq!(bot.calls.lock().unwrap()[0].0, "sendMessage");
    }

    #[tokio::test]
    async fn test_errors_propagate() {
        let bot = MockBot::default();
        let err = bot.approve_chat_join_request(1, 2).await.unwrap_err();
        assert!(matches!(err, ApiError::NotConnected));
    }

    #[test]
    fn test_downcast() {
        let bot: BoxedBot = Arc::new(MockBot::default());
        assert!(downcast_bot::<MockBot>(bot).is_some());
    }
}
