//! Conversation Bot Example
//!
//! A sign-up dialogue driven from the terminal. Every line typed on stdin
//! becomes a private message from the same user; the bot's replies are
//! printed back.
//!
//! ```text
//! /start ──▶ NAME ──(text)──▶ AGE ──(digits)──▶ done
//!              │                 │
//!              └──── /cancel ────┴──▶ cancelled
//! ```
//!
//! Idle for longer than `--timeout` seconds and the conversation expires.
//!
//! # Usage
//!
//! ```bash
//! cargo run --package conversation-bot -- --timeout 30
//! ```

use std::any::Any;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use courier::core::{ApiError, ApiResult};
use courier::prelude::*;
use serde_json::{Value, json};

const CHAT_ID: i64 = 1000;
const USER_ID: i64 = 42;

#[derive(Debug, Parser)]
#[command(about = "Sign-up conversation on the console")]
struct Args {
    /// Configuration file (defaults to ./courier.toml if present).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Idle seconds before the conversation expires.
    #[arg(long, default_value_t = 120)]
    timeout: u64,
}

// ============================================================================
// Console Bot
// ============================================================================

/// Prints outgoing messages instead of sending them anywhere.
#[derive(Default)]
struct ConsoleBot {
    next_message_id: AtomicI64,
}

#[async_trait]
impl Bot for ConsoleBot {
    fn id(&self) -> i64 {
        1
    }

    fn username(&self) -> Option<&str> {
        Some("console_bot")
    }

    async fn call_api(&self, method: &str, params: Value) -> ApiResult<Value> {
        match method {
            "sendMessage" => {
                let text = params["text"].as_str().unwrap_or_default();
                println!("bot> {text}");
                Ok(json!({
                    "message_id": self.next_message_id.fetch_add(1, Ordering::Relaxed),
                    "chat": { "id": params["chat_id"], "type": "private" },
                    "text": text,
                }))
            }
            other => Err(ApiError::Other(format!("{other} is not supported on the console"))),
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ============================================================================
// Conversation callbacks
// ============================================================================

async fn start(msg: Message, bot: BoxedBot) -> Result<State> {
    bot.send_message(msg.chat.id, "Welcome! What's your name? (/cancel to stop)")
        .await?;
    Ok(State::new("NAME"))
}

async fn name(msg: Message, bot: BoxedBot, UserData(data): UserData) -> Result<State> {
    let name = msg.text().unwrap_or_default().trim().to_string();
    bot.send_message(msg.chat.id, &format!("Nice to meet you, {name}. How old are you?"))
        .await?;
    data.lock().insert("name".into(), Value::from(name));
    Ok(State::new("AGE"))
}

async fn age(msg: Message, bot: BoxedBot, UserData(data): UserData) -> Result<Transition> {
    let text = msg.text().unwrap_or_default().trim();
    let Ok(age) = text.parse::<u8>() else {
        bot.send_message(msg.chat.id, "Please answer with a number.")
            .await?;
        return Ok(Transition::Stay);
    };

    let name = data
        .lock()
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("stranger")
        .to_string();
    bot.send_message(msg.chat.id, &format!("Signed up {name}, age {age}. Bye!"))
        .await?;
    Ok(Transition::End)
}

async fn cancel(msg: Message, bot: BoxedBot) -> Result<Transition> {
    bot.send_message(msg.chat.id, "Sign-up cancelled.").await?;
    Ok(Transition::End)
}

async fn expired(timeout: TimeoutExpired, chat: Chat, bot: BoxedBot) -> Result<()> {
    tracing::info!(?timeout, "Conversation expired");
    bot.send_message(chat.id, "You went quiet, so I stopped the sign-up. /start to retry.")
        .await?;
    Ok(())
}

async fn unknown(msg: Message, bot: BoxedBot) -> Result<()> {
    bot.send_message(msg.chat.id, "Send /start to sign up.").await?;
    Ok(())
}

async fn report(Failure(failure): Failure) {
    tracing::error!(handler = %failure.handler, error = %failure.error, "Callback failed");
}

fn register(app: &Application, timeout: Duration) -> Result<()> {
    let dispatcher = app.dispatcher();
    let plain_text = || filter::text().and(filter::command().not());

    let signup = dispatcher
        .conversation("signup")
        .entry_point(on_command(["start"]).callback(start))
        .state("NAME", [on_message(plain_text()).callback(name)])
        .state("AGE", [on_message(plain_text()).callback(age)])
        .fallback(on_command(["cancel"]).callback(cancel))
        .timeout(timeout)
        .timeout_handler(on_update(filter::all()).callback(expired))
        .build()?;

    dispatcher.add_handler(signup, 0)?;
    dispatcher.add_handler(on_message(filter::all()).name("unknown").callback(unknown), 1)?;
    dispatcher.add_error_handler(report);
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut builder = Application::builder().bot(Arc::new(ConsoleBot::default()));
    if let Some(path) = &args.config {
        builder = builder.config_file(path);
    }
    let app = builder.build()?;
    register(&app, Duration::from_secs(args.timeout))?;

    // Stdin is read on a plain thread so a pending read never holds up shutdown.
    let intake = app.intake();
    let shutdown = app.shutdown_token();
    std::thread::spawn(move || {
        for (update_id, line) in (1..).zip(std::io::stdin().lock().lines()) {
            let Ok(line) = line else { break };
            let msg = Message::new(update_id, Chat::private(CHAT_ID))
                .with_from(User::new(USER_ID, "You"))
                .with_text(line);
            if intake
                .blocking_submit(Update::message_update(update_id, msg))
                .is_err()
            {
                break;
            }
        }
        shutdown.cancel();
    });

    app.run().await?;
    Ok(())
}
