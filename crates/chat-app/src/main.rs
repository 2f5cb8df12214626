use std::sync::Arc;
use std::time::Duration;

use snafu::{ResultExt, Whatever};
use tandem::chat::{ChatEngine, ConversationSnapshot, EngineConfig, Notification};
use tandem::settings::SettingsStore;
use tandem_backend::{MemoryBackend, Operation};
use tandem_storage::{
    Conversation, ConversationId, DeliveryStatus, Message, MessageBody, MessageContent, MessageId,
    SendState, UserId,
};
use tracing_subscriber::EnvFilter;

const DEMO_USER: &str = "me";
const DEMO_COUNTERPART: &str = "ana";
const DEMO_CONVERSATION: &str = "demo";

/// Scripted walk through the engine against the in-memory backend.
#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Whatever> {
    let settings = SettingsStore::load().settings();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match settings.engine_config() {
        Ok(config) => config,
        Err(error) => {
            tracing::warn!("{error}. running as '{DEMO_USER}'");
            EngineConfig::new(UserId::parse(DEMO_USER).whatever_context("demo user id")?)
        }
    };

    let conversation_id =
        ConversationId::parse(DEMO_CONVERSATION).whatever_context("demo conversation id")?;
    let counterpart = UserId::parse(DEMO_COUNTERPART).whatever_context("demo counterpart id")?;
    let backend = Arc::new(
        MemoryBackend::new(config.local_user.clone()).with_latency(Duration::from_millis(150)),
    );
    backend.insert_conversation(
        Conversation::new(conversation_id.clone(), counterpart.clone()),
        vec![Message::new(
            MessageId::parse("h-1").whatever_context("history id")?,
            conversation_id.clone(),
            counterpart.clone(),
            MessageContent::text("Ready for the long run on Saturday?"),
            1_700_000_000_000,
        )],
    );

    let (mut handle, mut notifications) = ChatEngine::spawn(backend.clone(), config);
    tokio::spawn(async move {
        while let Some(Notification::Failed {
            action,
            target,
            error,
        }) = notifications.recv().await
        {
            let target = target.map(|id| id.to_string()).unwrap_or_default();
            println!("  ! {action:?} {target} failed: {error}");
        }
    });

    handle
        .open(conversation_id.clone())
        .await
        .whatever_context("open conversation")?;
    render("opened", &handle.snapshot());

    handle.set_typing(true).whatever_context("typing")?;
    let sends = futures::future::try_join_all([
        handle.send_text("Absolutely."),
        handle.send_text("7am at the bridge?"),
    ])
    .await
    .whatever_context("send messages")?;
    render("sent (pending)", &handle.snapshot());
    tracing::debug!(?sends, "optimistic sends issued");

    backend.remote_typing(&conversation_id, &counterpart, true);
    wait_until(&mut handle, |snapshot| {
        snapshot
            .messages
            .iter()
            .all(|view| view.send_state == SendState::Confirmed)
            && !snapshot.typing_user_ids.is_empty()
    })
    .await?;
    render("confirmed, counterpart typing", &handle.snapshot());

    let reply = backend
        .remote_send(
            &conversation_id,
            counterpart.clone(),
            MessageContent::sticker("thumbs-up"),
        )
        .whatever_context("remote reply")?;
    wait_until(&mut handle, |snapshot| snapshot.message(reply.id.as_str()).is_some()).await?;
    handle
        .react(reply.id.clone(), "🔥")
        .await
        .whatever_context("react")?;

    let own = handle
        .snapshot()
        .messages
        .iter()
        .rev()
        .find(|view| view.delivery.is_some())
        .map(|view| view.id.clone());
    if let Some(own) = own {
        backend.remote_read(&conversation_id, &own);
        backend.fail_next(Operation::Edit, 1);
        handle
            .edit(own.clone(), MessageContent::text("6am at the bridge?"))
            .await
            .whatever_context("edit")?;
        render("edit applied locally", &handle.snapshot());
        wait_until(&mut handle, |snapshot| snapshot.changing.is_empty()).await?;
    }

    render("final", &handle.snapshot());
    handle.close().await.whatever_context("close conversation")?;
    handle.shutdown();
    Ok(())
}

async fn wait_until(
    handle: &mut tandem::ChatHandle,
    predicate: impl Fn(&ConversationSnapshot) -> bool,
) -> Result<(), Whatever> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !predicate(&handle.snapshot()) {
        tokio::time::timeout_at(deadline, handle.changed())
            .await
            .whatever_context("timed out waiting for the snapshot")?
            .whatever_context("engine stopped")?;
    }
    Ok(())
}

fn render(title: &str, snapshot: &ConversationSnapshot) {
    println!("== {title} (v{})", snapshot.version);
    for view in snapshot.messages.iter() {
        let body = match &view.body {
            MessageBody::Tombstone => "<deleted>".to_string(),
            MessageBody::Content(MessageContent::Text { body }) => body.clone(),
            MessageBody::Content(MessageContent::Sticker { token }) => format!("[sticker {token}]"),
            MessageBody::Content(MessageContent::ActivityShare { title, .. }) => {
                format!("[activity {title}]")
            }
            MessageBody::Content(MessageContent::AchievementShare { title, .. }) => {
                format!("[achievement {title}]")
            }
        };
        let state = match &view.send_state {
            SendState::Confirmed => String::new(),
            SendState::Pending => " (sending)".to_string(),
            SendState::Failed { reason } => format!(" (failed: {reason})"),
        };
        let delivery = match view.delivery {
            Some(DeliveryStatus::Sent) => " ✓",
            Some(DeliveryStatus::Delivered) => " ✓✓",
            Some(DeliveryStatus::Read) => " read",
            None => "",
        };
        let edited = if view.edited { " (edited)" } else { "" };
        let reactions: String = view
            .reaction_counts
            .iter()
            .map(|count| format!(" {}{}", count.emoji, count.count))
            .collect();
        println!(
            "  {:>6}: {body}{edited}{state}{delivery}{reactions}",
            view.sender_id
        );
    }
    if !snapshot.typing_user_ids.is_empty() {
        let typing: Vec<&str> = snapshot
            .typing_user_ids
            .iter()
            .map(UserId::as_str)
            .collect();
        println!("  {} typing...", typing.join(", "));
    }
}
