//! Log/Events/Tracker categories (spec.md §4.I / §4.M).
//!
//! `record` is the one place every other handler module logs an action: it
//! appends to the event log and, when the ring actually accepted a new
//! (non-deduplicated) entry, fans the formatted line out to `wired.log.log`
//! subscribers.

use tokio::io::AsyncWrite;

use crate::broadcast::{self, Category};
use crate::dispatch::handlers::{opt_string, HandlerOutcome, HandlerResult};
use crate::error::WiredError;
use crate::eventlog::Event;
use crate::protocol::{Field, Message};
use crate::server::Server;
use crate::users::Session;

fn format_line(event: &Event) -> String {
    if event.params.is_empty() {
        format!("{}: {}", event.kind, event.actor)
    } else {
        format!("{}: {} ({})", event.kind, event.actor, event.params.join(", "))
    }
}

fn event_message(event: &Event) -> Message {
    let mut message = Message::new("wired.events.event")
        .with("wired.events.kind", Field::String(event.kind.clone()))
        .with("wired.events.actor", Field::String(event.actor.clone()))
        .with("wired.events.date", Field::Date(event.at));
    if !event.params.is_empty() {
        message.set("wired.events.data", Field::String(event.params.join(", ")));
    }
    message
}

/// Appends an event and, if it was not deduplicated, broadcasts the
/// formatted line to every `wired.log.subscribe_log` subscriber.
pub async fn record<W>(server: &Server<W>, kind: &str, actor: &str, params: Vec<String>)
where
    W: AsyncWrite + Unpin + Send,
{
    match server.events.add_event(kind, actor, params).await {
        Ok(Some(event)) => {
            let line = Message::new("wired.log.log").with("wired.log.log", Field::String(format_line(&event)));
            broadcast::broadcast_to_subscribers(server, Category::Log, &line).await;
        }
        Ok(None) => {}
        Err(error) => tracing::warn!(%error, kind, actor, "event log write failed"),
    }
}

pub async fn subscribe_log<W>(_server: &Server<W>, session: &Session<W>, _message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    session.with_subscriptions(|s| s.log = true).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn unsubscribe_log<W>(_server: &Server<W>, session: &Session<W>, _message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    session.with_subscriptions(|s| s.log = false).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn get_archives<W>(server: &Server<W>, _session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let mut out: Vec<Message> = server
        .events
        .reply_archives()?
        .into_iter()
        .map(|name| {
            Message::new("wired.events.archive_list")
                .with("wired.events.archive", Field::String(name))
                .echo_transaction(message)
        })
        .collect();
    out.push(Message::new("wired.events.archive_list.done").echo_transaction(message));
    Ok(HandlerOutcome::Messages(out))
}

pub async fn get_events<W>(server: &Server<W>, _session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let archive = opt_string(message, "wired.events.archive");
    let events = server.events.reply_events(archive.as_deref()).await?;
    let mut out: Vec<Message> = events
        .iter()
        .map(|event| event_message(event).echo_transaction(message))
        .collect();
    out.push(Message::new("wired.events.event.done").echo_transaction(message));
    Ok(HandlerOutcome::Messages(out))
}

pub async fn tracker_register<W>(server: &Server<W>, _session: &Session<W>, _message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    if !server.config.tracker.enable_tracker {
        return Err(WiredError::TrackerNotEnabled);
    }
    Ok(HandlerOutcome::Okay)
}

pub async fn tracker_unregister<W>(server: &Server<W>, _session: &Session<W>, _message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    if !server.config.tracker.enable_tracker {
        return Err(WiredError::TrackerNotEnabled);
    }
    Ok(HandlerOutcome::Okay)
}
