use log::{error, info};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use stonebot::backend::cache::AppCache;
use stonebot::backend::chat::ChatSender;
use stonebot::backend::config::{save_refresh_token, FileConfigSource};
use stonebot::backend::diagnostics::{LogLevel, MessageLog};
use stonebot::backend::twitch::{
    authorize_url, Credentials, EventSubSession, ReqwestTransport, SessionEvent, SessionOptions,
    SubscriptionPlan, SubscriptionSpec, TungsteniteConnector, TwitchEvent,
};

const REPLY_COMMAND: &str = "/reply ";

#[tokio::main]
async fn main() {
    env_logger::init();

    let log = MessageLog::new();
    let mut observer = log.subscribe();
    tokio::spawn(async move {
        // Everything already goes through env_logger, only surface problems here
        while let Ok(entry) = observer.recv().await {
            if matches!(entry.level, LogLevel::Warning | LogLevel::Error) {
                eprintln!("{}", entry);
            }
        }
    });

    let source = Arc::new(FileConfigSource::default());
    let config_file = source.path().to_path_buf();

    // Persist every rotated refresh token so the next start can skip the browser
    let (refresh_tx, mut refresh_rx) = mpsc::unbounded_channel::<Credentials>();
    tokio::spawn(async move {
        while let Some(credentials) = refresh_rx.recv().await {
            match save_refresh_token(&config_file, &credentials.refresh_token) {
                Ok(()) => info!("Saved refresh token to {}", config_file.display()),
                Err(e) => error!("Failed to save refresh token: {}", e),
            }
        }
    });

    let cache = AppCache::new(
        source,
        Arc::new(ReqwestTransport::new()),
        log.clone(),
        Some(refresh_tx),
    );

    let Some(config) = cache.config().await else {
        error!("No usable config.toml, nothing to do");
        return;
    };

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    if config.refresh_token.is_none() {
        println!(
            "Authorize the bot by opening:\n{}",
            authorize_url(
                &config.client_id,
                &config.redirect_uri,
                &config.scopes,
                false,
                None
            )
        );
        println!("Then paste the `code` parameter of the redirect here:");
        match stdin.next_line().await {
            Ok(Some(code)) => cache.provide_authorization_code(code.trim()).await,
            _ => return,
        }
    }

    let (Some(tokens), Some(broadcaster), Some(bot)) =
        (cache.tokens().await, cache.broadcaster().await, cache.bot().await)
    else {
        error!("Could not resolve credentials and identities, see log above");
        cache.shutdown();
        return;
    };
    info!("Chatting as {} in #{}", bot.login, broadcaster.login);

    let plan = SubscriptionPlan::new(
        tokens,
        vec![SubscriptionSpec::channel_chat_message(&broadcaster.id, &bot.id)],
    );
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let session = EventSubSession::new(
        Arc::new(TungsteniteConnector),
        plan,
        SessionOptions::from_config(&config.session),
        events_tx,
        log.clone(),
    )
    .spawn();

    let chat = ChatSender::new(cache.clone());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            event = events_rx.recv() => match event {
                Some(event) => print_event(event),
                // Session task is gone
                None => break,
            },
            line = stdin.next_line() => match line {
                Ok(Some(line)) => send_line(&chat, line.trim()).await,
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            },
        }
    }

    match session.shutdown().await {
        Ok(report) => info!(
            "EventSub session ended as {:?} with {} subscription(s)",
            report.state.status,
            report.subscriptions.len()
        ),
        Err(e) => error!("{}", e),
    }
    cache.shutdown();
}

fn print_event(event: SessionEvent) {
    match event {
        SessionEvent::Notification(TwitchEvent::ChatMessage(msg)) => {
            println!("[{}] {}: {}", msg.message_id, msg.chatter_user_name, msg.message.text);
        }
        SessionEvent::Notification(TwitchEvent::MessageDelete(msg)) => {
            println!("* message {} from {} deleted", msg.message_id, msg.target_user_login);
        }
        SessionEvent::Notification(TwitchEvent::ClearUserMessages(msg)) => {
            println!("* messages from {} cleared", msg.target_user_login);
        }
        SessionEvent::Notification(TwitchEvent::ChatClear(_)) => println!("* chat cleared"),
        SessionEvent::Notification(TwitchEvent::Other { subscription_type, .. }) => {
            log::debug!("Unhandled {} notification", subscription_type);
        }
        SessionEvent::StatusChanged { status, session_id } => {
            info!("EventSub {:?} {}", status, session_id.unwrap_or_default());
        }
        SessionEvent::Revoked(subscription) => {
            println!("* subscription {} revoked", subscription.subscription_type);
        }
    }
}

/// `/reply <message id> <text>` answers a message, anything else is sent as is
async fn send_line(chat: &ChatSender, line: &str) {
    if line.is_empty() {
        return;
    }

    let sent = match line.strip_prefix(REPLY_COMMAND) {
        Some(rest) => match rest.split_once(' ') {
            Some((parent, text)) => chat.send(text, Some(parent)).await,
            None => {
                println!("usage: /reply <message id> <text>");
                return;
            }
        },
        None => chat.send(line, None).await,
    };

    if !sent {
        println!("! message not sent");
    }
}
