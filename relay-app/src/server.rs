//! relaybot server: channels in, per-user drain loops, replies out.

use crate::channel_plugins;
use crate::commands::CommandRouter;
use crate::config::RelayConfig;
use crate::conversation::{self, ConversationStore};
use crate::gateway::Gateway;
use crate::relay::{PendingItem, RelayProcessor};
use crate::routes;
use anyhow::Result;
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use relay_channels::{ChannelAdapter, OutboundMessage};
use relay_llm::AssistantsClient;
use relay_queue::{DeadLetterLog, DrainDispatcher};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct RelayState {
    pub started_at: Instant,
    pub channels: HashMap<String, Arc<dyn ChannelAdapter>>,
    pub dispatcher: Arc<DrainDispatcher<PendingItem>>,
    pub conversations: Arc<ConversationStore>,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = RelayConfig::load_with_path(config_path).await?;
    let client = build_assistants_client(&cfg)?;
    tracing::info!(
        assistant_id = %cfg.general.assistant_id,
        assistant_api_base_url = %client.base_url(),
        bind_addr = %cfg.bind_addr()?,
        whatsapp_enabled = cfg.channels.whatsapp.enabled,
        webchat_enabled = cfg.channels.webchat.enabled,
        failure_policy = ?cfg.queue.failure_policy,
        config_path = %path.display(),
        "config ok"
    );
    Ok(())
}

pub async fn send_one_shot(
    config_path: Option<PathBuf>,
    channel: &str,
    recipient: &str,
    message: &str,
) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let adapter = channel_plugins::build_one_shot_sender(&cfg, channel)?;
    adapter
        .send(recipient, OutboundMessage::text(message))
        .await?;
    tracing::info!(channel, recipient, "one-shot message sent");
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = RelayConfig::load_with_path(config_path).await?;
    let started_at = Instant::now();
    let addr = cfg.bind_addr()?;
    tracing::info!(
        config_path = %cfg_path.display(),
        assistant_id = %cfg.general.assistant_id,
        assistant_poll_interval_ms = cfg.assistant.poll_interval_ms,
        assistant_run_timeout_seconds = cfg.assistant.run_timeout_seconds,
        runtime_http_timeout_seconds = cfg.runtime.http_timeout_seconds,
        runtime_http_max_in_flight = cfg.runtime.http_max_in_flight,
        runtime_inbound_buffer = cfg.runtime.inbound_buffer,
        bind_addr = %addr,
        whatsapp_enabled = cfg.channels.whatsapp.enabled,
        webchat_enabled = cfg.channels.webchat.enabled,
        queue_failure_policy = ?cfg.queue.failure_policy,
        queue_dead_letter_capacity = cfg.queue.dead_letter_capacity,
        relay_typing_indicator = cfg.relay.typing_indicator,
        commands_search_keyword = %cfg.commands.search_keyword,
        commands_catalog_size = cfg.commands.catalog.len(),
        conversations_idle_ttl_seconds = cfg.conversations.idle_ttl_seconds,
        runtime_shutdown_grace_seconds = cfg.runtime.shutdown_grace_seconds,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    // Channels.
    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(cfg.runtime.inbound_buffer);
    let channel_plugins::ChannelLoadResult {
        channels,
        routers: channel_routers,
        typing_support,
    } = channel_plugins::load_enabled_channels(&cfg, inbound_tx).await?;
    tracing::info!(
        loaded_channels = channels.len(),
        typing_support = ?typing_support,
        "channel plugins loaded"
    );

    // Relay pipeline.
    let backend = Arc::new(build_assistants_client(&cfg)?);
    let processor = Arc::new(RelayProcessor::new(
        backend,
        cfg.general.assistant_id.trim(),
        cfg.relay.typing_indicator,
    )?);
    let dispatcher: Arc<DrainDispatcher<PendingItem>> = Arc::new(DrainDispatcher::new(
        processor,
        cfg.queue.failure_policy,
        Arc::new(DeadLetterLog::new(cfg.queue.dead_letter_capacity)),
    ));
    let conversations = Arc::new(ConversationStore::new());

    let gateway = Arc::new(Gateway::new(
        channels.clone(),
        CommandRouter::from_config(&cfg.commands),
        conversations.clone(),
        dispatcher.clone(),
        inbound_rx,
    ));
    let shutdown = CancellationToken::new();
    let gateway_handle = gateway.start(shutdown.child_token());
    if cfg.conversations.idle_ttl_seconds > 0 {
        conversation::spawn_idle_sweeper(
            conversations.clone(),
            Duration::from_secs(cfg.conversations.idle_ttl_seconds),
            Duration::from_secs(cfg.conversations.sweep_interval_seconds),
            shutdown.child_token(),
        );
    }
    tracing::info!(
        channel_count = channels.len(),
        channels = ?channels.keys().collect::<Vec<_>>(),
        "gateway started"
    );

    let state = Arc::new(RelayState {
        started_at,
        channels,
        dispatcher: dispatcher.clone(),
        conversations,
    });

    let mut relay_router = routes::router().layer(Extension(state));
    for plugin_router in channel_routers {
        relay_router = relay_router.merge(plugin_router);
    }

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = relay_router
        .layer(GlobalConcurrencyLimitLayer::new(
            cfg.runtime.http_max_in_flight,
        ))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.runtime.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "relaybot serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }

    let grace = Duration::from_secs(cfg.runtime.shutdown_grace_seconds);
    if dispatcher.wait_idle(grace).await {
        tracing::info!("drain loops finished");
    } else {
        let unfinished = dispatcher.registry().snapshot();
        tracing::warn!(
            users = unfinished.len(),
            pending = unfinished.iter().map(|q| q.pending).sum::<usize>(),
            grace_seconds = grace.as_secs(),
            "exiting with unprocessed messages"
        );
    }

    Ok(())
}

fn build_assistants_client(cfg: &RelayConfig) -> Result<AssistantsClient> {
    let api_key = cfg
        .openai_api_key()
        .ok_or_else(|| anyhow::anyhow!("keys.openai_api_key is required"))?;
    let mut client = AssistantsClient::new(
        api_key,
        Duration::from_secs(cfg.assistant.request_timeout_seconds),
    )?
    .with_poll_interval(Duration::from_millis(cfg.assistant.poll_interval_ms))
    .with_run_timeout(Duration::from_secs(cfg.assistant.run_timeout_seconds));
    if let Some(base_url) = cfg
        .assistant
        .api_base_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
    {
        client = client.with_base_url(base_url);
    }
    Ok(client)
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistants_client_honours_base_url_override() {
        let cfg = RelayConfig::parse(
            r#"
[general]
assistant_id = "asst_1"
[keys]
openai_api_key = "sk-test"
[assistant]
api_base_url = "http://127.0.0.1:9/v1/"
"#,
        )
        .expect("config");
        let client = build_assistants_client(&cfg).expect("client");
        assert_eq!(client.base_url(), "http://127.0.0.1:9/v1");
    }

    #[test]
    fn assistants_client_requires_api_key() {
        let cfg = RelayConfig::parse("[general]\nassistant_id = \"asst_1\"\n").expect("config");
        assert!(build_assistants_client(&cfg).is_err());
    }

    #[test]
    fn request_id_falls_back_to_missing() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_id_from_headers(&headers), "missing");
        headers.insert("x-request-id", "abc".parse().expect("header value"));
        assert_eq!(request_id_from_headers(&headers), "abc");
    }
}
