use crate::config::RelayConfig;
use anyhow::Result;
use axum::Router;
use relay_channels::{ChannelAdapter, InboundMessage, WebChatAdapter, WhatsAppCloudAdapter};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelPluginId {
    WebChat,
    Whatsapp,
}

impl ChannelPluginId {
    pub const ALL: [Self; 2] = [Self::WebChat, Self::Whatsapp];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebChat => "webchat",
            Self::Whatsapp => "whatsapp",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

pub struct LoadedChannel {
    pub plugin_id: ChannelPluginId,
    pub adapter: Arc<dyn ChannelAdapter>,
    pub router: Option<Router>,
}

pub struct ChannelLoadResult {
    pub channels: HashMap<String, Arc<dyn ChannelAdapter>>,
    pub routers: Vec<Router>,
    pub typing_support: HashMap<String, bool>,
}

pub async fn load_enabled_channels(
    cfg: &RelayConfig,
    inbound_tx: mpsc::Sender<InboundMessage>,
) -> Result<ChannelLoadResult> {
    let mut channels = HashMap::new();
    let mut routers = Vec::new();
    let mut typing_support = HashMap::new();

    for plugin_id in ChannelPluginId::ALL {
        if !plugin_enabled(cfg, plugin_id) {
            continue;
        }

        let loaded = build_plugin(plugin_id, cfg, inbound_tx.clone()).await?;
        let channel_id = loaded.plugin_id.as_str().to_string();
        typing_support.insert(channel_id.clone(), loaded.adapter.supports_typing_events());
        channels.insert(channel_id, loaded.adapter);
        if let Some(router) = loaded.router {
            routers.push(router);
        }
    }

    Ok(ChannelLoadResult {
        channels,
        routers,
        typing_support,
    })
}

fn plugin_enabled(cfg: &RelayConfig, plugin_id: ChannelPluginId) -> bool {
    match plugin_id {
        ChannelPluginId::WebChat => cfg.channels.webchat.enabled,
        ChannelPluginId::Whatsapp => cfg.channels.whatsapp.enabled,
    }
}

async fn build_plugin(
    plugin_id: ChannelPluginId,
    cfg: &RelayConfig,
    inbound_tx: mpsc::Sender<InboundMessage>,
) -> Result<LoadedChannel> {
    match plugin_id {
        ChannelPluginId::WebChat => {
            let webchat = Arc::new(WebChatAdapter::new());
            webchat.start(inbound_tx).await?;
            let router = Some(webchat.clone().router());
            let adapter: Arc<dyn ChannelAdapter> = webchat;
            Ok(LoadedChannel {
                plugin_id,
                adapter,
                router,
            })
        }
        ChannelPluginId::Whatsapp => {
            let whatsapp = &cfg.channels.whatsapp;
            let adapter = Arc::new(
                WhatsAppCloudAdapter::new(&whatsapp.access_token, &whatsapp.phone_number_id)?
                    .with_api_base_url(whatsapp.api_base_url.clone())
                    .with_webhook(&whatsapp.webhook_verify_token, whatsapp.app_secret.clone()),
            );
            adapter.start(inbound_tx).await?;
            let router = Some(adapter.clone().webhook_router());
            let adapter: Arc<dyn ChannelAdapter> = adapter;
            Ok(LoadedChannel {
                plugin_id,
                adapter,
                router,
            })
        }
    }
}

/// Builds an adapter that can send without serving any inbound traffic.
pub fn build_one_shot_sender(cfg: &RelayConfig, channel: &str) -> Result<Arc<dyn ChannelAdapter>> {
    match ChannelPluginId::parse(channel) {
        Some(ChannelPluginId::Whatsapp) => {
            let whatsapp = &cfg.channels.whatsapp;
            Ok(Arc::new(
                WhatsAppCloudAdapter::new(&whatsapp.access_token, &whatsapp.phone_number_id)?
                    .with_api_base_url(whatsapp.api_base_url.clone()),
            ))
        }
        Some(ChannelPluginId::WebChat) => Err(anyhow::anyhow!(
            "webchat recipients only exist while the server holds their socket; use the running server's /api/v1/relay/messages/send"
        )),
        None => Err(anyhow::anyhow!("unknown channel: {channel}")),
    }
}
