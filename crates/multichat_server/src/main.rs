#![forbid(unsafe_code)]

mod config;
mod server;

use std::sync::Arc;

use anyhow::Context as _;
use multichat_platform::SecretString;
use multichat_platform::assets::{ChannelIdResolver, default_providers};
use multichat_platform::pronouns::AlejoPronouns;
use multichat_platform::twitch::{HelixClient, TwitchConfig};
use multichat_platform::youtube::YouTubeClient;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::server::chat::{ChatService, sync_nicknames_into_history};
use crate::server::commands::{CommandHandler, CommandSettings};
use crate::server::connectors::{
	Connectors, PlatformSetup, SupervisorConfig, forward_prefixes_from_props, reconnect_on_prop_change,
};
use crate::server::dispatch::Dispatcher;
use crate::server::emotes::{EmoteCache, EmoteCacheConfig, load_yt_aliases};
use crate::server::greet::Greeter;
use crate::server::health::HealthState;
use crate::server::http::{HttpState, run_http_server};
use crate::server::hub::{ChatHub, ChatHubConfig, page_hash_of};
use crate::server::pronouns::{PronounCache, PronounCacheConfig};
use crate::server::props::PropStore;
use crate::server::props_backend::connect_prop_backend;
use crate::server::speaker::PrimaryChatSpeaker;

/// Capacity of the channel every connector session forwards into.
const INGEST_CHANNEL_CAPACITY: usize = 1_024;

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,multichat_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("multichat_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

/// Helix client for channel id lookups and native emotes, when app credentials are configured.
fn helix_client(cfg: &ServerConfig) -> Option<Arc<HelixClient>> {
	let (Some(client_id), Some(secret)) = (cfg.twitch.client_id.as_deref(), cfg.twitch.client_secret.clone()) else {
		info!("no twitch app credentials; native emotes and channel id lookups disabled");
		return None;
	};
	match HelixClient::new(client_id, secret, cfg.channel.clone()) {
		Ok(client) => Some(Arc::new(client)),
		Err(e) => {
			warn!(error = %e, "failed to build helix client");
			None
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let cfg = crate::config::load_server_config()?;
	info!(channel = %cfg.channel, "loaded server config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());
	let health = HealthState::new();

	let backend = connect_prop_backend(cfg.persistence.database_url.as_deref()).await?;
	let hub = Arc::new(ChatHub::new(ChatHubConfig {
		history_length: cfg.chat.history_length,
		page_hash: page_hash_of(&cfg.server.index_html),
		..ChatHubConfig::default()
	}));
	let props = Arc::new(PropStore::new(cfg.channel.clone(), backend, hub.clone()));
	if props
		.ensure_first_run(&cfg.twitch.bot_username, &cfg.chat.default_bot_nickname)
		.await
		.context("first-run setup")?
	{
		info!(channel = %cfg.channel, "first run for channel");
	}

	let helix = helix_client(&cfg);
	let resolver = helix.clone().map(|h| h as Arc<dyn ChannelIdResolver>);
	let emotes = Arc::new(EmoteCache::new(
		EmoteCacheConfig::default(),
		default_providers(helix),
		resolver,
		load_yt_aliases(&cfg.server.yt_emotes),
	)?);
	tokio::spawn(emotes.clone().run_refresher());

	let pronouns = Arc::new(PronounCache::new(
		PronounCacheConfig::default(),
		Arc::new(AlejoPronouns::new()?),
		hub.clone(),
	));
	if let Err(e) = pronouns.load_catalog().await {
		warn!(error = %format!("{e:#}"), "pronoun catalog unavailable; using built-in table");
	}

	let chat = Arc::new(ChatService::new(hub.clone(), emotes.clone(), pronouns));
	sync_nicknames_into_history(&props, hub.clone());

	let (ingest_tx, ingest_rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);
	let (prefix_tx, prefix_rx) = watch::channel(props.channel_list("fwd_cmds_yt_twitch").await);
	forward_prefixes_from_props(&props, prefix_tx);

	let oauth_token = cfg
		.twitch
		.oauth_token
		.clone()
		.unwrap_or_else(|| SecretString::new(String::new()));
	let connectors = Connectors::new(
		PlatformSetup {
			twitch: TwitchConfig::new(cfg.channel.clone(), cfg.twitch.bot_username.clone(), oauth_token),
			youtube_client: YouTubeClient::new()?,
			forward_prefixes: prefix_rx,
			owncast_display_name: cfg.chat.default_bot_nickname.clone(),
		},
		&props,
		&ingest_tx,
		&SupervisorConfig::default(),
	);
	drop(ingest_tx);

	let speaker = Arc::new(PrimaryChatSpeaker::new(
		connectors.twitch.clone(),
		chat.clone(),
		props.clone(),
		cfg.twitch.bot_username.clone(),
	));
	let commands = CommandHandler::new(
		CommandSettings {
			channel: cfg.channel.clone(),
			base_url: cfg.server.base_url.clone(),
			super_admin_username: cfg.twitch.super_admin_username.clone().unwrap_or_default(),
		},
		props.clone(),
		chat.clone(),
		speaker.clone(),
	);
	let greeter = Greeter::new(props.clone(), speaker.clone(), cfg.twitch.bot_username.clone());
	let dispatcher = Dispatcher::new(props.clone(), chat.clone(), commands, greeter, speaker);
	tokio::spawn(dispatcher.run(ingest_rx));

	reconnect_on_prop_change(&props, &connectors);
	connectors.spawn_retry_loops();

	let state = Arc::new(HttpState::new(
		hub,
		props,
		chat,
		emotes,
		connectors,
		health.clone(),
		cfg.server.admin_token.clone(),
	));
	health.mark_ready();

	run_http_server(&cfg.server.http_bind(), state).await
}
