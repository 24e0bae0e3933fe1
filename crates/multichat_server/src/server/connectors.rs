#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use multichat_domain::{ChatSource, PropValue};
use multichat_platform::kick::{KickConfig, KickConnector, parse_chatroom_id};
use multichat_platform::owncast::{OwncastConfig, OwncastConnector};
use multichat_platform::twitch::{TwitchConfig, TwitchIrcConnector};
use multichat_platform::youtube::{YouTubeClient, YouTubeConfig, YouTubeConnector};
use multichat_platform::{ConnectorControl, ConnectorEvent, PlatformConnector, bounded_connector_channels};
use multichat_util::host::normalize_host;
use multichat_util::time::unix_ms_now;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::props::PropStore;

/// Supervisor knobs shared by every platform.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
	pub control_channel_capacity: usize,
	pub events_channel_capacity: usize,

	/// Wait for a connector to stop after `Shutdown` before aborting it.
	pub shutdown_timeout: Duration,

	/// Interval of the reconnect loop.
	pub retry_interval: Duration,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			control_channel_capacity: 64,
			events_channel_capacity: 1_024,
			shutdown_timeout: Duration::from_secs(5),
			retry_interval: Duration::from_secs(60),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
}

/// Outcome of preparing a connector from the current props.
pub enum Build {
	Ready(Box<dyn PlatformConnector>),

	/// A prerequisite prop is unset; not an error.
	Missing(&'static str),
}

/// Builds a fresh connector for each connection attempt.
#[async_trait]
pub trait ConnectorFactory: Send + Sync + 'static {
	fn source(&self) -> ChatSource;

	async fn build(&self, props: &PropStore) -> anyhow::Result<Build>;
}

/// Body of `/status/{source}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorReport {
	pub source: ChatSource,
	pub state: ConnectionState,
	pub connected: bool,
	pub detail: String,
	pub last_error: Option<String>,
	pub connected_since_ms: Option<i64>,
}

struct Shared {
	state: ConnectionState,
	generation: u64,
	detail: String,
	last_error: Option<String>,
	connected_since_ms: Option<i64>,
}

impl Shared {
	/// Apply a transition unless a newer session has started since.
	fn transition(&mut self, generation: u64, state: ConnectionState, detail: impl Into<String>) -> bool {
		if generation != self.generation || self.state == state {
			return false;
		}
		self.state = state;
		self.detail = detail.into();
		self.connected_since_ms = (state == ConnectionState::Connected).then(unix_ms_now);
		true
	}
}

struct Session {
	generation: u64,
	control_tx: mpsc::Sender<ConnectorControl>,
	task: JoinHandle<()>,
}

/// Owns the connection lifecycle of one platform.
///
/// At most one session runs at a time. Connector chat and announcements are
/// forwarded to the shared ingest channel.
pub struct ConnectorSupervisor {
	source: ChatSource,
	factory: Arc<dyn ConnectorFactory>,
	props: Arc<PropStore>,
	ingest_tx: mpsc::Sender<ConnectorEvent>,
	cfg: SupervisorConfig,
	shared: Arc<Mutex<Shared>>,
	session: tokio::sync::Mutex<Option<Session>>,
}

impl ConnectorSupervisor {
	pub fn new(
		factory: Arc<dyn ConnectorFactory>,
		props: Arc<PropStore>,
		ingest_tx: mpsc::Sender<ConnectorEvent>,
		cfg: SupervisorConfig,
	) -> Self {
		Self {
			source: factory.source(),
			factory,
			props,
			ingest_tx,
			cfg,
			shared: Arc::new(Mutex::new(Shared {
				state: ConnectionState::Disconnected,
				generation: 0,
				detail: String::new(),
				last_error: None,
				connected_since_ms: None,
			})),
			session: tokio::sync::Mutex::new(None),
		}
	}

	pub fn source(&self) -> ChatSource {
		self.source
	}

	pub fn state(&self) -> ConnectionState {
		self.shared.lock().state
	}

	pub fn is_connected(&self) -> bool {
		self.state() == ConnectionState::Connected
	}

	pub fn status(&self) -> ConnectorReport {
		let sh = self.shared.lock();
		ConnectorReport {
			source: self.source,
			state: sh.state,
			connected: sh.state == ConnectionState::Connected,
			detail: sh.detail.clone(),
			last_error: sh.last_error.clone(),
			connected_since_ms: sh.connected_since_ms,
		}
	}

	/// Start a session unless one is running, the channel is disabled, or a
	/// prerequisite is missing. Returns whether a session was started.
	pub async fn connect(&self) -> bool {
		let source = self.source;
		let mut session = self.session.lock().await;
		if let Some(s) = session.as_ref()
			&& !s.task.is_finished()
		{
			debug!(%source, "already connected");
			return false;
		}

		if !self.props.channel_bool("enabled").await {
			info!(%source, "bot is disabled; not connecting");
			return false;
		}

		let connector = match self.factory.build(&self.props).await {
			Ok(Build::Ready(c)) => c,
			Ok(Build::Missing(what)) => {
				debug!(%source, missing = what, "prerequisite missing; not connecting");
				return false;
			}
			Err(e) => {
				warn!(%source, error = %e, "connector setup failed");
				self.shared.lock().last_error = Some(format!("{e:#}"));
				return false;
			}
		};

		let generation = {
			let mut sh = self.shared.lock();
			sh.generation += 1;
			sh.state = ConnectionState::Connecting;
			sh.detail = "connecting".to_string();
			sh.connected_since_ms = None;
			sh.generation
		};
		info!(%source, "connecting");
		metrics::counter!("multichat_connector_attempts_total", "source" => source.as_str()).increment(1);

		let (control_tx, control_rx, events_tx, events_rx) =
			bounded_connector_channels(self.cfg.control_channel_capacity, self.cfg.events_channel_capacity);

		Self::spawn_forwarder(source, generation, events_rx, self.ingest_tx.clone(), self.shared.clone());

		let shared = self.shared.clone();
		let task = tokio::spawn(async move {
			if let Err(e) = connector.run(control_rx, events_tx).await {
				warn!(%source, error = %e, "connector exited with error");
				let mut sh = shared.lock();
				if sh.generation == generation {
					sh.last_error = Some(format!("{e:#}"));
				}
			}
		});

		*session = Some(Session {
			generation,
			control_tx,
			task,
		});
		true
	}

	fn spawn_forwarder(
		source: ChatSource,
		generation: u64,
		mut events_rx: mpsc::Receiver<ConnectorEvent>,
		ingest_tx: mpsc::Sender<ConnectorEvent>,
		shared: Arc<Mutex<Shared>>,
	) {
		tokio::spawn(async move {
			while let Some(ev) = events_rx.recv().await {
				match ev {
					ConnectorEvent::Status(st) => {
						metrics::counter!("multichat_connector_status_total", "source" => source.as_str()).increment(1);
						metrics::gauge!("multichat_connector_connected", "source" => source.as_str()).set(if st.connected {
							1.0
						} else {
							0.0
						});
						if st.connected {
							metrics::counter!("multichat_connector_connected_total", "source" => source.as_str()).increment(1);
						} else {
							metrics::counter!("multichat_connector_disconnected_total", "source" => source.as_str())
								.increment(1);
						}
						if st.last_error.is_some() {
							metrics::counter!("multichat_connector_status_errors_total", "source" => source.as_str())
								.increment(1);
						}

						let state = if st.connected {
							ConnectionState::Connected
						} else {
							ConnectionState::Disconnected
						};
						let mut sh = shared.lock();
						if sh.transition(generation, state, st.detail.clone()) {
							info!(%source, connected = st.connected, detail = %st.detail, "connector status");
						}
						if st.last_error.is_some() && sh.generation == generation {
							sh.last_error = st.last_error;
						}
					}
					ev @ (ConnectorEvent::Chat(_) | ConnectorEvent::Announce { .. }) => {
						if ingest_tx.send(ev).await.is_err() {
							debug!(%source, "ingest channel closed; forwarder exiting");
							break;
						}
					}
				}
			}

			if shared.lock().transition(generation, ConnectionState::Disconnected, "session ended") {
				metrics::gauge!("multichat_connector_connected", "source" => source.as_str()).set(0.0);
				info!(%source, "disconnected");
			}
		});
	}

	/// Stop the running session, forcing it after the shutdown timeout.
	pub async fn disconnect(&self) -> bool {
		let source = self.source;
		let mut session = self.session.lock().await;
		let Some(mut s) = session.take() else {
			return false;
		};

		info!(%source, "disconnecting");
		let _ = s.control_tx.try_send(ConnectorControl::Shutdown);
		if tokio::time::timeout(self.cfg.shutdown_timeout, &mut s.task).await.is_err() {
			warn!(%source, timeout_ms = self.cfg.shutdown_timeout.as_millis() as u64, "connector did not stop; aborting");
			s.task.abort();
		}

		self.shared
			.lock()
			.transition(s.generation, ConnectionState::Disconnected, "disconnected");
		true
	}

	pub async fn reconnect(&self) -> bool {
		self.disconnect().await;
		self.connect().await
	}

	/// Queue a line for the platform. Only delivered while connected.
	pub async fn say(&self, text: String) -> bool {
		if !self.is_connected() {
			return false;
		}
		let session = self.session.lock().await;
		let Some(s) = session.as_ref() else {
			return false;
		};
		match s.control_tx.try_send(ConnectorControl::Say { text }) {
			Ok(()) => true,
			Err(e) => {
				warn!(source = %self.source, error = %e, "dropping outbound line");
				false
			}
		}
	}

	/// Try to connect now and then on every retry interval.
	pub async fn run_retry_loop(self: Arc<Self>) {
		loop {
			self.connect().await;
			tokio::time::sleep(self.cfg.retry_interval).await;
		}
	}
}

/// Static inputs of the four platform factories.
pub struct PlatformSetup {
	pub twitch: TwitchConfig,
	pub youtube_client: YouTubeClient,
	pub forward_prefixes: watch::Receiver<Vec<String>>,
	pub owncast_display_name: String,
}

/// The four platform supervisors.
#[derive(Clone)]
pub struct Connectors {
	pub twitch: Arc<ConnectorSupervisor>,
	pub youtube: Arc<ConnectorSupervisor>,
	pub owncast: Arc<ConnectorSupervisor>,
	pub kick: Arc<ConnectorSupervisor>,
}

impl Connectors {
	pub fn new(
		setup: PlatformSetup,
		props: &Arc<PropStore>,
		ingest_tx: &mpsc::Sender<ConnectorEvent>,
		cfg: &SupervisorConfig,
	) -> Self {
		let supervise = |factory: Arc<dyn ConnectorFactory>| {
			Arc::new(ConnectorSupervisor::new(
				factory,
				props.clone(),
				ingest_tx.clone(),
				cfg.clone(),
			))
		};
		Self {
			twitch: supervise(Arc::new(TwitchFactory::new(setup.twitch))),
			youtube: supervise(Arc::new(YouTubeFactory::new(
				setup.youtube_client,
				setup.forward_prefixes,
			))),
			owncast: supervise(Arc::new(OwncastFactory::new(setup.owncast_display_name))),
			kick: supervise(Arc::new(KickFactory)),
		}
	}

	pub fn all(&self) -> [&Arc<ConnectorSupervisor>; 4] {
		[&self.twitch, &self.youtube, &self.owncast, &self.kick]
	}

	pub fn get(&self, source: ChatSource) -> &Arc<ConnectorSupervisor> {
		match source {
			ChatSource::Twitch => &self.twitch,
			ChatSource::YouTube => &self.youtube,
			ChatSource::Owncast => &self.owncast,
			ChatSource::Kick => &self.kick,
		}
	}

	pub fn spawn_retry_loops(&self) {
		for sup in self.all() {
			tokio::spawn(sup.clone().run_retry_loop());
		}
	}
}

fn spawn_reconnect(sup: &Arc<ConnectorSupervisor>) {
	let sup = sup.clone();
	tokio::spawn(async move {
		sup.reconnect().await;
	});
}

/// Reconnect a platform when its target prop changes, and all of them when
/// `enabled` flips.
pub fn reconnect_on_prop_change(props: &PropStore, connectors: &Connectors) {
	for (prop, sup) in [
		("youtube_id", &connectors.youtube),
		("owncast_url", &connectors.owncast),
		("kick_chatroom_id", &connectors.kick),
	] {
		let sup = sup.clone();
		props.add_channel_listener(prop, move |_old, _new| spawn_reconnect(&sup));
	}

	let all = connectors.clone();
	props.add_channel_listener("enabled", move |_old, new| {
		info!(enabled = ?new.as_bool(), "enabled changed; reconnecting all platforms");
		for sup in all.all() {
			spawn_reconnect(sup);
		}
	});
}

/// Keep the YouTube forward prefixes in step with `fwd_cmds_yt_twitch`.
pub fn forward_prefixes_from_props(props: &PropStore, tx: watch::Sender<Vec<String>>) {
	props.add_channel_listener("fwd_cmds_yt_twitch", move |_old, new| {
		let prefixes = new.as_list().map(<[String]>::to_vec).unwrap_or_default();
		debug!(?prefixes, "forward prefixes updated");
		let _ = tx.send(prefixes);
	});
}

/// String form of a target prop that may have been stored as a number.
fn target_prop(value: PropValue) -> String {
	match value {
		PropValue::String(s) => s.trim().to_string(),
		other => other.as_number::<u64>().map(|n| n.to_string()).unwrap_or_default(),
	}
}

pub struct TwitchFactory {
	cfg: TwitchConfig,
}

impl TwitchFactory {
	pub fn new(cfg: TwitchConfig) -> Self {
		Self { cfg }
	}
}

#[async_trait]
impl ConnectorFactory for TwitchFactory {
	fn source(&self) -> ChatSource {
		ChatSource::Twitch
	}

	async fn build(&self, _props: &PropStore) -> anyhow::Result<Build> {
		if self.cfg.channel.is_empty() {
			return Ok(Build::Missing("channel"));
		}
		if self.cfg.bot_login.is_empty() || self.cfg.oauth_token.is_empty() {
			return Ok(Build::Missing("bot credentials"));
		}
		Ok(Build::Ready(Box::new(TwitchIrcConnector::new(self.cfg.clone()))))
	}
}

pub struct YouTubeFactory {
	client: YouTubeClient,
	forward_prefixes: watch::Receiver<Vec<String>>,
}

impl YouTubeFactory {
	pub fn new(client: YouTubeClient, forward_prefixes: watch::Receiver<Vec<String>>) -> Self {
		Self {
			client,
			forward_prefixes,
		}
	}
}

#[async_trait]
impl ConnectorFactory for YouTubeFactory {
	fn source(&self) -> ChatSource {
		ChatSource::YouTube
	}

	async fn build(&self, props: &PropStore) -> anyhow::Result<Build> {
		let channel_id = target_prop(props.get_channel_prop("youtube_id").await);
		if channel_id.is_empty() {
			return Ok(Build::Missing("youtube_id"));
		}
		Ok(Build::Ready(Box::new(YouTubeConnector::new(
			YouTubeConfig::new(channel_id),
			self.client.clone(),
			self.forward_prefixes.clone(),
		))))
	}
}

pub struct OwncastFactory {
	display_name: String,
}

impl OwncastFactory {
	pub fn new(display_name: impl Into<String>) -> Self {
		Self {
			display_name: display_name.into(),
		}
	}
}

#[async_trait]
impl ConnectorFactory for OwncastFactory {
	fn source(&self) -> ChatSource {
		ChatSource::Owncast
	}

	async fn build(&self, props: &PropStore) -> anyhow::Result<Build> {
		let url = target_prop(props.get_channel_prop("owncast_url").await);
		if url.is_empty() {
			return Ok(Build::Missing("owncast_url"));
		}
		let host = normalize_host(&url).map_err(|e| anyhow::anyhow!("invalid owncast_url {url:?}: {e}"))?;
		let connector = OwncastConnector::new(OwncastConfig::new(host, self.display_name.clone()))?;
		Ok(Build::Ready(Box::new(connector)))
	}
}

pub struct KickFactory;

#[async_trait]
impl ConnectorFactory for KickFactory {
	fn source(&self) -> ChatSource {
		ChatSource::Kick
	}

	async fn build(&self, props: &PropStore) -> anyhow::Result<Build> {
		let raw = target_prop(props.get_channel_prop("kick_chatroom_id").await);
		if raw.is_empty() {
			return Ok(Build::Missing("kick_chatroom_id"));
		}
		let Some(chatroom_id) = parse_chatroom_id(&raw) else {
			anyhow::bail!("kick_chatroom_id {raw:?} is not a number");
		};
		Ok(Build::Ready(Box::new(KickConnector::new(KickConfig::new(chatroom_id)))))
	}
}
