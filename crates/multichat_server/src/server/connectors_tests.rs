use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use multichat_domain::{ChatSource, PropValue};
use multichat_platform::{
	ConnectorControl, ConnectorControlRx, ConnectorEvent, ConnectorEventTx, InboundChat, PlatformConnector, status,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::connectors::{
	Build, ConnectionState, ConnectorFactory, ConnectorSupervisor, Connectors, SupervisorConfig, reconnect_on_prop_change,
};
use super::hub::{ChatHub, ChatHubConfig};
use super::props::PropStore;
use super::props_backend::InMemoryPropBackend;

struct FakeConnector {
	source: ChatSource,
	stubborn: bool,
	said: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl PlatformConnector for FakeConnector {
	fn source(&self) -> ChatSource {
		self.source
	}

	async fn run(self: Box<Self>, mut control_rx: ConnectorControlRx, events_tx: ConnectorEventTx) -> anyhow::Result<()> {
		let _ = events_tx.send(status(self.source, true, "fake up")).await;
		while let Some(ctrl) = control_rx.recv().await {
			match ctrl {
				ConnectorControl::Say { text } => {
					self.said.lock().push(text.clone());
					let line = InboundChat::new(self.source, "echo", text);
					let _ = events_tx.send(ConnectorEvent::Chat(Box::new(line))).await;
				}
				ConnectorControl::Shutdown if self.stubborn => std::future::pending::<()>().await,
				ConnectorControl::Shutdown => break,
			}
		}
		let _ = events_tx.send(status(self.source, false, "fake down")).await;
		Ok(())
	}
}

struct FakeFactory {
	source: ChatSource,
	prerequisite: Option<&'static str>,
	stubborn: bool,
	builds: AtomicUsize,
	said: Arc<Mutex<Vec<String>>>,
}

impl FakeFactory {
	fn new(source: ChatSource) -> Self {
		Self {
			source,
			prerequisite: None,
			stubborn: false,
			builds: AtomicUsize::new(0),
			said: Arc::default(),
		}
	}
}

#[async_trait]
impl ConnectorFactory for FakeFactory {
	fn source(&self) -> ChatSource {
		self.source
	}

	async fn build(&self, props: &PropStore) -> anyhow::Result<Build> {
		if let Some(prop) = self.prerequisite
			&& props.channel_string(prop).await.is_empty()
		{
			return Ok(Build::Missing(prop));
		}
		self.builds.fetch_add(1, Ordering::SeqCst);
		Ok(Build::Ready(Box::new(FakeConnector {
			source: self.source,
			stubborn: self.stubborn,
			said: self.said.clone(),
		})))
	}
}

struct Fixture {
	sup: Arc<ConnectorSupervisor>,
	factory: Arc<FakeFactory>,
	props: Arc<PropStore>,
	ingest_rx: mpsc::Receiver<ConnectorEvent>,
}

fn fixture(factory: FakeFactory) -> Fixture {
	let hub = Arc::new(ChatHub::new(ChatHubConfig::default()));
	let props = Arc::new(PropStore::new("chan", Arc::new(InMemoryPropBackend::default()), hub));
	let factory = Arc::new(factory);
	let (ingest_tx, ingest_rx) = mpsc::channel(32);
	let sup = Arc::new(ConnectorSupervisor::new(
		factory.clone(),
		props.clone(),
		ingest_tx,
		SupervisorConfig {
			shutdown_timeout: Duration::from_millis(50),
			..Default::default()
		},
	));
	Fixture {
		sup,
		factory,
		props,
		ingest_rx,
	}
}

async fn wait_for_state(sup: &ConnectorSupervisor, want: ConnectionState) {
	timeout(Duration::from_millis(500), async {
		while sup.state() != want {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.unwrap_or_else(|_| panic!("never reached {want:?}, stuck at {:?}", sup.state()));
}

#[tokio::test]
async fn connect_is_idempotent() {
	let f = fixture(FakeFactory::new(ChatSource::Kick));

	assert!(f.sup.connect().await);
	wait_for_state(&f.sup, ConnectionState::Connected).await;
	assert!(!f.sup.connect().await);
	assert_eq!(f.factory.builds.load(Ordering::SeqCst), 1);

	let report = f.sup.status();
	assert!(report.connected);
	assert_eq!(report.detail, "fake up");
	assert!(report.connected_since_ms.is_some());
}

#[tokio::test]
async fn disabled_channel_never_connects() {
	let f = fixture(FakeFactory::new(ChatSource::Owncast));
	f.props.set_channel_prop("enabled", PropValue::Bool(false)).await.unwrap();

	assert!(!f.sup.connect().await);
	assert_eq!(f.sup.state(), ConnectionState::Disconnected);
	assert_eq!(f.factory.builds.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_prerequisite_leaves_state_alone() {
	let mut factory = FakeFactory::new(ChatSource::YouTube);
	factory.prerequisite = Some("youtube_id");
	let f = fixture(factory);

	assert!(!f.sup.connect().await);
	assert_eq!(f.sup.state(), ConnectionState::Disconnected);
	assert!(f.sup.status().last_error.is_none());

	f.props.set_channel_prop("youtube_id", PropValue::from("UC1")).await.unwrap();
	assert!(f.sup.connect().await);
	wait_for_state(&f.sup, ConnectionState::Connected).await;
}

#[tokio::test]
async fn disconnect_stops_cooperative_connector() {
	let f = fixture(FakeFactory::new(ChatSource::Kick));
	f.sup.connect().await;
	wait_for_state(&f.sup, ConnectionState::Connected).await;

	assert!(f.sup.disconnect().await);
	assert_eq!(f.sup.state(), ConnectionState::Disconnected);
	assert!(!f.sup.disconnect().await, "nothing left to stop");

	assert!(f.sup.connect().await);
	wait_for_state(&f.sup, ConnectionState::Connected).await;
	assert_eq!(f.factory.builds.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn disconnect_is_forced_after_timeout() {
	let mut factory = FakeFactory::new(ChatSource::Owncast);
	factory.stubborn = true;
	let f = fixture(factory);
	f.sup.connect().await;
	wait_for_state(&f.sup, ConnectionState::Connected).await;

	let started = tokio::time::Instant::now();
	timeout(Duration::from_millis(500), f.sup.disconnect())
		.await
		.expect("disconnect must not hang");
	assert!(started.elapsed() >= Duration::from_millis(50));
	assert_eq!(f.sup.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn say_only_reaches_connected_session() {
	let mut f = fixture(FakeFactory::new(ChatSource::Twitch));
	assert!(!f.sup.say("nobody home".to_string()).await);

	f.sup.connect().await;
	wait_for_state(&f.sup, ConnectionState::Connected).await;
	assert!(f.sup.say("hello".to_string()).await);

	let ev = timeout(Duration::from_millis(250), f.ingest_rx.recv())
		.await
		.expect("timed out")
		.expect("closed");
	let ConnectorEvent::Chat(line) = ev else {
		panic!("expected chat, got {ev:?}");
	};
	assert_eq!(line.text, "hello");
	assert_eq!(*f.factory.said.lock(), vec!["hello"]);
}

fn supervisor(factory: Arc<FakeFactory>, props: &Arc<PropStore>) -> Arc<ConnectorSupervisor> {
	let (ingest_tx, _ingest_rx) = mpsc::channel(32);
	Arc::new(ConnectorSupervisor::new(
		factory,
		props.clone(),
		ingest_tx,
		SupervisorConfig::default(),
	))
}

async fn wait_for_builds(factory: &FakeFactory, n: usize) {
	timeout(Duration::from_millis(500), async {
		while factory.builds.load(Ordering::SeqCst) < n {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.unwrap_or_else(|_| panic!("expected {n} builds"));
}

#[tokio::test]
async fn target_change_reconnects_only_that_platform() {
	let hub = Arc::new(ChatHub::new(ChatHubConfig::default()));
	let props = Arc::new(PropStore::new("chan", Arc::new(InMemoryPropBackend::default()), hub));
	let mut yt = FakeFactory::new(ChatSource::YouTube);
	yt.prerequisite = Some("youtube_id");
	let yt = Arc::new(yt);
	let kick = Arc::new(FakeFactory::new(ChatSource::Kick));
	let connectors = Connectors {
		twitch: supervisor(Arc::new(FakeFactory::new(ChatSource::Twitch)), &props),
		youtube: supervisor(yt.clone(), &props),
		owncast: supervisor(Arc::new(FakeFactory::new(ChatSource::Owncast)), &props),
		kick: supervisor(kick.clone(), &props),
	};
	reconnect_on_prop_change(&props, &connectors);
	connectors.kick.connect().await;

	props.set_channel_prop("youtube_id", PropValue::from("UC1")).await.unwrap();
	wait_for_builds(&yt, 1).await;
	wait_for_state(&connectors.youtube, ConnectionState::Connected).await;

	props.set_channel_prop("youtube_id", PropValue::from("UC2")).await.unwrap();
	wait_for_builds(&yt, 2).await;
	wait_for_state(&connectors.youtube, ConnectionState::Connected).await;
	assert_eq!(kick.builds.load(Ordering::SeqCst), 1);

	props.set_channel_prop("youtube_id", PropValue::Null).await.unwrap();
	wait_for_state(&connectors.youtube, ConnectionState::Disconnected).await;
	assert_eq!(yt.builds.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn disabling_stops_every_platform() {
	let hub = Arc::new(ChatHub::new(ChatHubConfig::default()));
	let props = Arc::new(PropStore::new("chan", Arc::new(InMemoryPropBackend::default()), hub));
	let connectors = Connectors {
		twitch: supervisor(Arc::new(FakeFactory::new(ChatSource::Twitch)), &props),
		youtube: supervisor(Arc::new(FakeFactory::new(ChatSource::YouTube)), &props),
		owncast: supervisor(Arc::new(FakeFactory::new(ChatSource::Owncast)), &props),
		kick: supervisor(Arc::new(FakeFactory::new(ChatSource::Kick)), &props),
	};
	reconnect_on_prop_change(&props, &connectors);
	for sup in connectors.all() {
		sup.connect().await;
		wait_for_state(sup, ConnectionState::Connected).await;
	}

	props.set_channel_prop("enabled", PropValue::Bool(false)).await.unwrap();
	for sup in connectors.all() {
		wait_for_state(sup, ConnectionState::Disconnected).await;
	}

	props.set_channel_prop("enabled", PropValue::Bool(true)).await.unwrap();
	for sup in connectors.all() {
		wait_for_state(sup, ConnectionState::Connected).await;
	}
}
