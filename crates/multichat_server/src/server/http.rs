#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{
	AUTHORIZATION, CONNECTION, CONTENT_TYPE, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use multichat_domain::{ChatSource, PropValue};
use multichat_platform::SecretString;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, info, warn};

use super::chat::ChatService;
use super::connectors::Connectors;
use super::emotes::EmoteCache;
use super::health::HealthState;
use super::hub::{ChatHub, SubscriberSink, pump_subscriber};
use super::props::{PropStore, is_viewer_prop};

/// Minimum spacing between two writes of the `enabled` channel prop.
pub const ENABLED_COOLDOWN: Duration = Duration::from_secs(5);

pub type HttpResponse = Response<Full<Bytes>>;

pub struct HttpState {
	pub hub: Arc<ChatHub>,
	pub props: Arc<PropStore>,
	pub chat: Arc<ChatService>,
	pub emotes: Arc<EmoteCache>,
	pub connectors: Connectors,
	pub health: HealthState,
	admin_token: Option<SecretString>,
	enabled_changed_at: Mutex<Option<Instant>>,
}

impl HttpState {
	pub fn new(
		hub: Arc<ChatHub>,
		props: Arc<PropStore>,
		chat: Arc<ChatService>,
		emotes: Arc<EmoteCache>,
		connectors: Connectors,
		health: HealthState,
		admin_token: Option<SecretString>,
	) -> Self {
		Self {
			hub,
			props,
			chat,
			emotes,
			connectors,
			health,
			admin_token: admin_token.filter(|t| !t.is_empty()),
			enabled_changed_at: Mutex::new(None),
		}
	}

	fn authorize<B>(&self, req: &Request<B>) -> Result<(), HttpResponse> {
		let Some(token) = self.admin_token.as_ref() else {
			return Err(respond(StatusCode::FORBIDDEN, "admin api disabled"));
		};
		let presented = req
			.headers()
			.get(AUTHORIZATION)
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.strip_prefix("Bearer "));
		if presented == Some(token.expose()) {
			Ok(())
		} else {
			Err(respond(StatusCode::UNAUTHORIZED, "unauthorized"))
		}
	}

	/// Returns false while the previous `enabled` write is within the cooldown.
	fn take_enabled_slot(&self) -> bool {
		let now = Instant::now();
		let mut last = self.enabled_changed_at.lock();
		if let Some(at) = *last
			&& now.duration_since(at) < ENABLED_COOLDOWN
		{
			return false;
		}
		*last = Some(now);
		true
	}
}

pub fn respond(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp
}

fn json_response<T: Serialize + ?Sized>(value: &T) -> HttpResponse {
	match serde_json::to_vec(value) {
		Ok(body) => {
			let mut resp = respond(StatusCode::OK, body);
			resp.headers_mut()
				.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
			resp
		}
		Err(e) => {
			warn!(error = %e, "encoding response failed");
			respond(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
		}
	}
}

fn store_failed(e: anyhow::Error) -> HttpResponse {
	warn!(error = %format!("{e:#}"), "prop store write failed");
	respond(StatusCode::INTERNAL_SERVER_ERROR, "store write failed")
}

#[derive(Deserialize)]
struct PropBody {
	#[serde(default)]
	prop_value: serde_json::Value,
}

async fn read_prop_value<B>(body: B) -> Result<PropValue, HttpResponse>
where
	B: Body,
	B::Error: std::fmt::Display,
{
	let bytes = body
		.collect()
		.await
		.map_err(|e| respond(StatusCode::BAD_REQUEST, format!("reading body failed: {e}")))?
		.to_bytes();
	let parsed: PropBody =
		serde_json::from_slice(&bytes).map_err(|_| respond(StatusCode::BAD_REQUEST, "invalid JSON body"))?;
	PropValue::try_from(parsed.prop_value).map_err(|e| respond(StatusCode::BAD_REQUEST, e.to_string()))
}

pub async fn run_http_server(bind: &str, state: Arc<HttpState>) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind)
		.await
		.with_context(|| format!("bind http listener on {bind}"))?;
	info!(%bind, "http server listening");
	serve(listener, state).await
}

async fn serve(listener: TcpListener, state: Arc<HttpState>) -> anyhow::Result<()> {
	loop {
		let (stream, remote) = listener.accept().await.context("accept http connection")?;
		let io = TokioIo::new(stream);
		let state = state.clone();

		tokio::spawn(async move {
			let service = service_fn(move |req| {
				let state = state.clone();
				async move { Ok::<_, Infallible>(route(req, state).await) }
			});
			if let Err(e) = http1::Builder::new()
				.serve_connection(io, service)
				.with_upgrades()
				.await
			{
				debug!(%remote, error = %e, "http connection closed with error");
			}
		});
	}
}

pub async fn route<B>(req: Request<B>, state: Arc<HttpState>) -> HttpResponse
where
	B: Body + Send + 'static,
	B::Data: Send,
	B::Error: std::fmt::Display,
{
	let path = req.uri().path().to_string();
	if let Some((status, body)) = state.health.probe(&path) {
		return respond(status, body);
	}

	let method = req.method().clone();
	let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
	metrics::counter!("multichat_http_requests_total").increment(1);

	match (&method, segments.as_slice()) {
		(&Method::GET, ["ws"]) => upgrade_websocket(req, state.hub.clone()),
		(&Method::GET, ["ws", "num_clients"]) => respond(StatusCode::OK, state.hub.num_clients().to_string()),
		(&Method::GET, ["chat_history"]) => json_response(&state.hub.history()),
		(&Method::GET, ["channel_props", name]) => json_response(&state.props.get_channel_prop(name).await),
		(&Method::POST, ["channel_props", name]) => set_channel_prop(req, &state, name).await,
		(&Method::GET, ["viewers"]) => json_response(&state.props.all_viewers().await),
		(&Method::DELETE, ["viewers", username]) => {
			if let Err(resp) = state.authorize(&req) {
				return resp;
			}
			match state.props.delete_viewer(username).await {
				Ok(()) => respond(StatusCode::OK, "ok"),
				Err(e) => store_failed(e),
			}
		}
		(&Method::GET, ["viewers", username, prop]) => json_response(&state.props.get_viewer_prop(username, prop).await),
		(&Method::POST, ["viewers", username, prop]) => set_viewer_prop(req, &state, username, prop).await,
		(&Method::POST, ["clear_chat"]) => {
			if let Err(resp) = state.authorize(&req) {
				return resp;
			}
			state.chat.clear_chat();
			respond(StatusCode::OK, "ok")
		}
		(&Method::GET, ["status", "emotes"]) => json_response(&state.emotes.status()),
		(&Method::GET, ["status", source]) => match ChatSource::from_str(source) {
			Ok(source) => json_response(&state.connectors.get(source).status()),
			Err(_) => respond(StatusCode::NOT_FOUND, "unknown source"),
		},
		_ => respond(StatusCode::NOT_FOUND, "not found"),
	}
}

async fn set_channel_prop<B>(req: Request<B>, state: &HttpState, name: &str) -> HttpResponse
where
	B: Body,
	B::Error: std::fmt::Display,
{
	if let Err(resp) = state.authorize(&req) {
		return resp;
	}
	let value = match read_prop_value(req.into_body()).await {
		Ok(v) => v,
		Err(resp) => return resp,
	};
	if name == "enabled" && !state.take_enabled_slot() {
		debug!("enabled toggled too soon");
		return respond(StatusCode::OK, "wait");
	}
	match state.props.set_channel_prop(name, value).await {
		Ok(()) => respond(StatusCode::OK, "ok"),
		Err(e) => store_failed(e),
	}
}

async fn set_viewer_prop<B>(req: Request<B>, state: &HttpState, username: &str, prop: &str) -> HttpResponse
where
	B: Body,
	B::Error: std::fmt::Display,
{
	if let Err(resp) = state.authorize(&req) {
		return resp;
	}
	if !is_viewer_prop(prop) {
		return respond(StatusCode::BAD_REQUEST, "invalid prop_name");
	}
	let value = match read_prop_value(req.into_body()).await {
		Ok(v) => v,
		Err(resp) => return resp,
	};
	match state.props.set_viewer_prop(username, prop, value).await {
		Ok(()) => respond(StatusCode::OK, "ok"),
		Err(e) => store_failed(e),
	}
}

fn upgrade_websocket<B>(mut req: Request<B>, hub: Arc<ChatHub>) -> HttpResponse
where
	B: Send + 'static,
{
	let wants_upgrade = req
		.headers()
		.get(UPGRADE)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
	let accept = match req.headers().get(SEC_WEBSOCKET_KEY) {
		Some(key) if wants_upgrade => derive_accept_key(key.as_bytes()),
		_ => return respond(StatusCode::BAD_REQUEST, "expected websocket upgrade"),
	};
	let Ok(accept) = HeaderValue::from_str(&accept) else {
		return respond(StatusCode::INTERNAL_SERVER_ERROR, "bad accept key");
	};

	let on_upgrade = hyper::upgrade::on(&mut req);
	tokio::spawn(async move {
		match on_upgrade.await {
			Ok(upgraded) => {
				let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
				serve_subscriber(hub, ws).await;
			}
			Err(e) => warn!(error = %e, "websocket upgrade failed"),
		}
	});

	let mut resp = respond(StatusCode::SWITCHING_PROTOCOLS, Bytes::new());
	let headers = resp.headers_mut();
	headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
	headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
	headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
	resp
}

struct WsSink<S>(SplitSink<WebSocketStream<S>, Message>);

#[async_trait]
impl<S> SubscriberSink for WsSink<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	async fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
		self.0
			.send(Message::text(text.to_owned()))
			.await
			.context("websocket send")
	}

	async fn close(&mut self) {
		let _ = self.0.close().await;
	}
}

/// Register `ws` with the hub and pump frames until the client goes away.
pub async fn serve_subscriber<S>(hub: Arc<ChatHub>, ws: WebSocketStream<S>)
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let (sink, mut stream) = ws.split();
	let (id, rx) = hub.register();
	let pump = tokio::spawn(pump_subscriber(hub.clone(), id, rx, WsSink(sink)));

	while let Some(msg) = stream.next().await {
		match msg {
			Ok(Message::Close(_)) => break,
			Ok(_) => {}
			Err(e) => {
				debug!(subscriber_id = id, error = %e, "websocket read failed");
				break;
			}
		}
	}

	hub.unregister(id);
	let _ = pump.await;
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use multichat_platform::pronouns::PronounLookup;
	use multichat_platform::twitch::TwitchConfig;
	use multichat_platform::youtube::YouTubeClient;
	use serde_json::{Value, json};
	use tokio::sync::{mpsc, watch};
	use tokio::time::timeout;

	use super::*;
	use crate::server::connectors::{PlatformSetup, SupervisorConfig};
	use crate::server::emotes::EmoteCacheConfig;
	use crate::server::hub::ChatHubConfig;
	use crate::server::pronouns::{PronounCache, PronounCacheConfig};
	use crate::server::props_backend::InMemoryPropBackend;

	struct NoPronouns;

	#[async_trait]
	impl PronounLookup for NoPronouns {
		async fn catalog(&self) -> anyhow::Result<HashMap<String, String>> {
			Ok(HashMap::new())
		}

		async fn user_code(&self, _login: &str) -> anyhow::Result<Option<String>> {
			Ok(None)
		}
	}

	fn state(admin_token: Option<&str>) -> Arc<HttpState> {
		let hub = Arc::new(ChatHub::new(ChatHubConfig::default()));
		let props = Arc::new(PropStore::new("chan", Arc::new(InMemoryPropBackend::default()), hub.clone()));
		let emotes = Arc::new(EmoteCache::new(EmoteCacheConfig::default(), Vec::new(), None, HashMap::new()).unwrap());
		let pronouns = Arc::new(PronounCache::new(
			PronounCacheConfig::default(),
			Arc::new(NoPronouns),
			hub.clone(),
		));
		let chat = Arc::new(ChatService::new(hub.clone(), emotes.clone(), pronouns));
		let (ingest_tx, _ingest_rx) = mpsc::channel(8);
		let (_prefix_tx, prefix_rx) = watch::channel(Vec::new());
		let connectors = Connectors::new(
			PlatformSetup {
				twitch: TwitchConfig::new("chan", "bot", SecretString::new("oauth:x")),
				youtube_client: YouTubeClient::new().unwrap(),
				forward_prefixes: prefix_rx,
				owncast_display_name: "bot".to_string(),
			},
			&props,
			&ingest_tx,
			&SupervisorConfig::default(),
		);
		Arc::new(HttpState::new(
			hub,
			props,
			chat,
			emotes,
			connectors,
			HealthState::new(),
			admin_token.map(SecretString::new),
		))
	}

	fn request(method: Method, uri: &str, token: Option<&str>, body: &str) -> Request<Full<Bytes>> {
		let mut builder = Request::builder().method(method).uri(uri);
		if let Some(token) = token {
			builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
		}
		builder.body(Full::new(Bytes::from(body.to_string()))).unwrap()
	}

	async fn call(state: &Arc<HttpState>, req: Request<Full<Bytes>>) -> (StatusCode, String) {
		let resp = route(req, state.clone()).await;
		let status = resp.status();
		let body = resp.into_body().collect().await.unwrap().to_bytes();
		(status, String::from_utf8(body.to_vec()).unwrap())
	}

	#[tokio::test]
	async fn read_endpoints() {
		let s = state(None);

		assert_eq!(call(&s, request(Method::GET, "/healthz", None, "")).await.0, StatusCode::OK);
		assert_eq!(
			call(&s, request(Method::GET, "/ws/num_clients", None, "")).await,
			(StatusCode::OK, "0".to_string())
		);
		assert_eq!(
			call(&s, request(Method::GET, "/chat_history", None, "")).await,
			(StatusCode::OK, "[]".to_string())
		);
		assert_eq!(
			call(&s, request(Method::GET, "/channel_props/enabled", None, "")).await,
			(StatusCode::OK, "true".to_string())
		);

		let (status, body) = call(&s, request(Method::GET, "/status/kick", None, "")).await;
		assert_eq!(status, StatusCode::OK);
		let report: Value = serde_json::from_str(&body).unwrap();
		assert_eq!(report["state"], "disconnected");
		assert_eq!(report["connected"], false);

		let (_, body) = call(&s, request(Method::GET, "/status/emotes", None, "")).await;
		let report: Value = serde_json::from_str(&body).unwrap();
		assert_eq!(report["num_emotes"], 0);

		assert_eq!(
			call(&s, request(Method::GET, "/status/myspace", None, "")).await.0,
			StatusCode::NOT_FOUND
		);
		assert_eq!(call(&s, request(Method::GET, "/nope", None, "")).await.0, StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn writes_need_the_admin_token() {
		let disabled = state(None);
		let body = r#"{"prop_value":"UC1"}"#;
		assert_eq!(
			call(&disabled, request(Method::POST, "/channel_props/youtube_id", Some("x"), body)).await.0,
			StatusCode::FORBIDDEN
		);

		let s = state(Some("secret"));
		assert_eq!(
			call(&s, request(Method::POST, "/channel_props/youtube_id", None, body)).await.0,
			StatusCode::UNAUTHORIZED
		);
		assert_eq!(
			call(&s, request(Method::POST, "/channel_props/youtube_id", Some("wrong"), body)).await.0,
			StatusCode::UNAUTHORIZED
		);
		assert_eq!(
			call(&s, request(Method::POST, "/channel_props/youtube_id", Some("secret"), body)).await,
			(StatusCode::OK, "ok".to_string())
		);
		assert_eq!(s.props.channel_string("youtube_id").await, "UC1");
		assert!(s.connectors.youtube.status().last_error.is_none());
	}

	#[tokio::test]
	async fn malformed_bodies_are_rejected() {
		let s = state(Some("secret"));
		assert_eq!(
			call(&s, request(Method::POST, "/channel_props/font", Some("secret"), "{nope")).await,
			(StatusCode::BAD_REQUEST, "invalid JSON body".to_string())
		);
		assert_eq!(
			call(
				&s,
				request(Method::POST, "/channel_props/font", Some("secret"), r#"{"prop_value":{"a":1}}"#)
			)
			.await
			.0,
			StatusCode::BAD_REQUEST
		);
	}

	#[tokio::test]
	async fn enabled_toggle_is_rate_limited() {
		let s = state(Some("secret"));
		let off = r#"{"prop_value":false}"#;
		let on = r#"{"prop_value":true}"#;

		assert_eq!(
			call(&s, request(Method::POST, "/channel_props/enabled", Some("secret"), off)).await.1,
			"ok"
		);
		assert_eq!(
			call(&s, request(Method::POST, "/channel_props/enabled", Some("secret"), on)).await,
			(StatusCode::OK, "wait".to_string())
		);
		assert!(!s.props.channel_bool("enabled").await);
	}

	#[tokio::test]
	async fn viewer_endpoints() {
		let s = state(Some("secret"));

		assert_eq!(
			call(
				&s,
				request(Method::POST, "/viewers/alice/favorite_color", Some("secret"), r#"{"prop_value":"red"}"#)
			)
			.await,
			(StatusCode::BAD_REQUEST, "invalid prop_name".to_string())
		);
		assert_eq!(
			call(
				&s,
				request(Method::POST, "/viewers/alice/nickname", Some("secret"), r#"{"prop_value":"Al"}"#)
			)
			.await
			.1,
			"ok"
		);
		assert_eq!(
			call(&s, request(Method::GET, "/viewers/alice/nickname", None, "")).await.1,
			"\"Al\""
		);

		let (_, body) = call(&s, request(Method::GET, "/viewers", None, "")).await;
		let viewers: Value = serde_json::from_str(&body).unwrap();
		assert_eq!(viewers["alice"]["nickname"], json!("Al"));

		assert_eq!(
			call(&s, request(Method::DELETE, "/viewers/alice", None, "")).await.0,
			StatusCode::UNAUTHORIZED
		);
		assert_eq!(
			call(&s, request(Method::DELETE, "/viewers/alice", Some("secret"), "")).await.1,
			"ok"
		);
		assert!(s.props.get_viewer_prop("alice", "nickname").await.is_null());
	}

	#[tokio::test]
	async fn plain_get_on_ws_is_rejected() {
		let s = state(None);
		assert_eq!(
			call(&s, request(Method::GET, "/ws", None, "")).await,
			(StatusCode::BAD_REQUEST, "expected websocket upgrade".to_string())
		);
	}

	#[tokio::test]
	async fn websocket_subscriber_lifecycle() {
		let hub = Arc::new(ChatHub::new(ChatHubConfig {
			page_hash: "abc123".to_string(),
			..Default::default()
		}));
		let (server_io, client_io) = tokio::io::duplex(64 * 1024);

		let server_hub = hub.clone();
		let server = tokio::spawn(async move {
			let ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
			serve_subscriber(server_hub, ws).await;
		});
		let mut client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

		let first = timeout(Duration::from_millis(250), client.next())
			.await
			.expect("timed out")
			.expect("closed")
			.unwrap();
		let frame: Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
		assert_eq!(frame, json!({ "type": "page_hash", "content": { "page_hash": "abc123" } }));
		assert_eq!(hub.num_clients(), 1);

		hub.broadcast("clear_chat", json!({}));
		let second = timeout(Duration::from_millis(250), client.next())
			.await
			.expect("timed out")
			.expect("closed")
			.unwrap();
		assert!(second.to_text().unwrap().contains("clear_chat"));

		client.close(None).await.unwrap();
		timeout(Duration::from_millis(500), server)
			.await
			.expect("subscriber never finished")
			.unwrap();
		assert_eq!(hub.num_clients(), 0);
	}
}
