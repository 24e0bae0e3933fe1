#![forbid(unsafe_code)]

use std::sync::Arc;

use multichat_domain::ChatSource;
use multichat_platform::{ConnectorEvent, InboundChat};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::chat::ChatService;
use super::commands::CommandHandler;
use super::greet::Greeter;
use super::props::PropStore;
use super::speaker::{Speaker, say_later};

/// Consumes the shared ingest channel fed by every connector.
pub struct Dispatcher {
	props: Arc<PropStore>,
	chat: Arc<ChatService>,
	commands: CommandHandler,
	greeter: Greeter,
	speaker: Arc<dyn Speaker>,
}

impl Dispatcher {
	pub fn new(
		props: Arc<PropStore>,
		chat: Arc<ChatService>,
		commands: CommandHandler,
		greeter: Greeter,
		speaker: Arc<dyn Speaker>,
	) -> Self {
		Self {
			props,
			chat,
			commands,
			greeter,
			speaker,
		}
	}

	pub async fn run(self, mut ingest_rx: mpsc::Receiver<ConnectorEvent>) {
		while let Some(ev) = ingest_rx.recv().await {
			self.handle(ev).await;
		}
		info!("ingest channel closed; dispatcher exiting");
	}

	pub async fn handle(&self, ev: ConnectorEvent) {
		match ev {
			ConnectorEvent::Chat(line) => self.on_chat(*line).await,
			ConnectorEvent::Announce { text, later: true } => say_later(self.speaker.clone(), text),
			ConnectorEvent::Announce { text, later: false } => self.speaker.say(text).await,
			ConnectorEvent::Status(st) => debug!(source = %st.source, connected = st.connected, "status on ingest"),
		}
	}

	async fn on_chat(&self, line: InboundChat) {
		if line.source != ChatSource::Twitch {
			self.chat
				.send_chat(line.source, &line.username, "", &line.color, &line.text, line.emotes);
			return;
		}

		let nickname = self.props.viewer_string(&line.username, "nickname").await;
		self.chat.send_chat(
			ChatSource::Twitch,
			&line.username,
			&nickname,
			&line.color,
			&line.text,
			line.emotes.clone(),
		);

		let outcome = self.commands.handle(&line, &line.username).await;
		self.greeter
			.greet(&line.username, outcome.valid_command, outcome.should_reply)
			.await;
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;
	use std::time::Duration;

	use async_trait::async_trait;
	use multichat_domain::PropValue;
	use multichat_platform::pronouns::PronounLookup;

	use super::*;
	use crate::server::commands::CommandSettings;
	use crate::server::emotes::{EmoteCache, EmoteCacheConfig};
	use crate::server::greet::{GREETZ, GREETZ_ALSO, expand_greeting};
	use crate::server::hub::{ChatHub, ChatHubConfig};
	use crate::server::pronouns::{PronounCache, PronounCacheConfig};
	use crate::server::props_backend::InMemoryPropBackend;
	use crate::server::speaker::testing::RecordingSpeaker;

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

	fn setup() -> (Dispatcher, Arc<PropStore>, Arc<ChatHub>, Arc<RecordingSpeaker>) {
		let hub = Arc::new(ChatHub::new(ChatHubConfig::default()));
		let props = Arc::new(PropStore::new("chan", Arc::new(InMemoryPropBackend::default()), hub.clone()));
		let emotes = Arc::new(EmoteCache::new(EmoteCacheConfig::default(), Vec::new(), None, HashMap::new()).unwrap());
		let pronouns = Arc::new(PronounCache::new(
			PronounCacheConfig::default(),
			Arc::new(NoPronouns),
			hub.clone(),
		));
		let chat = Arc::new(ChatService::new(hub.clone(), emotes, pronouns));
		let speaker = Arc::new(RecordingSpeaker::default());
		let commands = CommandHandler::new(
			CommandSettings {
				channel: "chan".to_string(),
				base_url: "https://bot.example".to_string(),
				super_admin_username: String::new(),
			},
			props.clone(),
			chat.clone(),
			speaker.clone(),
		);
		let greeter = Greeter::new(props.clone(), speaker.clone(), "botname").with_command_delay(Duration::from_millis(20));
		let dispatcher = Dispatcher::new(props.clone(), chat, commands, greeter, speaker.clone());
		(dispatcher, props, hub, speaker)
	}

	fn chat(source: ChatSource, user: &str, text: &str) -> ConnectorEvent {
		ConnectorEvent::Chat(Box::new(InboundChat::new(source, user, text)))
	}

	#[tokio::test]
	async fn secondary_platforms_only_feed_history() {
		let (dispatcher, props, hub, speaker) = setup();
		props.set_viewer_prop("Viewer", "nickname", PropValue::from("V")).await.unwrap();

		dispatcher.handle(chat(ChatSource::YouTube, "Viewer", "!help")).await;
		let history = hub.history();
		assert_eq!(history.len(), 1);
		assert_eq!(history[0].source, ChatSource::YouTube);
		assert_eq!(history[0].nickname, "");
		assert!(speaker.lines().is_empty());
	}

	#[tokio::test]
	async fn primary_chat_gets_nickname_and_greeting() {
		let (dispatcher, props, hub, speaker) = setup();
		props.set_viewer_prop("Alice", "nickname", PropValue::from("Al")).await.unwrap();

		dispatcher.handle(chat(ChatSource::Twitch, "Alice", "hi all")).await;
		assert_eq!(hub.history()[0].nickname, "Al");

		let greetings: Vec<String> = GREETZ.iter().map(|t| expand_greeting(t, "Alice", "Al")).collect();
		let lines = speaker.lines();
		assert_eq!(lines.len(), 1);
		assert!(greetings.contains(&lines[0]));
	}

	#[tokio::test]
	async fn command_reply_comes_before_delayed_greeting() {
		let (dispatcher, props, _hub, speaker) = setup();
		props.set_viewer_prop("Alice", "nickname", PropValue::from("Al")).await.unwrap();

		dispatcher.handle(chat(ChatSource::Twitch, "Alice", "!botpage")).await;
		assert_eq!(
			speaker.lines(),
			vec!["see the nicknames and other bot info at https://bot.example/chan"]
		);

		tokio::time::sleep(Duration::from_millis(80)).await;
		let lines = speaker.lines();
		assert_eq!(lines.len(), 2);
		let also: Vec<String> = GREETZ_ALSO.iter().map(|t| expand_greeting(t, "Alice", "Al")).collect();
		assert!(also.contains(&lines[1]));
	}

	#[tokio::test]
	async fn announcements_are_spoken() {
		let (dispatcher, _props, _hub, speaker) = setup();
		dispatcher
			.handle(ConnectorEvent::Announce {
				text: "disconnected from youtube chat".to_string(),
				later: false,
			})
			.await;
		assert_eq!(speaker.lines(), vec!["disconnected from youtube chat"]);
	}
}
