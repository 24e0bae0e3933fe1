#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use tokio::time::Instant;
use tracing::debug;

use super::props::PropStore;
use super::speaker::Speaker;

pub const GREETZ: [&str; 20] = [
	"yo #",
	"yo #",
	"yo yo #",
	"yo yo yo #",
	"yo yo yo # whats up!",
	"heyo #",
	"yooo # good to see u",
	"good to see u #",
	"hi #",
	"hello #",
	"helo #",
	"whats up #",
	"hey #, whats up?",
	"welcome #",
	"welcome in, #",
	"greetings #",
	"hows it going #",
	"hey whats new with you #",
	"how have you been #",
	"#!",
];

pub const GREETZ_ALSO: [&str; 11] = [
	"also hi #",
	"also hi # whats up!",
	"also its good to see u #",
	"also whats up #",
	"also, whats up #?",
	"also welcome #",
	"also welcome in, #",
	"also welcome to chat, #",
	"also welcome to the stream, #",
	"also hows it going #",
	"also how have you been #",
];

pub const GREETZ_WELCOME_BACK: [&str; 6] = [
	"welcome back #",
	"welcome back in, #",
	"welcome back to chat, #",
	"good to see u again #",
	"hello again #",
	"hi again #",
];

pub const GREETZ_WELCOME_BACK_ALSO: [&str; 6] = [
	"also welcome back #",
	"also welcome back in, #",
	"also welcome back to chat, #",
	"also good to see u again #",
	"also hello again #",
	"also hi again #",
];

/// Delay before greeting someone who just ran a command.
pub const COMMAND_GREET_DELAY: Duration = Duration::from_secs(2);

/// `@` becomes an at-mention, `#` the nickname.
pub fn expand_greeting(template: &str, username: &str, nickname: &str) -> String {
	template.replace('@', &format!("@{username}")).replace('#', nickname)
}

/// Welcomes viewers with a nickname when they show up after a while.
pub struct Greeter {
	props: Arc<PropStore>,
	speaker: Arc<dyn Speaker>,
	bot_username: String,
	command_delay: Duration,
	last_seen: Mutex<HashMap<String, Instant>>,
}

impl Greeter {
	pub fn new(props: Arc<PropStore>, speaker: Arc<dyn Speaker>, bot_username: impl Into<String>) -> Self {
		Self {
			props,
			speaker,
			bot_username: bot_username.into(),
			command_delay: COMMAND_GREET_DELAY,
			last_seen: Mutex::new(HashMap::new()),
		}
	}

	pub fn with_command_delay(mut self, delay: Duration) -> Self {
		self.command_delay = delay;
		self
	}

	/// Greet `username` if they have been away long enough; returns whether a greeting went out.
	///
	/// After a command reply the greeting is composed once the delay has passed, so a nickname
	/// changed by that command is already picked up.
	pub async fn greet(&self, username: &str, valid_command: bool, should_reply: bool) -> bool {
		if username.eq_ignore_ascii_case(&self.bot_username) {
			return false;
		}
		if self.props.get_viewer_prop(username, "nickname").await.is_null() {
			return false;
		}

		let now = Instant::now();
		let away = self.last_seen.lock().get(username).map(|seen| now.duration_since(*seen));
		let greetz_threshold = threshold(self.props.channel_int("greetz_threshold").await);
		let wb_threshold = threshold(self.props.channel_int("greetz_wb_threshold").await);
		let after_command = valid_command && should_reply;

		let (initial, back): (&'static [&'static str], &'static [&'static str]) = if after_command {
			(&GREETZ_ALSO, &GREETZ_WELCOME_BACK_ALSO)
		} else {
			(&GREETZ, &GREETZ_WELCOME_BACK)
		};
		let stock = match away {
			None => Some(initial),
			Some(away) if away > greetz_threshold => Some(initial),
			Some(away) if away > wb_threshold => Some(back),
			Some(_) => None,
		};

		let greeted = match stock {
			Some(stock) => {
				metrics::counter!("multichat_greetings_total").increment(1);
				debug!(%username, after_command, "greeting");
				if after_command {
					let props = self.props.clone();
					let speaker = self.speaker.clone();
					let username = username.to_string();
					let delay = self.command_delay;
					tokio::spawn(async move {
						tokio::time::sleep(delay).await;
						let text = compose(&props, stock, &username).await;
						speaker.say(text).await;
					});
				} else {
					let text = compose(&self.props, stock, username).await;
					self.speaker.say(text).await;
				}
				true
			}
			None => false,
		};

		self.last_seen.lock().insert(username.to_string(), now);
		greeted
	}
}

async fn compose(props: &PropStore, stock: &[&str], username: &str) -> String {
	let nickname = props.viewer_string(username, "nickname").await;
	let custom = props.viewer_string(username, "custom_greetz").await;
	let template = if custom.is_empty() {
		stock.choose(&mut rand::rng()).copied().unwrap_or("#").to_string()
	} else {
		custom
	};
	expand_greeting(&template, username, &nickname)
}

fn threshold(ms: i64) -> Duration {
	Duration::from_millis(ms.max(0) as u64)
}
