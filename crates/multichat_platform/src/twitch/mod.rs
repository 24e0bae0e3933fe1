#![forbid(unsafe_code)]

mod connector;
mod helix;

pub use connector::{TwitchConfig, TwitchIrcConnector, emote_ranges, privmsg_to_chat};
pub use helix::{HelixClient, HelixEmote};
