#![forbid(unsafe_code)]

pub mod chat;
pub mod commands;
pub mod connectors;
pub mod dispatch;
pub mod emotes;
pub mod greet;
pub mod health;
pub mod http;
pub mod hub;
pub mod pronouns;
pub mod props;
pub mod props_backend;
pub mod speaker;

#[cfg(test)]
mod connectors_tests;

#[cfg(test)]
mod hub_tests;

#[cfg(test)]
mod props_tests;
