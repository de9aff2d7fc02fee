pub mod auth;
pub mod bridge;
pub mod chat_room;
pub mod codec_catalogue;
pub mod conference;
pub mod conference_store;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod iq_router;
pub mod participant;
mod pinger;
pub mod rate_limit;
pub mod reservation;
pub mod session;
pub mod sourceset;
mod stanza_filter;
mod tls;
mod util;

pub use crate::{
  auth::{AdmissionRequest, Authenticator, SessionToken},
  bridge::{Bridge, BridgeSelector},
  chat_room::{ChatRoom, RoomEvent},
  conference::{Conference, ConferenceConfig, ConferenceState, FeatureFlags},
  conference_store::ConferenceStore,
  config::FocusConfig,
  connection::{Authentication, Connection},
  dispatcher::Dispatcher,
  error::{FocusError, Result},
  participant::{Participant, Role},
  sourceset::{MediaType, Source, SourceGroup, SourceSet},
};

#[cfg(feature = "tracing-subscriber")]
pub fn init_tracing(level: tracing::Level) {
  tracing_subscriber::fmt()
    .with_max_level(level)
    .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
    .with_target(false)
    .init();
}
