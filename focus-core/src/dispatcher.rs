//! The one `StanzaFilter` that wires every inbound MUC presence, Jingle
//! signaling stanza and Jitsi stanza form (`conference`/`json-message`)
//! through to the right `Conference`. Registered on the `Connection`
//! after the `Pinger`, so ping IQs never reach here.

use std::{collections::HashMap, convert::TryFrom, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use jid::{BareJid, Jid};
use tracing::warn;
use xmpp_parsers::{
  iq::{Iq, IqType},
  message::Message,
  presence::Presence,
  stanza_error::{DefinedCondition, ErrorType, StanzaError},
  Element,
};

use focus_xmpp_parsers::{
  jingle::Jingle,
  jitsi_focus::{Conference as ConferenceRequest, JsonMessage},
  ns::JITSI_JITMEET,
};

use crate::{
  auth::{AdmissionRequest, Authenticator},
  bridge::BridgeSelector,
  conference::{Conference, ConferenceState},
  conference_store::ConferenceStore,
  config::FocusConfig,
  connection::{self, Connection},
  error::FocusError,
  rate_limit::RateLimiter,
  reservation::ReservationClient,
  sourceset::MediaType,
  stanza_filter::StanzaFilter,
};

/// Token-bucket limits on admission/login attempts, keyed by the caller's
/// claimed machine UID. Generous enough that a legitimate client retrying
/// a slow reservation backend never trips it.
const RATE_LIMIT_CAPACITY: f64 = 20.0;
const RATE_LIMIT_REFILL_PER_SEC: f64 = 0.5;

pub struct Dispatcher {
  config: FocusConfig,
  conference_store: ConferenceStore,
  bridge_selector: BridgeSelector,
  authenticator: Arc<Authenticator>,
  reservation: Option<ReservationClient>,
  connection: Connection,
  rate_limiter: RateLimiter,
}

impl Dispatcher {
  pub fn new(
    config: FocusConfig,
    conference_store: ConferenceStore,
    bridge_selector: BridgeSelector,
    authenticator: Arc<Authenticator>,
    reservation: Option<ReservationClient>,
    connection: Connection,
  ) -> Dispatcher {
    Dispatcher {
      config,
      conference_store,
      bridge_selector,
      authenticator,
      reservation,
      connection,
      rate_limiter: RateLimiter::new(RATE_LIMIT_CAPACITY, RATE_LIMIT_REFILL_PER_SEC),
    }
  }

  /// A room name that's already a bare JID is taken as-is; a short name
  /// (the HTTP `conference-request/v1` convention) is suffixed with the
  /// configured MUC domain, matching the two wire conventions in use.
  fn resolve_room(&self, raw: &str) -> Result<BareJid, FocusError> {
    let candidate = if raw.contains('@') { raw.to_owned() } else { format!("{}@{}", raw, self.config.xmpp.muc_domain) };
    candidate.parse().map_err(|_| FocusError::BadRequest("invalid room name".to_owned()))
  }

  async fn reply_result(&self, to: Jid, id: String, payload: Option<Element>) {
    let Some(own) = self.connection.jid().await else { return };
    let iq = Iq { from: Some(Jid::Full(own)), to: Some(to), id, payload: IqType::Result(payload) };
    let _ = self.connection.sender().send(iq.into()).await;
  }

  async fn reply_error(&self, to: Jid, id: String, err: &FocusError) {
    let Some(own) = self.connection.jid().await else { return };
    let stanza_error = StanzaError::new(error_type(err), defined_condition(err), "en", err.to_string());
    let iq = Iq::from_error(id, stanza_error).with_to(to).with_from(Jid::Full(own));
    let _ = self.connection.sender().send(iq.into()).await;
  }

  async fn send_message(&self, to: Jid, payload: Element) {
    let Some(own) = self.connection.jid().await else { return };
    let message = Message {
      from: Some(Jid::Full(own)),
      to: Some(to),
      id: Some(crate::util::generate_id()),
      type_: xmpp_parsers::message::MessageType::Chat,
      bodies: Default::default(),
      subjects: Default::default(),
      thread: None,
      payloads: vec![payload],
    };
    let _ = self.connection.sender().send(message.into()).await;
  }

  async fn take_presence(&self, element: Element) -> Result<()> {
    let presence = Presence::try_from(element)?;
    let Some(from) = presence.from.clone() else { return Ok(()) };
    let room = connection::bare(&from);
    let Some(conference) = self.conference_store.get_by_room(&room.to_string()).await else { return Ok(()) };
    if let Err(err) = conference.handle_presence(presence).await {
      warn!(%err, "failed to handle room presence");
    }
    Ok(())
  }

  async fn take_message(&self, element: Element) -> Result<()> {
    let message = Message::try_from(element)?;
    let Some(Jid::Full(from)) = message.from.clone() else { return Ok(()) };
    let Some(json) = message.payloads.iter().find(|e| e.is("json-message", JITSI_JITMEET)) else { return Ok(()) };
    let json = JsonMessage::try_from(json.clone())?;
    let Some(event) = json.payload.get("event").and_then(|v| v.as_str()).map(str::to_owned) else { return Ok(()) };

    let room = connection::bare(&Jid::Full(from.clone()));
    let actor = from.resource.clone();

    match event.as_str() {
      "Mute" | "MuteVideo" => {
        let Some(conference) = self.conference_store.get_by_room(&room.to_string()).await else { return Ok(()) };
        let Some(target) = json.payload.get("target").and_then(|v| v.as_str()) else { return Ok(()) };
        let media_type = if event == "Mute" { MediaType::Audio } else { MediaType::Video };
        if let Err(err) = conference.force_mute(&actor, target, media_type).await {
          warn!(%err, %actor, target, "force-mute request rejected");
        }
      },
      "Login" => {
        let Some(user_principal) = json.payload.get("user_principal").and_then(|v| v.as_str()) else { return Ok(()) };
        let Some(machine_uid) = json.payload.get("machine_uid").and_then(|v| v.as_str()) else { return Ok(()) };
        let token = self.authenticator.issue(user_principal.to_owned(), machine_uid.to_owned()).await;
        let reply = JsonMessage {
          payload: serde_json::json!({ "event": "LoginResult", "session_token": token.id }),
        };
        self.send_message(Jid::Full(from), reply.into()).await;
      },
      "Logout" => {
        if let Some(session_token) = json.payload.get("session_token").and_then(|v| v.as_str()) {
          self.authenticator.revoke(session_token).await;
        }
      },
      other => warn!(event = other, "unrecognized json-message event"),
    }
    Ok(())
  }

  async fn take_iq(&self, element: Element) -> Result<()> {
    let iq = Iq::try_from(element)?;
    let Some(from) = iq.from.clone() else { return Ok(()) };
    let id = iq.id.clone();

    match iq.payload {
      IqType::Set(payload) => {
        if let Ok(request) = ConferenceRequest::try_from(payload.clone()) {
          return self.take_conference_request(from, id, request).await;
        }
        if let Ok(jingle) = Jingle::try_from(payload) {
          return self.take_jingle(from, id, jingle).await;
        }
        Ok(())
      },
      IqType::Result(_) => {
        self.resolve_reply(&from, &id, Ok(())).await;
        Ok(())
      },
      IqType::Error(_) => {
        self.resolve_reply(&from, &id, Err(FocusError::BadRequest("peer reported an error".to_owned()))).await;
        Ok(())
      },
      IqType::Get(_) => Ok(()),
    }
  }

  async fn resolve_reply(&self, from: &Jid, id: &str, outcome: crate::error::Result<()>) {
    let Jid::Full(from) = from else { return };
    let room = connection::bare(&Jid::Full(from.clone()));
    let Some(conference) = self.conference_store.get_by_room(&room.to_string()).await else { return };
    if let Err(err) = conference.resolve_session_reply(&from.resource, id, outcome).await {
      warn!(%err, "failed to resolve a pending session reply");
    }
  }

  async fn take_jingle(&self, from: Jid, id: String, jingle: Jingle) -> Result<()> {
    let Jid::Full(from_full) = from.clone() else { return Ok(()) };
    let room = connection::bare(&from);
    let Some(conference) = self.conference_store.get_by_room(&room.to_string()).await else { return Ok(()) };

    match conference.handle_incoming_jingle(&from_full.resource, jingle).await {
      Ok(()) => self.reply_result(from, id, None).await,
      Err(err) => self.reply_error(from, id, &err).await,
    }
    Ok(())
  }

  async fn take_conference_request(&self, from: Jid, id: String, request: ConferenceRequest) -> Result<()> {
    if !self.rate_limiter.allow(&request.machine_uid) {
      self.reply_error(from, id, &FocusError::ResourceConstraint).await;
      return Ok(());
    }

    let room = match self.resolve_room(&request.room) {
      Ok(room) => room,
      Err(err) => {
        self.reply_error(from, id, &err).await;
        return Ok(());
      },
    };
    let meeting_id = room.to_string();
    let (config, connection, bridge_selector, authenticator, reservation) = (
      self.config.clone(),
      self.connection.clone(),
      self.bridge_selector.clone(),
      self.authenticator.clone(),
      self.reservation.clone(),
    );
    let conference = self
      .conference_store
      .get_or_create(&room.to_string(), move || {
        Conference::for_room(meeting_id.clone(), room, &config, &connection, bridge_selector, authenticator, reservation)
      })
      .await;

    if conference.state().await == ConferenceState::Initializing {
      if let Err(err) = conference.join().await {
        warn!(%err, "failed to join conference room");
      }
    }

    let bare_from = connection::bare(&from);
    let admission = AdmissionRequest {
      room: request.room.clone(),
      authenticated_user: Some(bare_from.to_string()),
      session_token: request.properties.get("session-token").cloned(),
      machine_uid: request.machine_uid.clone(),
    };

    match conference.handle_conference_request(admission).await {
      Ok(reply) => {
        let mut properties = HashMap::new();
        properties.insert("ready".to_owned(), reply.ready.to_string());
        if let Some(node) = reply.redirect_visitor_node {
          properties.insert("redirect-visitor-node".to_owned(), node);
        }
        let echo = ConferenceRequest { machine_uid: request.machine_uid, room: request.room, properties };
        self.reply_result(from, id, Some(echo.into())).await;
      },
      Err(err) => self.reply_error(from, id, &err).await,
    }
    Ok(())
  }
}

#[async_trait]
impl StanzaFilter for Dispatcher {
  #[tracing::instrument(level = "trace", skip(self))]
  fn filter(&self, element: &Element) -> bool {
    element.is("presence", "jabber:client")
      || element.is("iq", "jabber:client")
      || (element.is("message", "jabber:client") && element.has_child("json-message", JITSI_JITMEET))
  }

  #[tracing::instrument(level = "trace", skip(self), err)]
  async fn take(&self, element: Element) -> Result<()> {
    if element.is("presence", "jabber:client") {
      return self.take_presence(element).await;
    }
    if element.is("message", "jabber:client") {
      return self.take_message(element).await;
    }
    self.take_iq(element).await
  }
}

fn error_type(err: &FocusError) -> ErrorType {
  match err {
    FocusError::NotAuthorized | FocusError::Forbidden => ErrorType::Auth,
    FocusError::BadRequest(_) | FocusError::SourceRejected { .. } | FocusError::NotAcceptable(_) => ErrorType::Modify,
    FocusError::Timeout | FocusError::ServiceUnavailable | FocusError::ResourceConstraint | FocusError::NotConnected => {
      ErrorType::Wait
    },
    _ => ErrorType::Cancel,
  }
}

fn defined_condition(err: &FocusError) -> DefinedCondition {
  match err.stanza_condition() {
    "not-authorized" => DefinedCondition::NotAuthorized,
    "forbidden" => DefinedCondition::Forbidden,
    "not-acceptable" => DefinedCondition::NotAcceptable,
    "bad-request" => DefinedCondition::BadRequest,
    "item-not-found" => DefinedCondition::ItemNotFound,
    "service-unavailable" => DefinedCondition::ServiceUnavailable,
    "resource-constraint" => DefinedCondition::ResourceConstraint,
    "conflict" => DefinedCondition::Conflict,
    "remote-server-timeout" => DefinedCondition::RemoteServerTimeout,
    _ => DefinedCondition::InternalServerError,
  }
}
