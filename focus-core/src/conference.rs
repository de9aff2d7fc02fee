//! Component F, the conference orchestrator — the hardest component. Joins
//! its MUC room, admits and ingests participants, negotiates Jingle
//! sessions against allocated bridge capacity, propagates source changes,
//! and tears everything down on the way out. All mutating entry points are
//! expected to be invoked from behind the conference's own `IqRouter` so
//! that they run one at a time.

use std::{
  collections::HashMap,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  time::Duration,
};

use jid::{BareJid, FullJid, Jid};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, instrument, warn};
use xmpp_parsers::{jingle::ContentId, presence::Presence, Element};

use focus_xmpp_parsers::{
  colibri2::{Action as BridgeAction, ConferenceModify, Endpoint},
  jingle::{Content, Creator, Description as JingleDescription, Jingle},
  jingle_rtp::Description as RtpDescription,
  jingle_ssma::{Group as SsmaGroup, Semantics as SsmaSemantics, Source as SsmaSource},
  jitsi_focus::JsonMessage,
};

use crate::{
  auth::{AdmissionRequest, Authenticator},
  bridge::{Bridge, BridgeSelector},
  chat_room::{ChatRoom, RoomEvent},
  codec_catalogue::borda_count,
  config::{AdmissionMode, FocusConfig},
  connection::Connection,
  error::{FocusError, Result, SourceRejectionTag},
  iq_router::IqRouter,
  participant::{Participant, Role},
  reservation::ReservationClient,
  session::{IncomingSessionEvent, Session, SESSION_INITIATE_TIMEOUT},
  sourceset::{ConferenceSourceMap, GroupSemantics, MediaType, Source, SourceSet},
};

/// How long a freshly-created conference waits for MUC occupancy before it
/// gives up and terminates itself.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConferenceState {
  Initializing,
  Running,
  Terminating,
  Terminated,
}

/// Feature flags advertised in a `conference-request` reply, derived from
/// conference config and discovered service availability.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeatureFlags {
  pub opus_red: bool,
  pub rtx: bool,
  pub sctp: bool,
  pub transcription: bool,
  pub sip_gateway: bool,
  pub lobby: bool,
  pub visitors: bool,
}

#[derive(Debug, Clone)]
pub struct ConferenceConfig {
  pub room: BareJid,
  pub focus_jid: Jid,
  pub region: Option<String>,
  pub features: FeatureFlags,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionReply {
  pub ready: bool,
  pub redirect_visitor_node: Option<String>,
  pub features: FeatureFlags,
}

/// AV-moderation state for one media kind: moderators may require an
/// explicit whitelist before a muted participant is allowed to unmute.
#[derive(Debug, Clone, Default)]
struct AvModeration {
  enabled: bool,
  whitelist: std::collections::HashSet<String>,
}

impl AvModeration {
  fn allows_unmute(&self, participant_id: &str) -> bool {
    !self.enabled || self.whitelist.contains(participant_id)
  }
}

struct Inner {
  state: ConferenceState,
  participants: HashMap<String, Participant>,
  sessions: HashMap<String, Session>,
  sources: ConferenceSourceMap,
  bridge: Option<Bridge>,
  codec_ballots: HashMap<String, Vec<String>>,
  av_moderation: HashMap<crate::sourceset::MediaType, AvModeration>,
  /// The reservation system's id for this room's booking, set once
  /// `handle_conference_request` first succeeds against it. Released on
  /// `terminate`.
  reservation_id: Option<i64>,
}

impl Inner {
  fn new() -> Inner {
    Inner {
      state: ConferenceState::Initializing,
      participants: HashMap::new(),
      sessions: HashMap::new(),
      sources: ConferenceSourceMap::new(),
      bridge: None,
      codec_ballots: HashMap::new(),
      av_moderation: HashMap::new(),
      reservation_id: None,
    }
  }

  fn has_non_visitor(&self) -> bool {
    self.participants.values().any(|p| !p.is_visitor())
  }
}

/// A handle to one running conference. Cheap to clone; every clone shares
/// the same underlying state behind `Arc<Mutex<Inner>>`, mirroring the
/// `JitsiConference`/`Arc<Mutex<JitsiConferenceInner>>` split this crate's
/// signaling client uses for the same reason.
#[derive(Clone)]
pub struct Conference {
  meeting_id: String,
  config: ConferenceConfig,
  chat_room: ChatRoom,
  bridge_selector: BridgeSelector,
  authenticator: Arc<Authenticator>,
  reservation: Option<ReservationClient>,
  jingle_tx: mpsc::Sender<Element>,
  /// Mirrors `Inner::has_non_visitor()`, kept outside the async lock so the
  /// idle sweeper can poll it synchronously without contending for `inner`.
  has_non_visitor: Arc<AtomicBool>,
  inner: Arc<Mutex<Inner>>,
  /// Serializes every mutating entry point into a single FIFO, so that a
  /// room presence event and a concurrently-arriving IQ can never interleave.
  router: IqRouter,
}

impl Conference {
  pub fn new(
    meeting_id: String,
    config: ConferenceConfig,
    chat_room: ChatRoom,
    bridge_selector: BridgeSelector,
    authenticator: Arc<Authenticator>,
    reservation: Option<ReservationClient>,
    jingle_tx: mpsc::Sender<Element>,
  ) -> Conference {
    Conference {
      meeting_id,
      config,
      chat_room,
      bridge_selector,
      authenticator,
      reservation,
      jingle_tx,
      has_non_visitor: Arc::new(AtomicBool::new(false)),
      inner: Arc::new(Mutex::new(Inner::new())),
      router: IqRouter::spawn(),
    }
  }

  /// Build a fresh, not-yet-joined `Conference` for `room`, wired up
  /// identically regardless of whether admission arrived over the HTTP
  /// `conference-request/v1` surface or a stanza-form `conference` IQ.
  pub fn for_room(
    meeting_id: String,
    room: BareJid,
    config: &FocusConfig,
    connection: &Connection,
    bridge_selector: BridgeSelector,
    authenticator: Arc<Authenticator>,
    reservation: Option<ReservationClient>,
  ) -> Conference {
    let own_jid: FullJid =
      format!("{}/focus", config.xmpp.muc_domain).parse().expect("muc domain yields a valid JID");
    let chat_room = ChatRoom::new(room.clone(), "focus".to_owned(), own_jid, connection.sender());
    Conference::new(
      meeting_id,
      ConferenceConfig {
        room,
        focus_jid: config.xmpp.focus_jid.parse().expect("config focus_jid is a valid JID"),
        region: None,
        features: FeatureFlags {
          opus_red: true,
          rtx: true,
          sctp: true,
          transcription: false,
          sip_gateway: false,
          lobby: true,
          visitors: matches!(config.admission.mode, AdmissionMode::External),
        },
      },
      chat_room,
      bridge_selector,
      authenticator,
      reservation,
      connection.sender(),
    )
  }

  pub fn meeting_id(&self) -> &str {
    &self.meeting_id
  }

  /// Read without the async lock: the idle sweeper calls this on every
  /// conference in the store once per sweep interval.
  pub fn is_idle(&self) -> bool {
    !self.has_non_visitor.load(Ordering::Relaxed)
  }

  /// Join the conference's MUC room. The caller should await this before
  /// admitting any `conference-request`s.
  #[instrument(skip(self), fields(room = %self.config.room))]
  pub async fn join(&self) -> anyhow::Result<()> {
    self.chat_room.join().await?;
    let mut inner = self.inner.lock().await;
    if inner.state == ConferenceState::Initializing {
      inner.state = ConferenceState::Running;
    }
    Ok(())
  }

  /// Handle a presence event surfaced by the MUC adapter, serialized
  /// against every other mutating entry point via the conference's router.
  pub async fn handle_room_event(&self, event: RoomEvent) -> Result<()> {
    let this = self.clone();
    self.router.dispatch_and_wait(move || async move { this.handle_room_event_locked(event).await }).await?
  }

  #[instrument(skip(self, event))]
  async fn handle_room_event_locked(&self, event: RoomEvent) -> Result<()> {
    match event {
      RoomEvent::Joined { room_created } => {
        info!(room_created, "joined conference room");
        Ok(())
      },
      RoomEvent::Occupant { muc_jid, available, .. } => {
        if available {
          // ingest_participant blocks on the peer's session-accept, which
          // itself arrives through this same router — awaiting it here,
          // inside the router's own job, would deadlock the queue against
          // itself. Run it detached instead; the router stays free to
          // process that accept (and everything else) while it waits.
          let this = self.clone();
          let id = muc_jid.resource.clone();
          tokio::spawn(async move {
            if let Err(err) = this.ingest_participant(muc_jid, Role::Participant).await {
              warn!(%id, %err, "failed to ingest participant");
            }
          });
          Ok(())
        } else {
          self.remove_participant(muc_jid.resource.as_str()).await;
          Ok(())
        }
      },
      RoomEvent::Left => {
        warn!("kicked from our own conference room");
        self.terminate().await;
        Ok(())
      },
    }
  }

  /// Decide whether `request` is allowed to join this conference. The
  /// reservation call-out only ever runs once per conference: later
  /// admissions into an already-booked room skip straight past it.
  pub async fn handle_conference_request(&self, request: AdmissionRequest) -> Result<AdmissionReply> {
    self.authenticator.admit(&request).await?;
    if let Some(reservation) = &self.reservation {
      let already_booked = self.inner.lock().await.reservation_id.is_some();
      if !already_booked {
        let mail_owner = request.authenticated_user.as_deref().unwrap_or(&request.machine_uid);
        let record = reservation.make_reservation(&request.room, mail_owner).await?;
        self.inner.lock().await.reservation_id = Some(record.id);
      }
    }
    Ok(AdmissionReply { ready: true, redirect_visitor_node: None, features: self.config.features.clone() })
  }

  /// Construct a `Participant`, allocate bridge capacity, and send a
  /// `session-initiate` offering every source already known to the
  /// conference (empty, for the first participant into an empty room).
  /// Blocks up to `SESSION_INITIATE_TIMEOUT` for the peer's `session-accept`;
  /// on timeout the admission is rolled back entirely.
  async fn ingest_participant(&self, muc_jid: FullJid, role: Role) -> Result<()> {
    let id = muc_jid.resource.clone();
    let participant = Participant::new(id.clone(), muc_jid.clone(), role);
    let is_visitor = participant.is_visitor();

    let bridge = self.bridge_selector.select(&self.meeting_id, self.config.region.as_deref()).await?;
    let bridge_jid = bridge.jid.clone();
    let mut session = Session::new(Jid::Full(muc_jid.clone()));

    let mut inner = self.inner.lock().await;
    inner.participants.insert(id.clone(), participant);
    if !is_visitor {
      self.has_non_visitor.store(true, Ordering::Relaxed);
    }
    inner.bridge = Some(bridge);

    let contents = source_set_to_contents(&merged_sources(&inner.sources));
    let (jingle, accept) = session.initiate(self.config.focus_jid.clone(), contents);
    let peer = session.peer.clone();
    inner.sessions.insert(id.clone(), session);
    drop(inner);

    let initiate_iq = jingle_to_iq(self.config.focus_jid.clone(), peer, jingle);
    let _ = self.jingle_tx.send(initiate_iq).await;

    let iq = self.colibri_iq(bridge_jid, BridgeAction::Allocate, vec![Endpoint::new(id.clone()).with_create()]);
    let _ = self.jingle_tx.send(iq).await;

    match tokio::time::timeout(SESSION_INITIATE_TIMEOUT, accept).await {
      Ok(Ok(())) => Ok(()),
      Ok(Err(_)) => {
        warn!(%id, "session-accept waiter dropped without firing");
        self.remove_participant(&id).await;
        Err(FocusError::Timeout)
      },
      Err(_) => {
        warn!(%id, "participant never answered session-initiate, rolling back admission");
        self.remove_participant(&id).await;
        Err(FocusError::Timeout)
      },
    }
  }

  /// Mark `participant_id`'s session active once its `session-accept`
  /// arrives, unblocking `apply_sources`' source-add relay to it.
  pub async fn on_session_accept(&self, participant_id: &str) -> Result<()> {
    let this = self.clone();
    let participant_id = participant_id.to_owned();
    self.router.dispatch_and_wait(move || async move { this.on_session_accept_locked(&participant_id).await }).await?
  }

  async fn on_session_accept_locked(&self, participant_id: &str) -> Result<()> {
    let mut inner = self.inner.lock().await;
    match inner.sessions.get_mut(participant_id) {
      Some(session) => session.on_session_accept(),
      None => Err(FocusError::ItemNotFound),
    }
  }

  /// Build a `conference-modify` IQ addressed to the bridge currently
  /// holding this conference's shard.
  fn colibri_iq(&self, bridge_jid: Jid, action: BridgeAction, endpoints: Vec<Endpoint>) -> Element {
    let payload = ConferenceModify { meeting_id: self.meeting_id.clone(), action, endpoints, sources: None };
    jingle_to_iq(self.config.focus_jid.clone(), bridge_jid, payload)
  }

  /// Record that `participant_id` left. Its sources are relayed as a
  /// `source-remove` to every other active session, its bridge shard is
  /// expired, and its own session is terminated.
  async fn remove_participant(&self, participant_id: &str) {
    let mut inner = self.inner.lock().await;
    inner.participants.remove(participant_id);
    if let Some(mut session) = inner.sessions.remove(participant_id) {
      session.terminate();
    }
    let removed_sources = inner.sources.remove(participant_id);
    inner.codec_ballots.remove(participant_id);
    self.has_non_visitor.store(inner.has_non_visitor(), Ordering::Relaxed);
    let bridge_jid = inner.bridge.as_ref().map(|b| b.jid.clone());
    let peers: Vec<(String, Jid)> =
      inner.sessions.iter().map(|(peer_id, session)| (peer_id.clone(), session.peer.clone())).collect();
    drop(inner);

    if let Some(set) = removed_sources.filter(|set| !set.sources.is_empty()) {
      let contents = source_set_to_contents(&set);
      for (peer_id, peer) in peers {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.sessions.get(&peer_id) {
          match session.source_remove(contents.clone()) {
            Ok(jingle) => {
              let iq = jingle_to_iq(self.config.focus_jid.clone(), peer, jingle);
              drop(inner);
              let _ = self.jingle_tx.send(iq).await;
            },
            Err(err) => warn!(%peer_id, %err, "failed to relay source-remove"),
          }
        }
      }
    }

    if let Some(bridge_jid) = bridge_jid {
      let iq = self.colibri_iq(
        bridge_jid,
        BridgeAction::Expire,
        vec![Endpoint::new(participant_id.to_owned()).with_expire()],
      );
      let _ = self.jingle_tx.send(iq).await;
    }
  }

  /// Validate and apply `set` as `participant_id`'s advertised sources,
  /// then relay a `source-add` to every other active session.
  /// Source removal is applied immediately and is never subject to the
  /// burst-smoothing delay that governs additions.
  pub async fn apply_sources(&self, participant_id: &str, set: SourceSet) -> Result<()> {
    let this = self.clone();
    let participant_id = participant_id.to_owned();
    self.router.dispatch_and_wait(move || async move { this.apply_sources_locked(&participant_id, set).await }).await?
  }

  async fn apply_sources_locked(&self, participant_id: &str, set: SourceSet) -> Result<()> {
    let mut inner = self.inner.lock().await;
    inner.sources.add(participant_id, set.clone())?;

    let peers: Vec<(String, Jid)> = inner
      .sessions
      .iter()
      .filter(|(id, _)| id.as_str() != participant_id)
      .map(|(id, session)| (id.clone(), session.peer.clone()))
      .collect();
    drop(inner);

    for (peer_id, peer) in peers {
      let contents = source_set_to_contents(&set);
      let mut inner = self.inner.lock().await;
      if let Some(session) = inner.sessions.get(&peer_id) {
        match session.source_add(contents) {
          Ok(jingle) => {
            let iq = jingle_to_iq(self.config.focus_jid.clone(), peer, jingle);
            drop(inner);
            let _ = self.jingle_tx.send(iq).await;
          },
          Err(err) => warn!(%peer_id, %err, "failed to relay source-add"),
        }
      }
    }

    let notice = JsonMessage {
      payload: serde_json::json!({
        "event": "SourceAdd",
        "participant_id": participant_id,
        "sources": set.sources.len(),
      }),
    };
    if let Err(err) = self.chat_room.send_message(notice.into()).await {
      warn!(%err, "failed to broadcast source-map update to the room");
    }
    Ok(())
  }

  /// Remove a subset of `participant_id`'s advertised sources (a
  /// `source-remove` delta, e.g. turning off a camera) without tearing down
  /// the rest of their session, then relay the removal to every other
  /// active session.
  pub async fn remove_sources(&self, participant_id: &str, set: SourceSet) -> Result<()> {
    let this = self.clone();
    let participant_id = participant_id.to_owned();
    self.router.dispatch_and_wait(move || async move { this.remove_sources_locked(&participant_id, set).await }).await?
  }

  async fn remove_sources_locked(&self, participant_id: &str, set: SourceSet) -> Result<()> {
    let mut inner = self.inner.lock().await;
    let dropped = inner.sources.remove_subset(participant_id, &set).unwrap_or_default();

    let peers: Vec<(String, Jid)> = inner
      .sessions
      .iter()
      .filter(|(id, _)| id.as_str() != participant_id)
      .map(|(id, session)| (id.clone(), session.peer.clone()))
      .collect();
    drop(inner);

    if dropped.sources.is_empty() {
      return Ok(());
    }
    let contents = source_set_to_contents(&dropped);
    for (peer_id, peer) in peers {
      let mut inner = self.inner.lock().await;
      if let Some(session) = inner.sessions.get(&peer_id) {
        match session.source_remove(contents.clone()) {
          Ok(jingle) => {
            let iq = jingle_to_iq(self.config.focus_jid.clone(), peer, jingle);
            drop(inner);
            let _ = self.jingle_tx.send(iq).await;
          },
          Err(err) => warn!(%peer_id, %err, "failed to relay source-remove"),
        }
      }
    }
    Ok(())
  }

  /// Blocking form of a source-add relay to one peer: waits for that peer's
  /// ack before returning, retrying once if the session was mid-(re)negotiation
  /// (`SessionInvalid`) on the first attempt. Used where delivery must be
  /// confirmed rather than best-effort, e.g. re-syncing a single participant
  /// after a reconnect.
  pub async fn send_source_add_blocking(&self, peer_id: &str, set: &SourceSet) -> Result<()> {
    let contents = source_set_to_contents(set);
    self.send_with_ack_retrying(peer_id, contents, true).await
  }

  /// Blocking form of a source-remove relay, see `send_source_add_blocking`.
  pub async fn send_source_remove_blocking(&self, peer_id: &str, set: &SourceSet) -> Result<()> {
    let contents = source_set_to_contents(set);
    self.send_with_ack_retrying(peer_id, contents, false).await
  }

  async fn send_with_ack_retrying(&self, peer_id: &str, contents: Vec<Content>, is_add: bool) -> Result<()> {
    match self.try_send_with_ack(peer_id, contents.clone(), is_add).await {
      Err(FocusError::SessionInvalid) => {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.try_send_with_ack(peer_id, contents, is_add).await
      },
      other => other,
    }
  }

  async fn try_send_with_ack(&self, peer_id: &str, contents: Vec<Content>, is_add: bool) -> Result<()> {
    let (id, jingle, peer, rx) = {
      let mut inner = self.inner.lock().await;
      let session = inner.sessions.get_mut(peer_id).ok_or(FocusError::ItemNotFound)?;
      let (id, jingle, rx) = if is_add {
        session.source_add_with_ack(contents)?
      } else {
        session.source_remove_with_ack(contents)?
      };
      (id, jingle, session.peer.clone(), rx)
    };
    let iq = jingle_to_iq_with_id(self.config.focus_jid.clone(), peer, id, jingle);
    let _ = self.jingle_tx.send(iq).await;
    match tokio::time::timeout(SESSION_INITIATE_TIMEOUT, rx).await {
      Ok(Ok(outcome)) => outcome,
      Ok(Err(_)) => Err(FocusError::Timeout),
      Err(_) => Err(FocusError::Timeout),
    }
  }

  /// Fulfill a pending blocking-send waiter on `participant_id`'s session,
  /// once its `iq` reply for `id` is observed on the wire.
  pub async fn resolve_session_reply(&self, participant_id: &str, id: &str, outcome: Result<()>) -> Result<()> {
    let this = self.clone();
    let participant_id = participant_id.to_owned();
    let id = id.to_owned();
    self
      .router
      .dispatch_and_wait(move || async move { this.resolve_session_reply_locked(&participant_id, &id, outcome).await })
      .await?
  }

  async fn resolve_session_reply_locked(&self, participant_id: &str, id: &str, outcome: Result<()>) -> Result<()> {
    let mut inner = self.inner.lock().await;
    if let Some(session) = inner.sessions.get_mut(participant_id) {
      session.resolve_reply(id, outcome);
    }
    Ok(())
  }

  /// Interpret one inbound MUC presence stanza and dispatch whatever
  /// `RoomEvent` it resolves to. `None` (a presence not addressed to this
  /// room, or lacking the `muc#user` payload) is silently ignored.
  pub async fn handle_presence(&self, presence: Presence) -> Result<()> {
    match self.chat_room.interpret_presence(presence).map_err(FocusError::Internal)? {
      Some(event) => self.handle_room_event(event).await,
      None => Ok(()),
    }
  }

  /// Dispatch one inbound Jingle stanza sent by `participant_id`'s own
  /// client: `session-accept`, `transport-info`, or a self-initiated
  /// `source-add`/`source-remove` (e.g. the participant turning on their
  /// camera), applying the source-topology side effect the session itself
  /// doesn't know how to apply.
  pub async fn handle_incoming_jingle(&self, participant_id: &str, jingle: Jingle) -> Result<()> {
    let event = {
      let this = self.clone();
      let participant_id_owned = participant_id.to_owned();
      let jingle_for_session = jingle.clone();
      self
        .router
        .dispatch_and_wait(move || async move {
          let mut inner = this.inner.lock().await;
          let session = inner.sessions.get_mut(&participant_id_owned).ok_or(FocusError::SessionInvalid)?;
          session.process_incoming(&jingle_for_session)
        })
        .await?
    }?;

    match event {
      IncomingSessionEvent::Accepted => Ok(()),
      IncomingSessionEvent::SourcesAdded => {
        let set = contents_to_source_set(&jingle.contents, participant_id)?;
        self.apply_sources(participant_id, set).await
      },
      IncomingSessionEvent::SourcesRemoved => {
        let set = contents_to_source_set(&jingle.contents, participant_id)?;
        self.remove_sources(participant_id, set).await
      },
      IncomingSessionEvent::TransportInfo => Ok(()),
    }
  }

  /// Record one participant's ranked codec preferences, for the
  /// conference-wide Borda count used when renegotiating codec order.
  pub async fn record_codec_ballot(&self, participant_id: &str, ballot: Vec<String>) {
    self.inner.lock().await.codec_ballots.insert(participant_id.to_owned(), ballot);
  }

  pub async fn codec_ranking(&self) -> Vec<String> {
    let inner = self.inner.lock().await;
    let ballots: Vec<Vec<String>> = inner.codec_ballots.values().cloned().collect();
    borda_count(&ballots)
  }

  /// `codec_ranking()` restricted to codecs every ballot named — the menu
  /// offered to visitors, who never get to individually renegotiate.
  pub async fn visitor_codec_ranking(&self) -> Vec<String> {
    let inner = self.inner.lock().await;
    let ballots: Vec<Vec<String>> = inner.codec_ballots.values().cloned().collect();
    crate::codec_catalogue::universally_supported(&ballots, &borda_count(&ballots))
  }

  /// Moderator-gated mute/AV-moderation operations. `actor`
  /// must hold `Role::Moderator`.
  pub async fn set_av_moderation(
    &self,
    actor: &str,
    media_type: crate::sourceset::MediaType,
    enabled: bool,
    whitelist: std::collections::HashSet<String>,
  ) -> Result<()> {
    let this = self.clone();
    let actor = actor.to_owned();
    self
      .router
      .dispatch_and_wait(move || async move { this.set_av_moderation_locked(&actor, media_type, enabled, whitelist).await })
      .await?
  }

  async fn set_av_moderation_locked(
    &self,
    actor: &str,
    media_type: crate::sourceset::MediaType,
    enabled: bool,
    whitelist: std::collections::HashSet<String>,
  ) -> Result<()> {
    let mut inner = self.inner.lock().await;
    let is_moderator = inner.participants.get(actor).map(|p| p.role == Role::Moderator).unwrap_or(false);
    if !is_moderator {
      return Err(FocusError::Forbidden);
    }
    inner.av_moderation.insert(media_type, AvModeration { enabled, whitelist: whitelist.clone() });
    drop(inner);

    let notice = JsonMessage {
      payload: serde_json::json!({
        "event": "AvModeration",
        "media_type": media_type,
        "enabled": enabled,
        "whitelist": whitelist,
      }),
    };
    if let Err(err) = self.chat_room.send_message(notice.into()).await {
      warn!(%err, "failed to broadcast AV-moderation update to the room");
    }
    Ok(())
  }

  pub async fn may_unmute(&self, participant_id: &str, media_type: crate::sourceset::MediaType) -> bool {
    let inner = self.inner.lock().await;
    inner.av_moderation.get(&media_type).map(|m| m.allows_unmute(participant_id)).unwrap_or(true)
  }

  /// Moderator-gated forced mute: `actor` (who must hold `Role::Moderator`)
  /// strips every `media_type` source `target` currently has advertised,
  /// relaying the removal to the rest of the conference the same way a
  /// voluntary `source-remove` would, then tells `target`'s own client to
  /// stop sending via a blocking relay.
  pub async fn force_mute(&self, actor: &str, target: &str, media_type: MediaType) -> Result<()> {
    let is_moderator = {
      let inner = self.inner.lock().await;
      inner.participants.get(actor).map(|p| p.role == Role::Moderator).unwrap_or(false)
    };
    if !is_moderator {
      return Err(FocusError::Forbidden);
    }

    let subset = {
      let inner = self.inner.lock().await;
      match inner.sources.get(target) {
        Some(set) => {
          SourceSet { sources: set.sources.iter().filter(|s| s.media_type == media_type).cloned().collect(), groups: vec![] }
        },
        None => return Err(FocusError::ItemNotFound),
      }
    };
    if subset.sources.is_empty() {
      return Ok(());
    }

    self.remove_sources(target, subset.clone()).await?;
    self.send_source_remove_blocking(target, &subset).await
  }

  /// Re-host every participant bound to a failed bridge onto a freshly
  /// selected one, issuing `transport-replace` on each affected session.
  /// `failed` is reported to the shared selector first (non-destructively:
  /// it stays registered but is excluded from selection until its next
  /// successful probe), so neither this conference nor any other gets
  /// handed it again before it recovers. If no replacement bridge can be
  /// found, the conference terminates instead.
  pub async fn handle_bridge_down(&self, failed: &Jid) -> Result<()> {
    let this = self.clone();
    let failed = failed.clone();
    self.router.dispatch_and_wait(move || async move { this.handle_bridge_down_locked(&failed).await }).await?
  }

  async fn handle_bridge_down_locked(&self, failed: &Jid) -> Result<()> {
    let needs_relocation = {
      let inner = self.inner.lock().await;
      inner.bridge.as_ref().map(|b| &b.jid == failed).unwrap_or(false)
    };
    if !needs_relocation {
      return Ok(());
    }
    self.bridge_selector.report_failure(failed).await;

    let replacement = match self.bridge_selector.select(&self.meeting_id, self.config.region.as_deref()).await {
      Ok(bridge) => bridge,
      Err(_) => {
        self.terminate().await;
        return Err(FocusError::ServiceUnavailable);
      },
    };

    let mut inner = self.inner.lock().await;
    let replacement_jid = replacement.jid.clone();
    inner.bridge = Some(replacement);
    let endpoints: Vec<Endpoint> = inner.sessions.keys().map(|id| Endpoint::new(id.clone()).with_create()).collect();
    for (id, session) in inner.sessions.iter() {
      match session.transport_replace(vec![]) {
        Ok(jingle) => {
          let iq = jingle_to_iq(self.config.focus_jid.clone(), session.peer.clone(), jingle);
          let tx = self.jingle_tx.clone();
          tokio::spawn(async move {
            let _ = tx.send(iq).await;
          });
        },
        Err(err) => warn!(participant_id = %id, %err, "failed to build transport-replace"),
      }
    }
    drop(inner);

    if !endpoints.is_empty() {
      let iq = self.colibri_iq(replacement_jid, BridgeAction::Allocate, endpoints);
      let _ = self.jingle_tx.send(iq).await;
    }
    Ok(())
  }

  /// Tear the conference down: terminate every session, leave the room,
  /// and mark state `terminated`.
  #[instrument(skip(self))]
  pub async fn terminate(&self) {
    let mut inner = self.inner.lock().await;
    if inner.state == ConferenceState::Terminated {
      return;
    }
    inner.state = ConferenceState::Terminating;
    for session in inner.sessions.values_mut() {
      session.terminate();
    }
    inner.sessions.clear();
    inner.participants.clear();
    inner.state = ConferenceState::Terminated;
    let reservation_id = inner.reservation_id.take();
    drop(inner);
    self.has_non_visitor.store(false, Ordering::Relaxed);
    if let (Some(reservation), Some(id)) = (&self.reservation, reservation_id) {
      reservation.release_reservation(id).await;
    }
    if let Err(err) = self.chat_room.leave().await {
      warn!(%err, "failed to send MUC leave presence during termination");
    }
  }

  pub async fn state(&self) -> ConferenceState {
    self.inner.lock().await.state
  }

  pub async fn participant_count(&self) -> usize {
    self.inner.lock().await.participants.len()
  }
}

/// Concatenate every participant's currently advertised sources into one
/// set, for offering to a freshly-joining participant's `session-initiate`.
fn merged_sources(sources: &ConferenceSourceMap) -> SourceSet {
  let mut merged = SourceSet::new();
  for owner in sources.owners() {
    if let Some(set) = sources.get(owner) {
      merged.sources.extend(set.sources.clone());
      merged.groups.extend(set.groups.clone());
    }
  }
  merged
}

/// One `Content` per media type present in `set`, carrying that media's
/// ssrc/ssrc-group elements on an RTP description.
fn source_set_to_contents(set: &SourceSet) -> Vec<Content> {
  let mut contents = Vec::new();
  for media_type in [crate::sourceset::MediaType::Audio, crate::sourceset::MediaType::Video] {
    let sources: Vec<&crate::sourceset::Source> =
      set.sources.iter().filter(|source| source.media_type == media_type).collect();
    if sources.is_empty() {
      continue;
    }

    let owned_ssrcs: std::collections::HashSet<u32> = sources.iter().map(|s| s.ssrc).collect();
    let media = match media_type {
      crate::sourceset::MediaType::Audio => "audio",
      crate::sourceset::MediaType::Video => "video",
    };

    let mut description = RtpDescription::new(media.to_owned());
    description.ssrcs = sources.iter().map(|source| SsmaSource::new(source.ssrc)).collect();
    description.ssrc_groups = set
      .groups
      .iter()
      .filter(|group| group.ssrcs.iter().all(|ssrc| owned_ssrcs.contains(ssrc)))
      .map(|group| SsmaGroup {
        semantics: match group.semantics {
          crate::sourceset::GroupSemantics::Fec => SsmaSemantics::Fec,
          crate::sourceset::GroupSemantics::Fid => SsmaSemantics::Fid,
          crate::sourceset::GroupSemantics::Sim => SsmaSemantics::Sim,
        },
        sources: group.ssrcs.iter().map(|ssrc| SsmaSource::new(*ssrc)).collect(),
      })
      .collect();

    contents.push(Content::new(Creator::Initiator, ContentId(media.to_owned())).with_description(description));
  }
  contents
}

fn jingle_to_iq(from: Jid, to: Jid, payload: impl xmpp_parsers::iq::IqSetPayload) -> Element {
  jingle_to_iq_with_id(from, to, crate::util::generate_id(), payload)
}

/// Like `jingle_to_iq`, but under a caller-chosen id, for the blocking
/// relay path that needs to match the reply back to its waiter.
fn jingle_to_iq_with_id(from: Jid, to: Jid, id: String, payload: impl xmpp_parsers::iq::IqSetPayload) -> Element {
  let mut iq = xmpp_parsers::iq::Iq::from_set(id, payload);
  iq.from = Some(from);
  iq.to = Some(to);
  iq.into()
}

/// Convert the wire-format Jingle contents of an inbound `source-add`/
/// `source-remove` into the domain `SourceSet` the conference's source map
/// operates on, attributing every source to `owner`. An `ssrc-group` whose
/// semantics this focus doesn't relay (`Ls`/`Srf`/`Anat`/`Ddp`) is rejected
/// rather than silently dropped, since a peer that negotiated it is relying
/// on it to group simulcast/FEC layers correctly.
fn contents_to_source_set(contents: &[Content], owner: &str) -> Result<SourceSet> {
  let mut set = SourceSet::new();
  for content in contents {
    let Some(JingleDescription::Rtp(desc)) = &content.description else { continue };
    let media_type = match desc.media.as_str() {
      "audio" => MediaType::Audio,
      "video" => MediaType::Video,
      _ => continue,
    };
    for source in &desc.ssrcs {
      set.sources.push(Source::new(source.id, media_type, Some(owner.to_owned())));
    }
    for group in &desc.ssrc_groups {
      let semantics = match &group.semantics {
        SsmaSemantics::Fec => GroupSemantics::Fec,
        SsmaSemantics::Fid => GroupSemantics::Fid,
        SsmaSemantics::Sim => GroupSemantics::Sim,
        other => {
          return Err(FocusError::source_rejected(
            SourceRejectionTag::UnsupportedGroup,
            format!("unsupported ssrc-group semantics {:?}", other),
          ))
        },
      };
      set.groups.push(crate::sourceset::SourceGroup {
        semantics,
        ssrcs: group.sources.iter().map(|s| s.id).collect(),
      });
    }
  }
  Ok(set)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{auth::Authenticator, bridge::BridgeSelector, config::AdmissionMode};

  fn chat_room() -> ChatRoom {
    let (tx, _rx) = mpsc::channel(8);
    ChatRoom::new(
      "room@conference.example.com".parse().unwrap(),
      "focus".to_owned(),
      "focus@auth.example.com/resource".parse().unwrap(),
      tx,
    )
  }

  fn conference() -> Conference {
    let (jingle_tx, _rx) = mpsc::channel(8);
    Conference::new(
      "meeting-1".to_owned(),
      ConferenceConfig {
        room: "room@conference.example.com".parse().unwrap(),
        focus_jid: "focus@auth.example.com".parse().unwrap(),
        region: None,
        features: FeatureFlags::default(),
      },
      chat_room(),
      BridgeSelector::new(100, Duration::from_secs(60)),
      Arc::new(Authenticator::new(AdmissionMode::XmppDomain)),
      None,
      jingle_tx,
    )
  }

  #[tokio::test]
  async fn freshly_created_conference_is_idle() {
    let conference = conference();
    assert!(conference.is_idle());
  }

  #[tokio::test]
  async fn ingesting_a_non_visitor_clears_idle() {
    let conference = conference();
    conference.bridge_selector.upsert(Bridge::new("bridge@example.com".parse().unwrap(), None)).await;
    let joining = conference.clone();
    let handle = tokio::spawn(async move {
      joining.ingest_participant("room@conference.example.com/alice".parse().unwrap(), Role::Participant).await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    // the participant is inserted, and the idle flag flipped, before ingest_participant
    // blocks on the session-accept it's still waiting for.
    assert!(!conference.is_idle());
    conference.on_session_accept("alice").await.unwrap();
    handle.await.unwrap().unwrap();
    assert!(!conference.is_idle());
  }

  #[tokio::test]
  async fn ingesting_only_visitors_stays_idle() {
    let conference = conference();
    conference.bridge_selector.upsert(Bridge::new("bridge@example.com".parse().unwrap(), None)).await;
    let joining = conference.clone();
    let handle = tokio::spawn(async move {
      joining.ingest_participant("room@conference.example.com/alice".parse().unwrap(), Role::Visitor).await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(conference.is_idle());
    conference.on_session_accept("alice").await.unwrap();
    handle.await.unwrap().unwrap();
    assert!(conference.is_idle());
  }

  #[tokio::test]
  async fn terminate_is_idempotent() {
    let conference = conference();
    conference.terminate().await;
    conference.terminate().await;
    assert_eq!(conference.state().await, ConferenceState::Terminated);
  }

  #[tokio::test]
  async fn non_moderator_cannot_set_av_moderation() {
    let conference = conference();
    conference.bridge_selector.upsert(Bridge::new("bridge@example.com".parse().unwrap(), None)).await;
    let joining = conference.clone();
    let handle = tokio::spawn(async move {
      joining.ingest_participant("room@conference.example.com/alice".parse().unwrap(), Role::Participant).await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // the role check only reads `participants`, set during the synchronous
    // part of ingest_participant, so this is valid before accept fires too.
    let result = conference
      .set_av_moderation("alice", crate::sourceset::MediaType::Audio, true, Default::default())
      .await;
    assert!(matches!(result, Err(FocusError::Forbidden)));

    conference.on_session_accept("alice").await.unwrap();
    handle.await.unwrap().unwrap();
  }
}
