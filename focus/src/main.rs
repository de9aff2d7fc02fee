use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
  extract::{Path, State},
  http::StatusCode,
  response::{IntoResponse, Response},
  routing::{get, post},
  Json, Router,
};
use focus_core::{
  auth::{AdmissionRequest, Authenticator},
  bridge::BridgeSelector,
  conference::{Conference, FeatureFlags},
  conference_store::ConferenceStore,
  config::{AdmissionMode, FocusConfig},
  connection::{Authentication, Connection},
  dispatcher::Dispatcher,
  error::FocusError,
  init_tracing,
  reservation::ReservationClient,
};
use serde::{Deserialize, Serialize};
use structopt::StructOpt;
use tokio::signal::ctrl_c;
use tracing::{error, info, warn};

#[derive(Clone, StructOpt)]
#[structopt(name = "focus", about = "Per-conference orchestrator between clients and media bridges.")]
struct Opt {
  #[structopt(long, help = "The XMPP WebSocket URL the focus connects to.")]
  host: Option<String>,

  #[structopt(long, help = "The XMPP domain hosting the conference MUCs.")]
  domain: Option<String>,

  #[structopt(long, help = "The focus's own login secret (SASL PLAIN password).")]
  secret: Option<String>,

  #[structopt(long, help = "The domain the focus authenticates against, if different from --domain.")]
  user_domain: Option<String>,

  #[structopt(long, default_value = "focus", help = "The focus's own login username.")]
  user_name: String,

  #[structopt(long, help = "Alias for --secret.")]
  user_password: Option<String>,

  #[structopt(long, help = "Optional TOML config file layered under CLI flags.")]
  config: Option<String>,

  #[structopt(short, long, parse(from_occurrences), help = "Increase log verbosity; repeatable.")]
  verbose: u8,

  #[cfg(feature = "tls-insecure")]
  #[structopt(long, help = "Disable TLS certificate verification (use with extreme caution)")]
  tls_insecure: bool,
}

impl fmt::Debug for Opt {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Opt")
      .field("host", &self.host)
      .field("domain", &self.domain)
      .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
      .field("user_domain", &self.user_domain)
      .field("user_name", &self.user_name)
      .field("user_password", &self.user_password.as_ref().map(|_| "<redacted>"))
      .field("config", &self.config)
      .field("verbose", &self.verbose)
      .finish()
  }
}

fn is_tls_insecure(_opt: &Opt) -> bool {
  #[cfg(feature = "tls-insecure")]
  {
    _opt.tls_insecure
  }
  #[cfg(not(feature = "tls-insecure"))]
  {
    false
  }
}

/// Build a `FocusConfig` from an optional file/environment layer, then let
/// any CLI flag the operator actually passed take precedence.
fn resolve_config(opt: &Opt) -> Result<FocusConfig> {
  let loaded = FocusConfig::load(opt.config.as_deref());

  let domain = opt.domain.clone();
  let host = opt.host.clone();
  let secret = opt.secret.clone().or_else(|| opt.user_password.clone());

  match loaded {
    Ok(mut config) => {
      if let Some(host) = host {
        config.xmpp.websocket_url = host;
      }
      if let Some(domain) = domain {
        config.xmpp.domain = domain;
      }
      if let Some(secret) = secret {
        config.xmpp.password = Some(secret);
      }
      Ok(config)
    },
    Err(err) => {
      let domain = domain.context("--domain (or a config file's [xmpp] domain) is required")?;
      let host = host.context("--host (or a config file's [xmpp] websocket_url) is required")?;
      info!("no usable config file/environment layer found ({}); building configuration from CLI flags", err);
      Ok(FocusConfig {
        xmpp: focus_core::config::XmppConfig {
          websocket_url: host,
          muc_domain: format!("conference.{}", domain),
          focus_jid: format!("focus@auth.{}", domain),
          username: opt.user_name.clone(),
          password: secret,
          domain,
        },
        bridge: focus_core::config::BridgeConfig { pin_ttl_secs: 86400, max_participants_per_bridge: 100 },
        admission: focus_core::config::AdmissionConfig { mode: AdmissionMode::XmppDomain, reservation_base_url: None },
        http: focus_core::config::HttpConfig::default(),
      })
    },
  }
}

struct AppState {
  config: FocusConfig,
  conference_store: ConferenceStore,
  bridge_selector: BridgeSelector,
  authenticator: Arc<Authenticator>,
  reservation: Option<ReservationClient>,
  connection: Connection,
}

#[derive(Debug, Deserialize)]
struct ConferenceRequestBody {
  room: String,
  machine_uid: String,
  authenticated_user: Option<String>,
  /// The opaque id of a token previously returned by a `login`, relevant
  /// only under `AdmissionMode::External`.
  session_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct ConferenceRequestResponse {
  ready: bool,
  redirect_visitor_node: Option<String>,
  features: FeatureFlagsBody,
}

#[derive(Debug, Serialize)]
struct FeatureFlagsBody {
  opus_red: bool,
  rtx: bool,
  sctp: bool,
  transcription: bool,
  sip_gateway: bool,
  lobby: bool,
  visitors: bool,
}

impl From<FeatureFlags> for FeatureFlagsBody {
  fn from(features: FeatureFlags) -> Self {
    FeatureFlagsBody {
      opus_red: features.opus_red,
      rtx: features.rtx,
      sctp: features.sctp,
      transcription: features.transcription,
      sip_gateway: features.sip_gateway,
      lobby: features.lobby,
      visitors: features.visitors,
    }
  }
}

struct ApiError(FocusError);

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({
      "error": self.0.stanza_condition(),
      "message": self.0.to_string(),
    });
    (status, Json(body)).into_response()
  }
}

impl From<FocusError> for ApiError {
  fn from(err: FocusError) -> Self {
    ApiError(err)
  }
}

async fn conference_request(
  State(state): State<Arc<AppState>>,
  Json(body): Json<ConferenceRequestBody>,
) -> Result<Json<ConferenceRequestResponse>, ApiError> {
  let room: jid::BareJid = format!("{}@{}", body.room, state.config.xmpp.muc_domain)
    .parse()
    .map_err(|_| FocusError::BadRequest("invalid room name".to_owned()))?;

  let config = state.config.clone();
  let bridge_selector = state.bridge_selector.clone();
  let authenticator = state.authenticator.clone();
  let reservation = state.reservation.clone();
  let connection = state.connection.clone();
  let meeting_id = room.to_string();

  let conference = state
    .conference_store
    .get_or_create(&room.to_string(), move || {
      Conference::for_room(meeting_id.clone(), room, &config, &connection, bridge_selector, authenticator, reservation)
    })
    .await;

  if conference.state().await == focus_core::conference::ConferenceState::Initializing {
    if let Err(err) = conference.join().await {
      warn!(%err, "failed to join conference room");
    }
  }

  let request = AdmissionRequest {
    room: body.room,
    authenticated_user: body.authenticated_user,
    session_token: body.session_token,
    machine_uid: body.machine_uid,
  };

  let reply = conference.handle_conference_request(request).await?;
  Ok(Json(ConferenceRequestResponse {
    ready: reply.ready,
    redirect_visitor_node: reply.redirect_visitor_node,
    features: reply.features.into(),
  }))
}

async fn health() -> &'static str {
  "ok"
}

async fn debug_index(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
  let conferences = state.conference_store.snapshot().await;
  Json(serde_json::json!({ "conference_count": conferences.len() }))
}

async fn debug_conferences(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
  let mut out = Vec::new();
  for conference in state.conference_store.snapshot().await {
    out.push(serde_json::json!({
      "meeting_id": conference.meeting_id(),
      "state": conference.state().await,
      "participant_count": conference.participant_count().await,
    }));
  }
  Json(serde_json::json!(out))
}

async fn debug_conference(
  State(state): State<Arc<AppState>>,
  Path(meeting_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
  let conference = state.conference_store.get_by_meeting_id(&meeting_id).await.ok_or(FocusError::ItemNotFound)?;
  Ok(Json(serde_json::json!({
    "meeting_id": conference.meeting_id(),
    "state": conference.state().await,
    "participant_count": conference.participant_count().await,
  })))
}

#[tokio::main]
async fn main() -> Result<()> {
  let opt = Opt::from_args();

  init_tracing(match opt.verbose {
    0 => tracing::Level::INFO,
    1 => tracing::Level::DEBUG,
    _ => tracing::Level::TRACE,
  });
  info!(opt = ?opt, "starting");

  let config = resolve_config(&opt)?;

  let authentication = match &config.xmpp.password {
    Some(password) => {
      Authentication::Plain { username: config.xmpp.username.clone(), password: password.clone() }
    },
    None => Authentication::Anonymous,
  };

  let (connection, background) =
    Connection::new(&config.xmpp.websocket_url, &config.xmpp.domain, authentication, is_tls_insecure(&opt))
      .await
      .context("failed to establish XMPP connection")?;
  tokio::spawn(background);
  connection.connect().await.context("failed to complete XMPP handshake")?;

  let bridge_selector =
    BridgeSelector::new(config.bridge.max_participants_per_bridge, Duration::from_secs(config.bridge.pin_ttl_secs));
  let authenticator = Arc::new(Authenticator::new(config.admission.mode));
  let reservation = config.admission.reservation_base_url.clone().map(ReservationClient::new);
  let conference_store = ConferenceStore::new();
  conference_store.spawn_idle_sweeper();

  let dispatcher = Dispatcher::new(
    config.clone(),
    conference_store.clone(),
    bridge_selector.clone(),
    authenticator.clone(),
    reservation.clone(),
    connection.clone(),
  );
  connection.register_stanza_filter(Box::new(dispatcher)).await;

  let bind: SocketAddr = config.http.bind.parse().context("invalid [http].bind address")?;
  let state = Arc::new(AppState { config, conference_store, bridge_selector, authenticator, reservation, connection });

  let app = Router::new()
    .route("/conference-request/v1", post(conference_request))
    .route("/about/health", get(health))
    .route("/debug", get(debug_index))
    .route("/debug/conferences", get(debug_conferences))
    .route("/debug/conference/:id", get(debug_conference))
    .layer(tower_http::trace::TraceLayer::new_for_http())
    .with_state(state);

  info!(%bind, "listening");
  let server = axum::Server::bind(&bind).serve(app.into_make_service());

  tokio::select! {
    result = server => {
      if let Err(err) = result {
        error!(%err, "HTTP server exited with an error");
      }
    },
    _ = ctrl_c() => {
      info!("received ctrl-c, shutting down");
    },
  }

  Ok(())
}
