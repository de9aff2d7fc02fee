//! End-to-end scenarios exercising `Conference` through the same entry
//! points a live XMPP/HTTP surface would drive it from: room presence
//! events, client requests, and bridge-health signaling.

use std::{convert::TryFrom, sync::Arc, time::Duration};

use focus_core::{
  config::AdmissionMode,
  error::SourceRejectionTag,
  reservation::ReservationClient,
  sourceset::GroupSemantics,
  AdmissionRequest, Authenticator, Bridge, BridgeSelector, ChatRoom, Conference, ConferenceConfig,
  FeatureFlags, FocusError, MediaType, RoomEvent, Source, SourceGroup, SourceSet,
};
use focus_xmpp_parsers::{
  colibri2::{Action as BridgeAction, ConferenceModify},
  jingle::{Action as JingleAction, Description as JingleDescription, Jingle},
};
use jid::FullJid;
use tokio::{
  io::{AsyncReadExt, AsyncWriteExt},
  net::TcpListener,
  sync::mpsc,
};
use xmpp_parsers::{
  iq::{Iq, IqType},
  Element,
};

fn muc_jid(resource: &str) -> FullJid {
  format!("room@conference.example.com/{resource}").parse().unwrap()
}

fn occupant(resource: &str, available: bool) -> RoomEvent {
  RoomEvent::Occupant { muc_jid: muc_jid(resource), real_jid: None, nick: None, available }
}

/// A harness gluing a `Conference` to the two channels its wire traffic
/// flows over, with helpers to drain and decode what it sent.
struct Harness {
  conference: Conference,
  bridge_selector: BridgeSelector,
  jingle_rx: mpsc::Receiver<Element>,
  room_rx: mpsc::Receiver<Element>,
}

fn harness(config: ConferenceConfig, reservation: Option<ReservationClient>) -> Harness {
  let (room_tx, room_rx) = mpsc::channel(32);
  let chat_room = ChatRoom::new(
    config.room.clone(),
    "focus".to_owned(),
    "focus@auth.example.com/resource".parse().unwrap(),
    room_tx,
  );
  let (jingle_tx, jingle_rx) = mpsc::channel(32);
  let bridge_selector = BridgeSelector::new(100, Duration::from_secs(600));
  let conference = Conference::new(
    "meeting-1".to_owned(),
    config,
    chat_room,
    bridge_selector.clone(),
    Arc::new(Authenticator::new(AdmissionMode::XmppDomain)),
    reservation,
    jingle_tx,
  );
  Harness { conference, bridge_selector, jingle_rx, room_rx }
}

fn base_config() -> ConferenceConfig {
  ConferenceConfig {
    room: "room@conference.example.com".parse().unwrap(),
    focus_jid: "focus@auth.example.com".parse().unwrap(),
    region: None,
    features: FeatureFlags::default(),
  }
}

async fn next_iq_set(rx: &mut mpsc::Receiver<Element>) -> Element {
  let element = tokio::time::timeout(Duration::from_millis(500), rx.recv())
    .await
    .expect("a stanza was sent")
    .expect("channel still open");
  let iq = Iq::try_from(element).expect("stanza is a valid iq");
  match iq.payload {
    IqType::Set(payload) => payload,
    other => panic!("expected an iq type='set', got {other:?}"),
  }
}

fn audio_source(ssrc: u32, owner: &str) -> Source {
  Source::new(ssrc, MediaType::Audio, Some(owner.to_owned()))
}

fn jingle_ssrcs(jingle: &Jingle) -> Vec<u32> {
  jingle
    .contents
    .iter()
    .filter_map(|content| content.description.clone())
    .flat_map(|description| match description {
      JingleDescription::Rtp(rtp) => rtp.ssrcs.into_iter().map(|s| s.id).collect::<Vec<_>>(),
      JingleDescription::Unknown(_) => Vec::new(),
    })
    .collect()
}

/// S1: Alice joins an empty room and gets a `session-initiate`; Bob joins
/// and is offered Alice's sources; once Bob's own sources are accepted,
/// Alice receives a `source-add` for them; Bob leaving relays a
/// `source-remove` of his sources back to Alice, freeing his ssrcs.
#[tokio::test]
async fn duo_join_source_lifecycle() {
  let mut h = harness(base_config(), None);
  h.bridge_selector.upsert(Bridge::new("bridge@example.com".parse().unwrap(), None)).await;

  h.conference.handle_room_event(occupant("alice", true)).await.unwrap();
  let alice_initiate = Jingle::try_from(next_iq_set(&mut h.jingle_rx).await).unwrap();
  assert_eq!(alice_initiate.action, JingleAction::SessionInitiate);
  assert!(jingle_ssrcs(&alice_initiate).is_empty());
  let _alice_allocate = ConferenceModify::try_from(next_iq_set(&mut h.jingle_rx).await).unwrap();

  h.conference.on_session_accept("alice").await.unwrap();
  h.conference.apply_sources("alice", SourceSet { sources: vec![audio_source(1, "alice")], groups: vec![] }).await.unwrap();
  let _alice_source_map_notice = h.room_rx.recv().await.unwrap();

  h.conference.handle_room_event(occupant("bob", true)).await.unwrap();
  let bob_initiate = Jingle::try_from(next_iq_set(&mut h.jingle_rx).await).unwrap();
  assert_eq!(bob_initiate.action, JingleAction::SessionInitiate);
  assert_eq!(jingle_ssrcs(&bob_initiate), vec![1]);
  let _bob_allocate = ConferenceModify::try_from(next_iq_set(&mut h.jingle_rx).await).unwrap();

  h.conference.on_session_accept("bob").await.unwrap();
  h.conference.apply_sources("bob", SourceSet { sources: vec![audio_source(2, "bob")], groups: vec![] }).await.unwrap();
  let alice_source_add = Jingle::try_from(next_iq_set(&mut h.jingle_rx).await).unwrap();
  assert_eq!(alice_source_add.action, JingleAction::SourceAdd);
  assert_eq!(jingle_ssrcs(&alice_source_add), vec![2]);
  let _bob_source_map_notice = h.room_rx.recv().await.unwrap();

  h.conference.handle_room_event(occupant("bob", false)).await.unwrap();
  let alice_source_remove = Jingle::try_from(next_iq_set(&mut h.jingle_rx).await).unwrap();
  assert_eq!(alice_source_remove.action, JingleAction::SourceRemove);
  assert_eq!(jingle_ssrcs(&alice_source_remove), vec![2]);
  let bob_expire = ConferenceModify::try_from(next_iq_set(&mut h.jingle_rx).await).unwrap();
  assert_eq!(bob_expire.action, BridgeAction::Expire);
  assert!(bob_expire.endpoints[0].expire);

  // Bob's ssrc 2 must have been dropped from the conference map: a third
  // participant claiming it as their own must not collide.
  h.conference.apply_sources("carol", SourceSet { sources: vec![audio_source(2, "carol")], groups: vec![] }).await.unwrap();
}

/// S2: a reservation system's 403 rejection is surfaced as
/// `FocusError::Reservation` carrying the rejection's own message text,
/// and blocks `handle_conference_request` outright.
#[tokio::test]
async fn reservation_rejection_blocks_admission() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut socket, _) = listener.accept().await.unwrap();
    let mut buf = vec![0u8; 4096];
    let _ = socket.read(&mut buf).await;
    let body = br#"{"message":"not allowed"}"#;
    let response = format!(
      "HTTP/1.1 403 Forbidden\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
      body.len()
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.write_all(body).await;
    let _ = socket.shutdown().await;
  });

  let reservation = ReservationClient::new(format!("http://{addr}"));
  let h = harness(base_config(), Some(reservation));

  let request = AdmissionRequest {
    room: "room@conference.example.com".to_owned(),
    authenticated_user: Some("alice@example.com".to_owned()),
    session_token: None,
    machine_uid: "mac-1".to_owned(),
  };
  let result = h.conference.handle_conference_request(request).await;
  match result {
    Err(FocusError::Reservation { code, message }) => {
      assert_eq!(code, 403);
      assert_eq!(message, "not allowed");
    },
    other => panic!("expected a reservation rejection, got {other:?}"),
  }
}

/// S2b: a successful reservation is only made once per conference (a
/// second `handle_conference_request` must not re-POST), and `terminate`
/// releases the booking with a `DELETE` against the id the reservation
/// system handed back.
#[tokio::test]
async fn reservation_is_made_once_and_released_on_terminate() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let (seen_tx, mut seen_rx) = mpsc::channel::<String>(4);
  tokio::spawn(async move {
    loop {
      let Ok((mut socket, _)) = listener.accept().await else { break };
      let mut buf = vec![0u8; 4096];
      let n = socket.read(&mut buf).await.unwrap_or(0);
      let request = String::from_utf8_lossy(&buf[..n]).into_owned();
      let method = request.split_whitespace().next().unwrap_or("").to_owned();
      let _ = seen_tx.send(method.clone()).await;
      let body: &[u8] = if method == "DELETE" { b"" } else { br#"{"id":42,"duration":3600}"# };
      let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
      );
      let _ = socket.write_all(response.as_bytes()).await;
      let _ = socket.write_all(body).await;
      let _ = socket.shutdown().await;
    }
  });

  let reservation = ReservationClient::new(format!("http://{addr}"));
  let h = harness(base_config(), Some(reservation));

  let request = |user: &str| AdmissionRequest {
    room: "room@conference.example.com".to_owned(),
    authenticated_user: Some(user.to_owned()),
    session_token: None,
    machine_uid: "mac-1".to_owned(),
  };
  h.conference.handle_conference_request(request("alice@example.com")).await.unwrap();
  h.conference.handle_conference_request(request("bob@example.com")).await.unwrap();
  h.conference.terminate().await;

  let mut methods = Vec::new();
  while let Ok(method) = seen_rx.try_recv() {
    methods.push(method);
  }
  assert_eq!(methods, vec!["POST", "DELETE"]);
}

/// S3: pinning a room to a bridge version is exclusive — within the pin's
/// TTL a bridge of a different version is never selected, even though one
/// exists; once the pin expires, selection spills over.
#[tokio::test]
async fn bridge_version_pin_blocks_other_versions_until_expiry() {
  let selector = BridgeSelector::new(100, Duration::from_millis(30));
  let mut old = Bridge::new("bridge-old@example.com".parse().unwrap(), None);
  old.version = Some("1.0".to_owned());
  selector.upsert(old).await;

  selector.pin_version("room-1", "2.3".to_owned()).await;
  assert!(matches!(selector.select("room-1", None).await, Err(FocusError::ServiceUnavailable)));

  let mut pinned = Bridge::new("bridge-new@example.com".parse().unwrap(), None);
  pinned.version = Some("2.3".to_owned());
  selector.upsert(pinned).await;
  let selected = selector.select("room-1", None).await.unwrap();
  assert_eq!(selected.version.as_deref(), Some("2.3"));

  tokio::time::sleep(Duration::from_millis(60)).await;
  selector.remove(&"bridge-new@example.com".parse().unwrap()).await;
  let selected = selector.select("room-1", None).await.unwrap();
  assert_eq!(selected.version.as_deref(), Some("1.0"));
}

/// S4: a FID group with a single member is rejected as `bad-request`, and
/// the offending ssrc is never admitted to the conference-wide map.
#[tokio::test]
async fn invalid_group_arity_is_rejected_and_not_admitted() {
  let h = harness(base_config(), None);
  let bad = SourceSet {
    sources: vec![Source::new(5, MediaType::Video, Some("bob".to_owned()))],
    groups: vec![SourceGroup { semantics: GroupSemantics::Fid, ssrcs: vec![5] }],
  };
  match h.conference.apply_sources("bob", bad).await {
    Err(err @ FocusError::SourceRejected { tag: SourceRejectionTag::GroupArity, .. }) => {
      assert!(err.to_string().contains("Fid"))
    },
    other => panic!("expected a group-arity rejection, got {other:?}"),
  }

  // ssrc 5 was never admitted under bob: a different owner may claim it.
  h.conference
    .apply_sources("alice", SourceSet { sources: vec![Source::new(5, MediaType::Video, Some("alice".to_owned()))], groups: vec![] })
    .await
    .unwrap();
}

/// S5: when the bridge hosting two participants reports itself down, each
/// active session receives a `transport-replace` to the newly selected
/// bridge, and no `session-terminate` is ever issued.
#[tokio::test]
async fn bridge_failover_sends_transport_replace_to_every_session() {
  let mut h = harness(base_config(), None);
  let old_bridge: jid::Jid = "bridge-old@example.com".parse().unwrap();
  h.bridge_selector.upsert(Bridge::new(old_bridge.clone(), None)).await;

  h.conference.handle_room_event(occupant("alice", true)).await.unwrap();
  let _ = next_iq_set(&mut h.jingle_rx).await; // alice session-initiate
  let _ = next_iq_set(&mut h.jingle_rx).await; // alice allocate
  h.conference.on_session_accept("alice").await.unwrap();

  h.conference.handle_room_event(occupant("bob", true)).await.unwrap();
  let _ = next_iq_set(&mut h.jingle_rx).await; // bob session-initiate
  let _ = next_iq_set(&mut h.jingle_rx).await; // bob allocate
  h.conference.on_session_accept("bob").await.unwrap();

  h.bridge_selector.upsert(Bridge::new("bridge-new@example.com".parse().unwrap(), None)).await;
  h.conference.handle_bridge_down(&old_bridge).await.unwrap();

  let mut seen_actions = Vec::new();
  for _ in 0..3 {
    let element = tokio::time::timeout(Duration::from_millis(500), h.jingle_rx.recv()).await.unwrap().unwrap();
    let iq = Iq::try_from(element).unwrap();
    let payload = match iq.payload {
      IqType::Set(payload) => payload,
      other => panic!("expected iq type='set', got {other:?}"),
    };
    if let Ok(jingle) = Jingle::try_from(payload.clone()) {
      seen_actions.push(format!("{:?}", jingle.action));
    } else if let Ok(modify) = ConferenceModify::try_from(payload) {
      seen_actions.push(format!("{:?}", modify.action));
    }
  }
  assert!(!seen_actions.iter().any(|a| a == "SessionTerminate"));
  assert_eq!(seen_actions.iter().filter(|a| a.as_str() == "TransportReplace").count(), 2);
}

/// S6: a runner-up that's everyone's strong second choice outscores a
/// narrower first-choice majority (2 ballots pick AV1 first, 3 pick VP9
/// first: VP9's Borda total still wins since AV1 never sits lower than
/// second on anyone's ballot); since one ballot never named VP8, it is
/// dropped from the menu offered to visitors even though it outranks AV1
/// in the unrestricted ranking.
#[tokio::test]
async fn codec_aggregation_filters_visitor_menu_to_universal_support() {
  let h = harness(base_config(), None);
  for i in 0..2 {
    h.conference
      .record_codec_ballot(&format!("av1-first-{i}"), vec!["av1".to_owned(), "vp9".to_owned(), "vp8".to_owned()])
      .await;
  }
  for i in 0..3 {
    h.conference
      .record_codec_ballot(&format!("vp9-first-{i}"), vec!["vp9".to_owned(), "av1".to_owned(), "vp8".to_owned()])
      .await;
  }
  h.conference.record_codec_ballot("holdout", vec!["vp9".to_owned(), "av1".to_owned()]).await;

  let ranking = h.conference.codec_ranking().await;
  assert_eq!(ranking, vec!["vp9".to_owned(), "av1".to_owned(), "vp8".to_owned()]);

  let visitor_ranking = h.conference.visitor_codec_ranking().await;
  assert!(!visitor_ranking.contains(&"vp8".to_owned()));
  assert_eq!(visitor_ranking, vec!["vp9".to_owned(), "av1".to_owned()]);
}
