//! The Jingle signaling session between the focus and a single participant:
//! offer/answer negotiation and incremental source add/remove, without any
//! media transport of our own (the bridge terminates ICE/DTLS, we relay).

use std::{collections::HashMap, time::Duration};

use focus_xmpp_parsers::jingle::{Action, Content, Jingle};
use jid::Jid;
use tokio::sync::oneshot;
use xmpp_parsers::jingle::SessionId;

use crate::{error::FocusError, util::generate_id};

/// How long we wait for a participant to answer a session-initiate.
pub const SESSION_INITIATE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
  Pending,
  Active,
  Ended,
}

/// A single participant's Jingle session, owned by the `Conference` that
/// created it. Not `Send`-shared directly; the owning conference's
/// dispatch queue is the only writer (see `iq_router`).
pub struct Session {
  pub sid: SessionId,
  pub peer: Jid,
  pub state: SessionState,
  pending_accept: Option<oneshot::Sender<()>>,
  /// Waiters for a blocking send (`source_add_with_ack`/`source_remove_with_ack`),
  /// keyed by the IQ id the peer's reply is addressed back to.
  pending_replies: HashMap<String, oneshot::Sender<Result<(), FocusError>>>,
}

impl Session {
  pub fn new(peer: Jid) -> Session {
    Session {
      sid: SessionId(generate_id()),
      peer,
      state: SessionState::Pending,
      pending_accept: None,
      pending_replies: HashMap::new(),
    }
  }

  /// Build the `session-initiate` Jingle payload offering the given contents,
  /// and register a one-shot slot that `on_session_accept` will resolve.
  pub fn initiate(&mut self, initiator: Jid, contents: Vec<Content>) -> (Jingle, oneshot::Receiver<()>) {
    let (tx, rx) = oneshot::channel();
    self.pending_accept = Some(tx);
    let jingle = Jingle::new(Action::SessionInitiate, self.sid.clone())
      .with_initiator(initiator)
      .with_responder(self.peer.clone());
    let jingle = contents.into_iter().fold(jingle, |jingle, content| jingle.add_content(content));
    (jingle, rx)
  }

  /// Called when the peer's `session-accept` arrives for this session.
  pub fn on_session_accept(&mut self) -> Result<(), FocusError> {
    if self.state != SessionState::Pending {
      return Err(FocusError::Conflict);
    }
    self.state = SessionState::Active;
    if let Some(tx) = self.pending_accept.take() {
      let _ = tx.send(());
    }
    Ok(())
  }

  /// Build a `source-add` Jingle payload adding `set` to an existing active session.
  pub fn source_add(&self, contents: Vec<Content>) -> Result<Jingle, FocusError> {
    self.require_active()?;
    Ok(contents.into_iter().fold(Jingle::new(Action::SourceAdd, self.sid.clone()), |j, c| j.add_content(c)))
  }

  /// Build a `source-remove` Jingle payload removing `set` from an active session.
  pub fn source_remove(&self, contents: Vec<Content>) -> Result<Jingle, FocusError> {
    self.require_active()?;
    Ok(contents.into_iter().fold(Jingle::new(Action::SourceRemove, self.sid.clone()), |j, c| j.add_content(c)))
  }

  /// Blocking form of `source_add`: builds the payload under a fresh IQ id
  /// and registers a waiter that `resolve_reply` fulfills once the peer's
  /// answer for that id arrives. The caller is responsible for sending the
  /// returned `Jingle` under the returned id and awaiting the receiver.
  pub fn source_add_with_ack(
    &mut self,
    contents: Vec<Content>,
  ) -> Result<(String, Jingle, oneshot::Receiver<Result<(), FocusError>>), FocusError> {
    self.require_active()?;
    Ok(self.register_ack(Action::SourceAdd, contents))
  }

  /// Blocking form of `source_remove`, see `source_add_with_ack`.
  pub fn source_remove_with_ack(
    &mut self,
    contents: Vec<Content>,
  ) -> Result<(String, Jingle, oneshot::Receiver<Result<(), FocusError>>), FocusError> {
    self.require_active()?;
    Ok(self.register_ack(Action::SourceRemove, contents))
  }

  fn register_ack(
    &mut self,
    action: Action,
    contents: Vec<Content>,
  ) -> (String, Jingle, oneshot::Receiver<Result<(), FocusError>>) {
    let id = generate_id();
    let (tx, rx) = oneshot::channel();
    self.pending_replies.insert(id.clone(), tx);
    let jingle = contents.into_iter().fold(Jingle::new(action, self.sid.clone()), |j, c| j.add_content(c));
    (id, jingle, rx)
  }

  /// Fulfill the waiter registered for `id` (from `*_with_ack`), if any.
  /// Called once the peer's `iq` reply for that id is observed.
  pub fn resolve_reply(&mut self, id: &str, outcome: Result<(), FocusError>) {
    if let Some(tx) = self.pending_replies.remove(id) {
      let _ = tx.send(outcome);
    }
  }

  /// Dispatch one inbound signaling stanza from this session's peer:
  /// `session-accept`, `transport-info`, or a `source-add`/`source-remove`
  /// the peer initiated on its own (e.g. turning on a camera).
  pub fn process_incoming(&mut self, jingle: &Jingle) -> Result<IncomingSessionEvent, FocusError> {
    match jingle.action {
      Action::SessionAccept => {
        self.on_session_accept()?;
        Ok(IncomingSessionEvent::Accepted)
      },
      Action::SourceAdd => {
        self.require_active()?;
        Ok(IncomingSessionEvent::SourcesAdded)
      },
      Action::SourceRemove => {
        self.require_active()?;
        Ok(IncomingSessionEvent::SourcesRemoved)
      },
      Action::TransportInfo => {
        self.require_active()?;
        Ok(IncomingSessionEvent::TransportInfo)
      },
      other => Err(FocusError::BadRequest(format!("unexpected inbound jingle action {:?}", other))),
    }
  }

  /// Build a `transport-replace` Jingle payload, used on bridge failover.
  pub fn transport_replace(&self, contents: Vec<Content>) -> Result<Jingle, FocusError> {
    self.require_active()?;
    Ok(contents.into_iter().fold(Jingle::new(Action::TransportReplace, self.sid.clone()), |j, c| j.add_content(c)))
  }

  pub fn terminate(&mut self) {
    self.state = SessionState::Ended;
  }

  fn require_active(&self) -> Result<(), FocusError> {
    match self.state {
      SessionState::Active => Ok(()),
      _ => Err(FocusError::SessionInvalid),
    }
  }
}

/// What `process_incoming` determined an inbound stanza meant. The caller
/// (the owning `Conference`) still has to apply the source delta itself —
/// the session only knows whether the action was legal in its own state
/// machine, not the conference-wide source topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingSessionEvent {
  Accepted,
  SourcesAdded,
  SourcesRemoved,
  TransportInfo,
}

#[cfg(test)]
mod tests {
  use super::*;
  fn peer() -> Jid {
    "room@conference.example.com/alice".parse().unwrap()
  }

  #[test]
  fn source_add_before_accept_is_rejected() {
    let session = Session::new(peer());
    assert!(matches!(session.source_add(vec![]), Err(FocusError::SessionInvalid)));
  }

  #[test]
  fn accept_transitions_to_active_and_resolves_waiter() {
    let mut session = Session::new(peer());
    let (_jingle, rx) = session.initiate(peer(), vec![]);
    session.on_session_accept().unwrap();
    assert_eq!(session.state, SessionState::Active);
    assert!(rx.try_recv().is_ok());
  }

  #[test]
  fn double_accept_is_a_conflict() {
    let mut session = Session::new(peer());
    let _ = session.initiate(peer(), vec![]);
    session.on_session_accept().unwrap();
    assert!(matches!(session.on_session_accept(), Err(FocusError::Conflict)));
  }

  #[test]
  fn source_add_with_ack_is_rejected_before_accept() {
    let mut session = Session::new(peer());
    assert!(matches!(session.source_add_with_ack(vec![]), Err(FocusError::SessionInvalid)));
  }

  #[test]
  fn resolve_reply_fulfills_the_matching_waiter() {
    let mut session = Session::new(peer());
    let _ = session.initiate(peer(), vec![]);
    session.on_session_accept().unwrap();
    let (id, _jingle, mut rx) = session.source_add_with_ack(vec![]).unwrap();
    session.resolve_reply(&id, Ok(()));
    assert_eq!(rx.try_recv().unwrap(), Ok(()));
  }

  #[test]
  fn process_incoming_session_accept_activates_the_session() {
    let mut session = Session::new(peer());
    let (_jingle, _rx) = session.initiate(peer(), vec![]);
    let jingle = Jingle::new(Action::SessionAccept, session.sid.clone());
    assert_eq!(session.process_incoming(&jingle).unwrap(), IncomingSessionEvent::Accepted);
    assert_eq!(session.state, SessionState::Active);
  }

  #[test]
  fn process_incoming_source_add_before_accept_is_rejected() {
    let mut session = Session::new(peer());
    let jingle = Jingle::new(Action::SourceAdd, session.sid.clone());
    assert!(matches!(session.process_incoming(&jingle), Err(FocusError::SessionInvalid)));
  }
}
