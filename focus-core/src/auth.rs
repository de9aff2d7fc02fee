//! Component I (admission): decides whether a conference-request is
//! allowed in, in one of two modes — trusting the XMPP server's own
//! authentication, or validating a session token this `Authenticator`
//! itself issued against a user principal and a machine UID.

use std::{
  collections::HashMap,
  sync::Arc,
  time::{Duration, Instant},
};

use tokio::sync::RwLock;

use crate::{config::AdmissionMode, error::FocusError, util::generate_id};

/// How long a session token may sit unused before `admit` starts treating
/// it as invalid rather than refreshing it.
pub const SESSION_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct AdmissionRequest {
  pub room: String,
  pub authenticated_user: Option<String>,
  /// The opaque id of a token previously returned by `Authenticator::issue`.
  /// Only consulted in `AdmissionMode::External`.
  pub session_token: Option<String>,
  pub machine_uid: String,
}

#[derive(Debug, Clone)]
struct SessionRecord {
  user_principal: String,
  bound_machine_uid: String,
  last_active: Instant,
}

/// A freshly issued session token, returned to whoever authenticated so it
/// can pass the id back on every subsequent `conference-request`. Nothing
/// outside `Authenticator` can derive a principal from the id alone.
#[derive(Debug, Clone)]
pub struct SessionToken {
  pub id: String,
  pub user_principal: String,
}

pub struct Authenticator {
  mode: AdmissionMode,
  sessions: Arc<RwLock<HashMap<String, SessionRecord>>>,
}

impl Authenticator {
  pub fn new(mode: AdmissionMode) -> Authenticator {
    Authenticator { mode, sessions: Arc::new(RwLock::new(HashMap::new())) }
  }

  /// Issue a fresh session token bound to `(user_principal, machine_uid)`.
  /// Called once some other layer (XMPP SASL, a `login` stanza carrying an
  /// already-verified credential) has established who the caller is; this
  /// only hands out the focus-local handle that binds that identity to one
  /// machine for the lifetime of the token.
  pub async fn issue(&self, user_principal: String, machine_uid: String) -> SessionToken {
    let id = generate_id();
    self.sessions.write().await.insert(
      id.clone(),
      SessionRecord { user_principal: user_principal.clone(), bound_machine_uid: machine_uid, last_active: Instant::now() },
    );
    SessionToken { id, user_principal }
  }

  /// Invalidate a previously issued token (a `logout`, or any other
  /// explicit end-of-session signal). A revoke of an unknown id is a no-op.
  pub async fn revoke(&self, id: &str) {
    self.sessions.write().await.remove(id);
  }

  /// Returns the admitted user principal, or the specific `FocusError`
  /// condition to report back to the requester.
  pub async fn admit(&self, request: &AdmissionRequest) -> Result<String, FocusError> {
    match self.mode {
      AdmissionMode::XmppDomain => request.authenticated_user.clone().ok_or(FocusError::NotAuthorized),
      AdmissionMode::External => {
        let id = request.session_token.as_deref().ok_or(FocusError::NotAuthorized)?;
        let mut sessions = self.sessions.write().await;
        let record = sessions.get_mut(id).ok_or(FocusError::SessionInvalid)?;
        if record.last_active.elapsed() > SESSION_INACTIVITY_TIMEOUT {
          sessions.remove(id);
          return Err(FocusError::SessionInvalid);
        }
        if record.bound_machine_uid != request.machine_uid {
          return Err(FocusError::Forbidden);
        }
        record.last_active = Instant::now();
        Ok(record.user_principal.clone())
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn request() -> AdmissionRequest {
    AdmissionRequest {
      room: "room@conference.example.com".to_owned(),
      authenticated_user: Some("alice@example.com".to_owned()),
      session_token: None,
      machine_uid: "mac-1".to_owned(),
    }
  }

  #[tokio::test]
  async fn xmpp_domain_mode_requires_authenticated_user() {
    let auth = Authenticator::new(AdmissionMode::XmppDomain);
    let mut req = request();
    req.authenticated_user = None;
    assert!(matches!(auth.admit(&req).await, Err(FocusError::NotAuthorized)));
  }

  #[tokio::test]
  async fn external_mode_rejects_an_unknown_token() {
    let auth = Authenticator::new(AdmissionMode::External);
    let mut req = request();
    req.session_token = Some("not-a-real-token".to_owned());
    assert!(matches!(auth.admit(&req).await, Err(FocusError::SessionInvalid)));
  }

  #[tokio::test]
  async fn external_mode_rejects_a_token_replayed_from_a_different_machine() {
    let auth = Authenticator::new(AdmissionMode::External);
    let token = auth.issue("alice@example.com".to_owned(), "mac-1".to_owned()).await;
    let mut req = request();
    req.session_token = Some(token.id);
    req.machine_uid = "mac-2".to_owned();
    assert!(matches!(auth.admit(&req).await, Err(FocusError::Forbidden)));
  }

  #[tokio::test]
  async fn external_mode_admits_a_correctly_bound_token() {
    let auth = Authenticator::new(AdmissionMode::External);
    let token = auth.issue("alice@example.com".to_owned(), "mac-1".to_owned()).await;
    let mut req = request();
    req.session_token = Some(token.id);
    assert_eq!(auth.admit(&req).await.unwrap(), "alice@example.com");
  }

  #[tokio::test]
  async fn revoking_a_token_invalidates_it() {
    let auth = Authenticator::new(AdmissionMode::External);
    let token = auth.issue("alice@example.com".to_owned(), "mac-1".to_owned()).await;
    auth.revoke(&token.id).await;
    let mut req = request();
    req.session_token = Some(token.id);
    assert!(matches!(auth.admit(&req).await, Err(FocusError::SessionInvalid)));
  }

  #[tokio::test]
  async fn a_token_idle_past_the_inactivity_timeout_is_invalid() {
    let auth = Authenticator::new(AdmissionMode::External);
    let token = auth.issue("alice@example.com".to_owned(), "mac-1".to_owned()).await;
    {
      let mut sessions = auth.sessions.write().await;
      let record = sessions.get_mut(&token.id).unwrap();
      record.last_active = Instant::now() - SESSION_INACTIVITY_TIMEOUT - Duration::from_secs(1);
    }
    let mut req = request();
    req.session_token = Some(token.id);
    assert!(matches!(auth.admit(&req).await, Err(FocusError::SessionInvalid)));
  }
}
