//! Per-participant bookkeeping: identity, role, capability flags and the
//! source set the participant has advertised.

use jid::FullJid;
use serde::Serialize;

use crate::sourceset::SourceSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Moderator,
  Participant,
  Visitor,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Capabilities {
  pub audio_muted: bool,
  pub video_muted: bool,
  pub supports_source_name: bool,
}

/// A single endpoint in the conference: one Jingle session, one nick, one
/// `SourceSet`. Owned by the `Conference`'s dispatch task; never shared
/// behind its own lock.
#[derive(Debug, Clone, Serialize)]
pub struct Participant {
  pub id: String,
  pub muc_jid: FullJid,
  pub nick: Option<String>,
  pub role: Role,
  pub region: Option<String>,
  pub capabilities: Capabilities,
  #[serde(skip)]
  pub sources: SourceSet,
}

impl Participant {
  pub fn new(id: String, muc_jid: FullJid, role: Role) -> Participant {
    Participant {
      id,
      muc_jid,
      nick: None,
      role,
      region: None,
      capabilities: Capabilities::default(),
      sources: SourceSet::new(),
    }
  }

  pub fn is_visitor(&self) -> bool {
    self.role == Role::Visitor
  }
}
