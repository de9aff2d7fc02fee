//! The MUC adapter: joins the conference's chat room, tracks who is
//! present via roster presence, and exposes join/leave events to the
//! owning `Conference` — the core never speaks MUC presence XML directly.

use std::convert::TryFrom;

use anyhow::{Context, Result};
use jid::{BareJid, FullJid, Jid};
use tokio::sync::mpsc;
use xmpp_parsers::{
  muc::{user::Status as MucStatus, Muc, MucUser},
  nick::Nick,
  ns,
  presence::{self, Presence},
  Element,
};

use crate::util::generate_id;

/// An event the chat room adapter surfaces to the conference orchestrator.
#[derive(Debug, Clone)]
pub enum RoomEvent {
  Joined { room_created: bool },
  Occupant { muc_jid: FullJid, real_jid: Option<Jid>, nick: Option<String>, available: bool },
  Left,
}

/// Thin wrapper over the XMPP transport scoped to one MUC room.
#[derive(Clone)]
pub struct ChatRoom {
  room: BareJid,
  own_jid: FullJid,
  nick: String,
  tx: mpsc::Sender<Element>,
}

impl ChatRoom {
  pub fn new(room: BareJid, nick: String, own_jid: FullJid, tx: mpsc::Sender<Element>) -> ChatRoom {
    ChatRoom { room, nick, own_jid, tx }
  }

  pub fn own_full_jid(&self) -> Result<FullJid> {
    Ok(self.room.clone().with_resource_str(&self.nick)?)
  }

  /// Send initial presence to enter the room (XEP-0045 §7.2).
  pub async fn join(&self) -> Result<()> {
    let full_room_jid = self.own_full_jid()?;
    let presence = Presence::new(presence::Type::None)
      .with_from(Jid::Full(self.own_jid.clone()))
      .with_to(Jid::Full(full_room_jid))
      .with_payloads(vec![
        Muc::new().into(),
        Nick(self.nick.clone()).into(),
      ]);
    self.tx.send(presence.into()).await.context("sending MUC join presence")?;
    Ok(())
  }

  pub async fn leave(&self) -> Result<()> {
    let full_room_jid = self.own_full_jid()?;
    let presence = Presence::new(presence::Type::Unavailable)
      .with_from(Jid::Full(self.own_jid.clone()))
      .with_to(Jid::Full(full_room_jid));
    self.tx.send(presence.into()).await.context("sending MUC leave presence")?;
    Ok(())
  }

  /// Interpret one inbound presence stanza addressed to this room,
  /// returning the event it represents (or `None` if it isn't ours, or
  /// lacks the `muc#user` payload we need to resolve the real JID).
  pub fn interpret_presence(&self, presence: Presence) -> Result<Option<RoomEvent>> {
    let from = match presence.from.clone() {
      Some(Jid::Full(from)) => from,
      _ => return Ok(None),
    };
    let bare_from: BareJid = from.clone().into();
    if bare_from != self.room {
      return Ok(None);
    }
    if from.resource == self.nick {
      return Ok(match presence.type_ {
        presence::Type::Unavailable => Some(RoomEvent::Left),
        _ => {
          let created = presence
            .payloads
            .iter()
            .find(|e| e.is("x", ns::MUC_USER))
            .map(|e| MucUser::try_from(e.clone()))
            .transpose()?
            .map(|u| u.status.contains(&MucStatus::RoomCreated))
            .unwrap_or(false);
          Some(RoomEvent::Joined { room_created: created })
        },
      });
    }

    let nick_payload = presence
      .payloads
      .iter()
      .find(|e| e.is("nick", ns::NICK))
      .map(|e| Nick::try_from(e.clone()))
      .transpose()?;
    let real_jid = presence
      .payloads
      .iter()
      .find(|e| e.is("x", ns::MUC_USER))
      .map(|e| MucUser::try_from(e.clone()))
      .transpose()?
      .and_then(|user| user.items.into_iter().find_map(|item| item.jid));

    Ok(Some(RoomEvent::Occupant {
      muc_jid: from,
      real_jid,
      nick: nick_payload.map(|n| n.0),
      available: presence.type_ != presence::Type::Unavailable,
    }))
  }

  /// Send a group chat message into the room (e.g. lobby/av-moderation notices).
  pub async fn send_message(&self, element: Element) -> Result<()> {
    let message = xmpp_parsers::message::Message {
      from: Some(Jid::Full(self.own_jid.clone())),
      to: Some(Jid::Bare(self.room.clone())),
      id: Some(generate_id()),
      type_: xmpp_parsers::message::MessageType::Groupchat,
      bodies: Default::default(),
      subjects: Default::default(),
      thread: None,
      payloads: vec![element],
    };
    self.tx.send(message.into()).await.context("sending MUC message")?;
    Ok(())
  }
}
