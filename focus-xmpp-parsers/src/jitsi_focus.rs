//! The `conference` IQ addressed to the focus, and the compact-JSON
//! `json-message` wrapper used for source-map updates.

use std::{collections::HashMap, convert::TryFrom};

use xmpp_parsers::{iq::IqSetPayload, Element, Error};

use crate::ns::{self, JITSI_FOCUS, JITSI_JITMEET};

/// Request (or confirmation) that a room is associated with a conference.
#[derive(Debug, Clone, PartialEq)]
pub struct Conference {
  pub machine_uid: String,
  pub room: String,
  pub properties: HashMap<String, String>,
}

impl IqSetPayload for Conference {}

impl TryFrom<Element> for Conference {
  type Error = Error;

  fn try_from(root: Element) -> Result<Conference, Error> {
    check_self!(root, "conference", JITSI_FOCUS, "Conference");
    let machine_uid = get_attr!(root, "machine-uid", Required);
    let room = get_attr!(root, "room", Required);
    let mut properties = HashMap::new();
    for child in root.children() {
      if child.is("property", ns::JITSI_FOCUS) {
        let name = child
          .attr("name")
          .ok_or(Error::ParseError("Missing 'name' attribute on property."))?
          .to_owned();
        let value = child.attr("value").unwrap_or_default().to_owned();
        properties.insert(name, value);
      }
    }
    Ok(Conference { machine_uid, room, properties })
  }
}

impl From<Conference> for Element {
  fn from(conference: Conference) -> Element {
    let mut builder = Element::builder("conference", ns::JITSI_FOCUS)
      .attr("machine-uid", conference.machine_uid)
      .attr("room", conference.room);
    for (name, value) in conference.properties {
      builder = builder.append(
        Element::builder("property", ns::JITSI_FOCUS)
          .attr("name", name)
          .attr("value", value)
          .build(),
      );
    }
    builder.build()
  }
}

/// Compact-JSON payload wrapper (source maps, lobby/av-moderation events).
#[derive(Debug, Clone, PartialEq)]
pub struct JsonMessage {
  pub payload: serde_json::Value,
}

impl TryFrom<Element> for JsonMessage {
  type Error = Error;

  fn try_from(root: Element) -> Result<JsonMessage, Error> {
    check_self!(root, "json-message", JITSI_JITMEET, "JsonMessage");
    let text = root.text();
    let payload = serde_json::from_str(&text)
      .map_err(|_| Error::ParseError("Invalid JSON in json-message."))?;
    Ok(JsonMessage { payload })
  }
}

impl From<JsonMessage> for Element {
  fn from(message: JsonMessage) -> Element {
    Element::builder("json-message", ns::JITSI_JITMEET)
      .append(message.payload.to_string())
      .build()
  }
}
