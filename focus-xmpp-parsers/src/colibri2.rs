//! Colibri2: the focus-to-bridge control protocol used to allocate, modify
//! and expire per-conference channel shards on a media bridge.

use xmpp_parsers::{
  iq::IqSetPayload,
  ns::{JINGLE_ICE_UDP, JINGLE_SSMA},
};

use crate::{jingle_ice_udp::Transport, jingle_ssma::Group, ns::COLIBRI2};

generate_attribute!(
  /// Whether a media type endpoint is requested to be created, updated or torn down.
  Action, "action", {
    Allocate => "allocate",
    Update => "update",
    Expire => "expire",
  }
);

generate_element!(
  /// The root Colibri2 conference-modify container, addressed to a bridge.
  ConferenceModify, "conference-modify", COLIBRI2,
  attributes: [
    /// The meeting id this shard belongs to.
    meeting_id: Required<String> = "meeting-id",

    /// The action to apply to the listed endpoints.
    action: Required<Action> = "action",
  ],
  children: [
    /// Per-endpoint channel shards to allocate/update/expire.
    endpoints: Vec<Endpoint> = ("endpoint", COLIBRI2) => Endpoint,

    /// The sources visible on this bridge after the request is applied.
    sources: Option<Sources> = ("sources", COLIBRI2) => Sources
  ]
);

impl IqSetPayload for ConferenceModify {}

generate_element!(
  /// A single endpoint's channel-shard request.
  Endpoint, "endpoint", COLIBRI2,
  attributes: [
    /// The endpoint (participant) id.
    id: Required<String> = "id",

    /// True if this endpoint should be created/updated with sending capability.
    create: Default<bool> = "create",

    /// True if this endpoint's shard should be expired.
    expire: Default<bool> = "expire",
  ],
  children: [
    /// The ICE-UDP transport for this endpoint's shard.
    transport: Option<Transport> = ("transport", JINGLE_ICE_UDP) => Transport,

    /// SSRC groups owned by this endpoint.
    sources: Vec<Group> = ("ssrc-group", JINGLE_SSMA) => Group
  ]
);

impl Endpoint {
  pub fn new(id: String) -> Endpoint {
    Endpoint { id, create: false, expire: false, transport: None, sources: Vec::new() }
  }

  pub fn with_create(mut self) -> Endpoint {
    self.create = true;
    self
  }

  pub fn with_expire(mut self) -> Endpoint {
    self.expire = true;
    self
  }
}

generate_element!(
  /// The aggregate view of sources present on a bridge shard.
  Sources, "sources", COLIBRI2,
  children: [
    groups: Vec<Group> = ("ssrc-group", JINGLE_SSMA) => Group
  ]
);

generate_element!(
  /// Periodic bridge stats pushed alongside a conference-modify response.
  BridgeStats, "stats", COLIBRI2,
  attributes: [
    /// Current bitrate in kbps, summed across participants.
    bitrate_download: Default<u32> = "bitrate-download",
    bitrate_upload: Default<u32> = "bitrate-upload",

    /// Reported CPU/packet-loss stress in the 0.0-1.0 range, times 1000 for wire transport.
    stress_level_millis: Default<u32> = "stress-level",

    /// Number of conferences currently hosted.
    conference_count: Default<u32> = "conferences",

    /// Number of participants currently hosted.
    participant_count: Default<u32> = "participants",
  ]
);
