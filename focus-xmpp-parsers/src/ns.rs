//! Namespace constants for the non-standard elements Jitsi Meet uses.

/// Colibri WebSocket details embedded in an ICE-UDP transport.
pub const JITSI_COLIBRI: &str = "http://jitsi.org/protocol/colibri";

/// `ssrc-info`/muted-presence extensions.
pub const JITSI_MEET: &str = "http://jitsi.org/jitmeet";

/// The `conference` IQ namespace used to address the conference focus.
pub const JITSI_FOCUS: &str = "http://jitsi.org/protocol/focus";

/// Compact-JSON `json-message` wrapper namespace.
pub const JITSI_JITMEET: &str = "http://jitsi.org/jitmeet";

/// Colibri2 bridge-control protocol (conference allocate/modify/expire).
pub const COLIBRI2: &str = "jitsi:colibri2";

/// XEP-0215: External Service Discovery.
pub const EXTDISCO: &str = "urn:xmpp:extdisco:2";
