//! Typed XMPP/Jingle/Colibri2 elements used by the conference focus.

#[macro_use]
mod macros;

pub mod helpers;
pub mod jingle;
pub mod jingle_dtls_srtp;
pub mod jingle_ice_udp;
pub mod jingle_rtp;
pub mod jingle_ssma;

pub mod colibri2;
pub mod jitsi_focus;
pub mod ns;
