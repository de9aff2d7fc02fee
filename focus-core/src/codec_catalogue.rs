//! The codec/extension catalogue an offer is assembled from, and the
//! Borda-count aggregation of participants' codec preferences.
//!
//! Payload-type and extension numbers are fixed for the lifetime of a
//! conference process so that the same number always carries the same
//! meaning across every participant's offer.

use std::collections::{HashMap, HashSet};

use xmpp_parsers::{jingle_rtcp_fb::RtcpFb, jingle_rtp::PayloadType, jingle_rtp_hdrext::RtpHdrext};

/// One video codec's primary and (if any) paired retransmission payload type.
#[derive(Debug, Clone, Copy)]
pub struct VideoCodec {
  pub name: &'static str,
  pub payload_type: u8,
  pub rtx_payload_type: Option<u8>,
}

pub const OPUS_PT: u8 = 111;
pub const TELEPHONE_EVENT_PT: u8 = 126;

pub const VIDEO_CODECS: &[VideoCodec] = &[
  VideoCodec { name: "vp8", payload_type: 100, rtx_payload_type: Some(96) },
  VideoCodec { name: "vp9", payload_type: 101, rtx_payload_type: Some(97) },
  VideoCodec { name: "h264", payload_type: 107, rtx_payload_type: Some(99) },
  VideoCodec { name: "av1", payload_type: 98, rtx_payload_type: Some(35) },
];

/// Header extension id assignments, keyed by recognized URI suffix.
pub const HEADER_EXTENSIONS: &[(&str, u8, &str)] = &[
  (
    "ssrc-audio-level",
    1,
    "urn:ietf:params:rtp-hdrext:ssrc-audio-level",
  ),
  ("mid", 3, "urn:ietf:params:rtp-hdrext:sdes:mid"),
  (
    "abs-send-time",
    4,
    "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
  ),
  (
    "toffset",
    2,
    "urn:ietf:params:rtp-hdrext:toffset",
  ),
  (
    "framemarking",
    9,
    "http://tools.ietf.org/html/draft-ietf-avtext-framemarking-07",
  ),
  (
    "video-content-type",
    7,
    "http://jitsi.org/meet/video-content-type",
  ),
  (
    "rid",
    10,
    "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id",
  ),
  (
    "transport-cc",
    5,
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01",
  ),
  (
    "av1-dd",
    11,
    "https://aomediacodec.github.io/av1-rtp-spec/#dependency-descriptor-rtp-header-extension",
  ),
  (
    "video-layers-allocation",
    12,
    "http://www.webrtc.org/experiments/rtp-hdrext/video-layers-allocation00",
  ),
];

/// Build the `payload-type` entry for `codec`, including its RTCP-feedback
/// set when `codec` is a video codec.
pub fn build_payload_type(codec: &VideoCodec, transport_cc: bool, goog_remb: bool) -> PayloadType {
  let mut pt = PayloadType::new(codec.payload_type, codec.name.to_owned(), 90000, 1);
  pt.rtcp_fbs.push(RtcpFb { type_: "ccm".to_owned(), subtype: Some("fir".to_owned()) });
  pt.rtcp_fbs.push(RtcpFb { type_: "nack".to_owned(), subtype: None });
  pt.rtcp_fbs.push(RtcpFb { type_: "nack".to_owned(), subtype: Some("pli".to_owned()) });
  if transport_cc {
    pt.rtcp_fbs.push(RtcpFb { type_: "transport-cc".to_owned(), subtype: None });
  }
  if goog_remb {
    pt.rtcp_fbs.push(RtcpFb { type_: "goog-remb".to_owned(), subtype: None });
  }
  pt
}

/// Build the paired `rtx` payload-type pointing back at `codec`'s primary
/// payload type via the `apt` parameter.
pub fn build_rtx_payload_type(codec: &VideoCodec) -> Option<PayloadType> {
  let rtx_pt = codec.rtx_payload_type?;
  let mut pt = PayloadType::new(rtx_pt, "rtx".to_owned(), 90000, 1);
  pt.parameters.push(xmpp_parsers::jingle_rtp::Parameter { name: "apt".to_owned(), value: codec.payload_type.to_string() });
  Some(pt)
}

pub fn build_opus_payload_type(use_inband_fec: bool, minptime: u32) -> PayloadType {
  let mut pt = PayloadType::new(OPUS_PT, "opus".to_owned(), 48000, 2);
  pt.parameters.push(xmpp_parsers::jingle_rtp::Parameter { name: "minptime".to_owned(), value: minptime.to_string() });
  if use_inband_fec {
    pt.parameters.push(xmpp_parsers::jingle_rtp::Parameter { name: "useinbandfec".to_owned(), value: "1".to_owned() });
  }
  pt
}

pub fn build_telephone_event_payload_type() -> PayloadType {
  PayloadType::new(TELEPHONE_EVENT_PT, "telephone-event".to_owned(), 8000, 1)
}

pub fn build_header_extensions(enabled: &[&str]) -> Vec<RtpHdrext> {
  HEADER_EXTENSIONS
    .iter()
    .filter(|(name, _, _)| enabled.contains(name))
    .map(|(_, id, uri)| RtpHdrext::new(id.to_string(), uri.to_string()))
    .collect()
}

/// Aggregate each participant's ranked codec preference list into a single
/// conference-wide ranking, highest score first.
pub fn borda_count(ballots: &[Vec<String>]) -> Vec<String> {
  let mut scores: HashMap<String, u64> = HashMap::new();
  for ballot in ballots {
    let n = ballot.len();
    for (rank, codec) in ballot.iter().enumerate() {
      // First preference earns n points, last earns 1.
      *scores.entry(codec.clone()).or_insert(0) += (n - rank) as u64;
    }
  }
  let mut ranked: Vec<(String, u64)> = scores.into_iter().collect();
  ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
  ranked.into_iter().map(|(codec, _)| codec).collect()
}

/// Restrict `ranking` to codecs every ballot named. Visitors never get a
/// chance to renegotiate, so they are only ever offered codecs the whole
/// room is already known to support.
pub fn universally_supported(ballots: &[Vec<String>], ranking: &[String]) -> Vec<String> {
  let mut ballots = ballots.iter();
  let common = match ballots.next() {
    Some(first) => {
      let first: HashSet<&String> = first.iter().collect();
      ballots.fold(first, |acc, ballot| {
        let this: HashSet<&String> = ballot.iter().collect();
        acc.intersection(&this).cloned().collect()
      })
    },
    None => return ranking.to_vec(),
  };
  ranking.iter().filter(|codec| common.contains(codec)).cloned().collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn majority_runner_up_beats_minority_first_choice() {
    let ballots = vec![
      vec!["av1".to_owned(), "vp9".to_owned()],
      vec!["vp9".to_owned(), "av1".to_owned()],
      vec!["vp9".to_owned(), "av1".to_owned()],
    ];
    let ranking = borda_count(&ballots);
    assert_eq!(ranking[0], "vp9");
  }

  #[test]
  fn empty_ballots_produce_empty_ranking() {
    assert!(borda_count(&[]).is_empty());
  }

  #[test]
  fn universally_supported_drops_a_codec_one_ballot_omitted() {
    let ballots = vec![
      vec!["av1".to_owned(), "vp9".to_owned(), "vp8".to_owned()],
      vec!["vp9".to_owned(), "av1".to_owned()],
    ];
    let ranking = borda_count(&ballots);
    assert!(ranking.contains(&"vp8".to_owned()));
    let visitor_ranking = universally_supported(&ballots, &ranking);
    assert!(!visitor_ranking.contains(&"vp8".to_owned()));
    assert_eq!(visitor_ranking.len(), 2);
  }
}
