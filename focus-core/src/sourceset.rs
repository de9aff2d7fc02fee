//! The source topology model: a participant's media sources, grouped
//! into SSRC groups (simulcast/FID/FEC-FR), aggregated per-conference.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{FocusError, SourceRejectionTag};

/// Per-owner cap on advertised sources of a single media kind, enforced by
/// `ConferenceSourceMap::add`. Generous enough for simulcast + RTX + FEC-FR
/// layers on both audio and video, low enough to bound one rogue client.
const MAX_SOURCES_PER_OWNER_PER_MEDIA: usize = 20;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
  Video,
  Audio,
}

impl MediaType {
  pub fn jitsi_muted_presence_element_name(&self) -> &'static str {
    match self {
      MediaType::Video => "videomuted",
      MediaType::Audio => "audiomuted",
    }
  }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoType {
  Camera,
  Desktop,
}

/// SSRC grouping semantics, mirrors `focus_xmpp_parsers::jingle_ssma::Semantics`.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupSemantics {
  /// Forward Error Correction, fixed arity 2 (primary + FEC).
  Fec,
  /// Flow Identification, fixed arity 2 (primary + RTX).
  Fid,
  /// Simulcast, arity >= 2.
  Sim,
}

impl GroupSemantics {
  fn min_arity(self) -> usize {
    match self {
      GroupSemantics::Fec | GroupSemantics::Fid => 2,
      GroupSemantics::Sim => 2,
    }
  }

  fn fixed_arity(self) -> Option<usize> {
    match self {
      GroupSemantics::Fec | GroupSemantics::Fid => Some(2),
      GroupSemantics::Sim => None,
    }
  }
}

/// A single media source: one SSRC, owned by a participant (or injected by
/// the focus itself, e.g. for a mix-minus or recording track).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
  pub ssrc: u32,
  pub media_type: MediaType,
  pub owner: Option<String>,
  pub msid: Option<String>,
  pub video_type: Option<VideoType>,
  pub injected: bool,
  pub muted: bool,
}

impl Source {
  pub fn new(ssrc: u32, media_type: MediaType, owner: Option<String>) -> Source {
    Source { ssrc, media_type, owner, msid: None, video_type: None, injected: false, muted: false }
  }
}

/// A group of sources sharing an SSRC-group semantic (e.g. simulcast layers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceGroup {
  pub semantics: GroupSemantics,
  pub ssrcs: Vec<u32>,
}

/// One participant's full set of advertised sources and groups.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceSet {
  pub sources: Vec<Source>,
  pub groups: Vec<SourceGroup>,
}

impl SourceSet {
  pub fn new() -> SourceSet {
    SourceSet::default()
  }

  /// Validate structural invariants local to this set: unique ssrc per
  /// owner/kind, group arity, group members present among `sources`.
  pub fn validate(&self) -> Result<(), FocusError> {
    let mut seen = HashSet::new();
    for source in &self.sources {
      if !seen.insert(source.ssrc) {
        return Err(FocusError::source_rejected(
          SourceRejectionTag::DuplicateSource,
          format!("duplicate source ssrc {}", source.ssrc),
        ));
      }
    }
    let known: HashSet<u32> = self.sources.iter().map(|s| s.ssrc).collect();
    for group in &self.groups {
      if let Some(arity) = group.semantics.fixed_arity() {
        if group.ssrcs.len() != arity {
          return Err(FocusError::source_rejected(
            SourceRejectionTag::GroupArity,
            format!("{:?} group must have exactly {} members, got {}", group.semantics, arity, group.ssrcs.len()),
          ));
        }
      } else if group.ssrcs.len() < group.semantics.min_arity() {
        return Err(FocusError::source_rejected(
          SourceRejectionTag::GroupArity,
          format!("{:?} group must have at least {} members", group.semantics, group.semantics.min_arity()),
        ));
      }
      for ssrc in &group.ssrcs {
        if !known.contains(ssrc) {
          return Err(FocusError::source_rejected(
            SourceRejectionTag::GroupMemberMissing,
            format!("group references unknown ssrc {}", ssrc),
          ));
        }
      }
    }
    Ok(())
  }

  /// Commutative union: every source/group present in either set, with
  /// same-ssrc collisions (a re-advertisement of an unchanged source) broken
  /// deterministically so the result doesn't depend on argument order.
  pub fn add(&self, other: &SourceSet) -> SourceSet {
    let mut by_ssrc: HashMap<u32, Source> = HashMap::new();
    for source in self.sources.iter().chain(other.sources.iter()) {
      by_ssrc
        .entry(source.ssrc)
        .and_modify(|existing| {
          if format!("{:?}", source) > format!("{:?}", existing) {
            *existing = source.clone();
          }
        })
        .or_insert_with(|| source.clone());
    }
    let mut sources: Vec<Source> = by_ssrc.into_values().collect();
    sources.sort_by_key(|s| s.ssrc);

    let mut by_group: HashMap<(GroupSemantics, Vec<u32>), SourceGroup> = HashMap::new();
    for group in self.groups.iter().chain(other.groups.iter()) {
      let mut ssrcs = group.ssrcs.clone();
      ssrcs.sort_unstable();
      by_group.entry((group.semantics, ssrcs.clone())).or_insert_with(|| SourceGroup { semantics: group.semantics, ssrcs });
    }
    let groups: Vec<SourceGroup> = by_group.into_values().collect();

    SourceSet { sources, groups }
  }

  /// Difference: every source in `self` whose ssrc isn't in `other`, and
  /// every group none of whose members were removed.
  pub fn remove(&self, other: &SourceSet) -> SourceSet {
    let removed_ssrcs: HashSet<u32> = other.sources.iter().map(|s| s.ssrc).collect();
    let sources: Vec<Source> = self.sources.iter().filter(|s| !removed_ssrcs.contains(&s.ssrc)).cloned().collect();
    let remaining_ssrcs: HashSet<u32> = sources.iter().map(|s| s.ssrc).collect();
    let groups: Vec<SourceGroup> =
      self.groups.iter().filter(|g| g.ssrcs.iter().all(|ssrc| remaining_ssrcs.contains(ssrc))).cloned().collect();
    SourceSet { sources, groups }
  }
}

/// Conference-wide index of every participant's `SourceSet`, enforcing
/// global SSRC uniqueness across owners.
#[derive(Debug, Clone, Default)]
pub struct ConferenceSourceMap {
  by_owner: HashMap<String, SourceSet>,
  global_ssrcs: HashSet<u32>,
}

impl ConferenceSourceMap {
  pub fn new() -> ConferenceSourceMap {
    ConferenceSourceMap::default()
  }

  /// Merge `set` into `owner`'s existing sources (union, per
  /// `SourceSet::add`), after checking it does not collide with any other
  /// participant's ssrc space and stays under the per-owner quota.
  pub fn add(&mut self, owner: &str, set: SourceSet) -> Result<(), FocusError> {
    set.validate()?;
    for source in &set.sources {
      if !source.owner.as_deref().map(|o| o == owner).unwrap_or(source.injected) {
        return Err(FocusError::source_rejected(
          SourceRejectionTag::InvalidOwner,
          format!("source {} does not belong to owner {}", source.ssrc, owner),
        ));
      }
      if self.global_ssrcs.contains(&source.ssrc) && !self.owns(owner, source.ssrc) {
        return Err(FocusError::source_rejected(
          SourceRejectionTag::SsrcConflict,
          format!("ssrc {} is already claimed by another participant", source.ssrc),
        ));
      }
    }

    let merged = match self.by_owner.get(owner) {
      Some(previous) => previous.add(&set),
      None => set,
    };

    for media_type in [MediaType::Audio, MediaType::Video] {
      let count = merged.sources.iter().filter(|s| s.media_type == media_type).count();
      if count > MAX_SOURCES_PER_OWNER_PER_MEDIA {
        return Err(FocusError::source_rejected(
          SourceRejectionTag::QuotaExceeded,
          format!("owner {} would have {} {:?} sources, cap is {}", owner, count, media_type, MAX_SOURCES_PER_OWNER_PER_MEDIA),
        ));
      }
    }

    if let Some(previous) = self.by_owner.get(owner) {
      for source in &previous.sources {
        self.global_ssrcs.remove(&source.ssrc);
      }
    }
    for source in &merged.sources {
      self.global_ssrcs.insert(source.ssrc);
    }
    self.by_owner.insert(owner.to_owned(), merged);
    Ok(())
  }

  /// Remove a subset of `owner`'s sources (e.g. a `source-remove` delta)
  /// without tearing down the rest of their advertised sources. Returns the
  /// sources actually dropped.
  pub fn remove_subset(&mut self, owner: &str, set: &SourceSet) -> Option<SourceSet> {
    let previous = self.by_owner.get(owner)?.clone();
    let remaining = previous.remove(set);
    let dropped = previous.sources.iter().filter(|s| !remaining.sources.iter().any(|r| r.ssrc == s.ssrc)).cloned().collect();
    for source in &previous.sources {
      self.global_ssrcs.remove(&source.ssrc);
    }
    for source in &remaining.sources {
      self.global_ssrcs.insert(source.ssrc);
    }
    self.by_owner.insert(owner.to_owned(), remaining);
    Some(SourceSet { sources: dropped, groups: vec![] })
  }

  pub fn remove(&mut self, owner: &str) -> Option<SourceSet> {
    let removed = self.by_owner.remove(owner)?;
    for source in &removed.sources {
      self.global_ssrcs.remove(&source.ssrc);
    }
    Some(removed)
  }

  pub fn get(&self, owner: &str) -> Option<&SourceSet> {
    self.by_owner.get(owner)
  }

  pub fn owners(&self) -> impl Iterator<Item = &String> {
    self.by_owner.keys()
  }

  fn owns(&self, owner: &str, ssrc: u32) -> bool {
    self.by_owner.get(owner).map(|s| s.sources.iter().any(|source| source.ssrc == ssrc)).unwrap_or(false)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn source(ssrc: u32) -> Source {
    Source::new(ssrc, MediaType::Video, Some("alice".to_owned()))
  }

  #[test]
  fn fid_group_requires_exactly_two_members() {
    let set = SourceSet {
      sources: vec![source(1), source(2), source(3)],
      groups: vec![SourceGroup { semantics: GroupSemantics::Fid, ssrcs: vec![1, 2, 3] }],
    };
    assert!(set.validate().is_err());
  }

  #[test]
  fn sim_group_allows_more_than_two() {
    let set = SourceSet {
      sources: vec![source(1), source(2), source(3)],
      groups: vec![SourceGroup { semantics: GroupSemantics::Sim, ssrcs: vec![1, 2, 3] }],
    };
    assert!(set.validate().is_ok());
  }

  #[test]
  fn duplicate_ssrc_rejected() {
    let set = SourceSet { sources: vec![source(1), source(1)], groups: vec![] };
    assert!(set.validate().is_err());
  }

  #[test]
  fn global_map_rejects_ssrc_collision_across_owners() {
    let mut map = ConferenceSourceMap::new();
    map.add("alice", SourceSet { sources: vec![source(1)], groups: vec![] }).unwrap();
    let mut bobs = SourceSet { sources: vec![source(1)], groups: vec![] };
    bobs.sources[0].owner = Some("bob".to_owned());
    assert!(map.add("bob", bobs).is_err());
  }

  #[test]
  fn a_second_add_merges_with_the_owners_existing_sources() {
    let mut map = ConferenceSourceMap::new();
    map.add("alice", SourceSet { sources: vec![source(1)], groups: vec![] }).unwrap();
    map.add("alice", SourceSet { sources: vec![source(2)], groups: vec![] }).unwrap();
    assert_eq!(map.get("alice").unwrap().sources.len(), 2);

    // alice still owns ssrc 1, so bob claiming it is a conflict, not a free slot.
    let mut bobs = SourceSet { sources: vec![source(1)], groups: vec![] };
    bobs.sources[0].owner = Some("bob".to_owned());
    assert!(matches!(
      map.add("bob", bobs),
      Err(FocusError::SourceRejected { tag: SourceRejectionTag::SsrcConflict, .. })
    ));
  }

  #[test]
  fn remove_subset_drops_only_the_named_sources() {
    let mut map = ConferenceSourceMap::new();
    map.add("alice", SourceSet { sources: vec![source(1), source(2)], groups: vec![] }).unwrap();
    let dropped = map.remove_subset("alice", &SourceSet { sources: vec![source(1)], groups: vec![] }).unwrap();
    assert_eq!(dropped.sources.iter().map(|s| s.ssrc).collect::<Vec<_>>(), vec![1]);
    assert_eq!(map.get("alice").unwrap().sources.iter().map(|s| s.ssrc).collect::<Vec<_>>(), vec![2]);
  }

  #[test]
  fn union_is_commutative_on_disjoint_sets() {
    let a = SourceSet { sources: vec![source(1)], groups: vec![] };
    let b = SourceSet { sources: vec![source(2)], groups: vec![] };
    let mut ab = a.add(&b).sources;
    let mut ba = b.add(&a).sources;
    ab.sort_by_key(|s| s.ssrc);
    ba.sort_by_key(|s| s.ssrc);
    assert_eq!(ab, ba);
    assert_eq!(ab.iter().map(|s| s.ssrc).collect::<Vec<_>>(), vec![1, 2]);
  }

  #[test]
  fn difference_drops_groups_referencing_a_removed_member() {
    let whole = SourceSet {
      sources: vec![source(1), source(2)],
      groups: vec![SourceGroup { semantics: GroupSemantics::Fid, ssrcs: vec![1, 2] }],
    };
    let remainder = whole.remove(&SourceSet { sources: vec![source(1)], groups: vec![] });
    assert_eq!(remainder.sources.iter().map(|s| s.ssrc).collect::<Vec<_>>(), vec![2]);
    assert!(remainder.groups.is_empty());
  }

  #[test]
  fn per_owner_quota_rejects_an_excessive_source_count() {
    let mut map = ConferenceSourceMap::new();
    let many: Vec<Source> = (0..MAX_SOURCES_PER_OWNER_PER_MEDIA as u32 + 1).map(source).collect();
    let result = map.add("alice", SourceSet { sources: many, groups: vec![] });
    assert!(matches!(
      result,
      Err(FocusError::SourceRejected { tag: SourceRejectionTag::QuotaExceeded, .. })
    ));
  }
}
