//! Component G: the registry of live conferences, indexed by room name and
//! by meeting id, with a periodic sweep that reclaims conferences nobody
//! (other than visitors) is occupying any more.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::RwLock;

use crate::conference::Conference;

/// How often the idle sweep runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Index {
  by_room: HashMap<String, Conference>,
  by_meeting_id: HashMap<String, String>,
}

#[derive(Clone)]
pub struct ConferenceStore {
  index: Arc<RwLock<Index>>,
}

impl ConferenceStore {
  pub fn new() -> ConferenceStore {
    ConferenceStore { index: Arc::new(RwLock::new(Index::default())) }
  }

  pub async fn get_or_create(&self, room: &str, factory: impl FnOnce() -> Conference) -> Conference {
    let mut index = self.index.write().await;
    if let Some(existing) = index.by_room.get(room) {
      return existing.clone();
    }
    let conference = factory();
    index.by_meeting_id.insert(conference.meeting_id().to_owned(), room.to_owned());
    index.by_room.insert(room.to_owned(), conference.clone());
    conference
  }

  pub async fn get_by_room(&self, room: &str) -> Option<Conference> {
    self.index.read().await.by_room.get(room).cloned()
  }

  pub async fn get_by_meeting_id(&self, meeting_id: &str) -> Option<Conference> {
    let index = self.index.read().await;
    let room = index.by_meeting_id.get(meeting_id)?;
    index.by_room.get(room).cloned()
  }

  pub async fn remove(&self, room: &str) {
    let mut index = self.index.write().await;
    if let Some(conference) = index.by_room.remove(room) {
      index.by_meeting_id.remove(conference.meeting_id());
    }
  }

  pub async fn snapshot(&self) -> Vec<Conference> {
    self.index.read().await.by_room.values().cloned().collect()
  }

  /// Spawn the idle-sweeper task. A conference counts as empty for this
  /// purpose when it has no non-visitor participants left (visitor-only
  /// rooms don't anchor a conference's lifetime — see DESIGN.md Open
  /// Question 2).
  pub fn spawn_idle_sweeper(&self) {
    let store = self.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(SWEEP_INTERVAL);
      loop {
        interval.tick().await;
        let idle: Vec<String> = {
          let index = store.index.read().await;
          index
            .by_room
            .iter()
            .filter(|(_, conference)| conference.is_idle())
            .map(|(room, _)| room.clone())
            .collect()
        };
        for room in idle {
          if let Some(conference) = store.get_by_room(&room).await {
            if conference.is_idle() {
              tracing::info!(%room, "reclaiming idle conference");
              conference.terminate().await;
              store.remove(&room).await;
            }
          }
        }
      }
    });
  }
}

impl Default for ConferenceStore {
  fn default() -> Self {
    ConferenceStore::new()
  }
}
