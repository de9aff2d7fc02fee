//! Component I: an optional REST call-out to an external reservation
//! system before a conference is allowed to spin up, and a matching
//! teardown call when it ends, mirroring Jitsi's
//! `jicofo.reservation.rest-api` integration.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::FocusError;

#[derive(Debug, Serialize)]
struct ReservationRequest<'a> {
  name: &'a str,
  start_time: i64,
  mail_owner: &'a str,
}

/// What the reservation system hands back for a room it has accepted:
/// its own id for the booking (needed to release it later) and, if it
/// capped the conference's lifetime, the duration in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct ReservationRecord {
  pub id: i64,
  pub duration: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ReservationErrorBody {
  message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReservationClient {
  base_url: String,
  http: reqwest::Client,
}

impl ReservationClient {
  pub fn new(base_url: impl Into<String>) -> ReservationClient {
    ReservationClient { base_url: base_url.into(), http: reqwest::Client::new() }
  }

  /// Ask the reservation system whether `room` may start, on behalf of
  /// `mail_owner`. A 200/201 response admits the conference and carries
  /// the booking's `{id, duration}`. A 409 means the room already has a
  /// booking — exactly what happens when a focus crashes and restarts
  /// into the same room — so a single conflict is resolved by fetching
  /// and adopting the existing booking rather than failing the join
  /// outright. Any other non-success status is surfaced as the
  /// reservation system's own error message.
  pub async fn make_reservation(&self, room: &str, mail_owner: &str) -> Result<ReservationRecord, FocusError> {
    let start_time = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0);
    let url = format!("{}/conference", self.base_url.trim_end_matches('/'));
    let response = self
      .http
      .post(&url)
      .json(&ReservationRequest { name: room, start_time, mail_owner })
      .send()
      .await
      .map_err(|err| FocusError::Internal(anyhow::anyhow!(err)))?;

    let status = response.status();
    if status.is_success() {
      return response.json::<ReservationRecord>().await.map_err(|err| FocusError::Internal(anyhow::anyhow!(err)));
    }
    if status.as_u16() == 409 {
      return self.adopt_existing_reservation(room).await;
    }
    let message = response
      .json::<ReservationErrorBody>()
      .await
      .ok()
      .and_then(|body| body.message)
      .unwrap_or_else(|| status.canonical_reason().unwrap_or("reservation rejected").to_owned());
    Err(FocusError::Reservation { code: status.as_u16(), message })
  }

  /// Fetch the booking already held for `room` and adopt it as our own.
  /// Called exactly once, right after a 409 on the initial POST.
  async fn adopt_existing_reservation(&self, room: &str) -> Result<ReservationRecord, FocusError> {
    let url = format!("{}/conference/{}", self.base_url.trim_end_matches('/'), room);
    let response = self.http.get(&url).send().await.map_err(|err| FocusError::Internal(anyhow::anyhow!(err)))?;
    if !response.status().is_success() {
      return Err(FocusError::Conflict);
    }
    response.json::<ReservationRecord>().await.map_err(|err| FocusError::Internal(anyhow::anyhow!(err)))
  }

  /// Release a booking by its reservation-system id. Best-effort: a
  /// conference that's already tearing down has nothing useful to do
  /// with a failed `DELETE` other than log it.
  pub async fn release_reservation(&self, id: i64) {
    let url = format!("{}/conference/{}", self.base_url.trim_end_matches('/'), id);
    match self.http.delete(&url).send().await {
      Ok(response) if !response.status().is_success() => {
        warn!(status = %response.status(), id, "reservation system rejected our release");
      },
      Err(err) => warn!(%err, id, "failed to reach reservation system to release a booking"),
      Ok(_) => {},
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn client_normalizes_a_trailing_slash_in_the_base_url() {
    let client = ReservationClient::new("https://reservations.example.com/");
    assert_eq!(client.base_url, "https://reservations.example.com/");
  }
}
