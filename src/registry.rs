//! # Client Registry
//!
//! Owns every [`TransmissionClient`] and delivers a profile to the live ones
//! in turn. A client is marked dead after a transport failure or its third
//! consecutive confirmation timeout, and stays dead until it answers a
//! profile request again.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::transmission::{TransmissionClient, TransmissionOutcome, TransmitError};
use crate::Profile;

/// Consecutive timeouts after which a confirming client is marked dead.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("client {client} applies profile {echoed}, last confirmed {expected}")]
    MarkerMismatch {
        client: String,
        expected: DateTime<Utc>,
        echoed: DateTime<Utc>,
    },
}

/// Per-client outcomes of one batch.
#[derive(Debug)]
pub struct BatchReport {
    pub outcomes: Vec<(String, TransmissionOutcome)>,
    /// At least one client attempted and none rejected the profile
    pub success: bool,
}

impl BatchReport {
    pub fn confirmed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, TransmissionOutcome::DeliveredConfirmed { .. }))
            .count()
    }

    pub fn outcome(&self, client: &str) -> Option<&TransmissionOutcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == client)
            .map(|(_, o)| o)
    }
}

pub struct ClientRegistry {
    clients: Vec<TransmissionClient>,
}

impl ClientRegistry {
    pub fn new(clients: Vec<TransmissionClient>) -> Self {
        Self { clients }
    }

    pub fn clients(&self) -> &[TransmissionClient] {
        &self.clients
    }

    pub fn live_count(&self) -> usize {
        self.clients.iter().filter(|c| c.is_alive()).count()
    }

    /// Send `profile` to every live client, one after another.
    pub async fn transmit_all(&mut self, profile: &Profile, cancel: &CancellationToken) -> BatchReport {
        let mut outcomes = Vec::with_capacity(self.clients.len());
        for client in self.clients.iter_mut().filter(|c| c.is_alive()) {
            if cancel.is_cancelled() {
                break;
            }
            let outcome = client.send(profile, cancel).await;
            match &outcome {
                TransmissionOutcome::SendFailed(TransmitError::Transport(e)) => {
                    warn!(client = %client.name(), error = %e, "client marked dead");
                    client.mark_dead();
                }
                TransmissionOutcome::TimedOut
                    if client.consecutive_timeouts() >= MAX_CONSECUTIVE_TIMEOUTS =>
                {
                    warn!(
                        client = %client.name(),
                        timeouts = client.consecutive_timeouts(),
                        "client marked dead"
                    );
                    client.mark_dead();
                }
                _ => {}
            }
            outcomes.push((client.name().to_string(), outcome));
        }

        let success = !outcomes.is_empty() && !outcomes.iter().any(|(_, o)| o.is_rejected());
        BatchReport { outcomes, success }
    }

    /// Request the applied profile from every confirming client, reviving
    /// those that answer. Returns how many answered.
    pub async fn check_round_trip(&mut self, cancel: &CancellationToken) -> usize {
        let mut answered = 0;
        for client in self.clients.iter_mut().filter(|c| c.confirms()) {
            if round_trip(client, cancel).await {
                answered += 1;
            }
        }
        answered
    }

    /// Round-trip with one client by name; revives it on success.
    pub async fn revive(&mut self, name: &str, cancel: &CancellationToken) -> bool {
        match self.clients.iter_mut().find(|c| c.name() == name) {
            Some(client) if client.confirms() => round_trip(client, cancel).await,
            _ => false,
        }
    }

    /// Check that every live confirming client still applies the profile it
    /// last confirmed. Clients that do not answer are skipped.
    pub async fn verify_confirmed_markers(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(), RegistryError> {
        for client in self.clients.iter_mut().filter(|c| c.is_alive() && c.confirms()) {
            let Some(expected) = client.last_confirmed() else {
                continue;
            };
            match client.request_applied_profile(cancel).await {
                Ok(Some(applied)) if applied.profile_time == expected => {}
                Ok(Some(applied)) => {
                    return Err(RegistryError::MarkerMismatch {
                        client: client.name().to_string(),
                        expected,
                        echoed: applied.profile_time,
                    });
                }
                Ok(None) => {
                    warn!(client = %client.name(), "no answer to profile request");
                }
                Err(e) => {
                    warn!(client = %client.name(), error = %e, "client marked dead");
                    client.mark_dead();
                }
            }
        }
        Ok(())
    }
}

async fn round_trip(client: &mut TransmissionClient, cancel: &CancellationToken) -> bool {
    match client.request_applied_profile(cancel).await {
        Ok(Some(_)) => {
            if !client.is_alive() {
                info!(client = %client.name(), "client alive again");
            }
            client.revive();
            true
        }
        Ok(None) => false,
        Err(e) => {
            warn!(client = %client.name(), error = %e, "profile request failed");
            false
        }
    }
}
