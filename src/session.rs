//! The current profile and the store it is persisted to.
//!
//! A [`Session`] is owned by whoever is driving profiles: the server loop or
//! a single CLI command. Nothing else holds the current profile.

use std::sync::Arc;

use tracing::{info, warn};

use crate::store::{ProfileId, ProfileStore, StoreError};
use crate::Profile;

pub struct Session {
    current: Option<Profile>,
    store: Arc<dyn ProfileStore>,
}

impl Session {
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self {
            current: None,
            store,
        }
    }

    pub fn current(&self) -> Option<&Profile> {
        self.current.as_ref()
    }

    pub fn store(&self) -> &Arc<dyn ProfileStore> {
        &self.store
    }

    /// Make `profile` current without saving it.
    pub fn replace(&mut self, profile: Profile) -> Option<Profile> {
        self.current.replace(profile)
    }

    /// Save `profile` and make it current. The profile becomes current even
    /// when saving fails.
    pub fn commit(&mut self, profile: Profile) -> Result<ProfileId, StoreError> {
        let saved = self.store.save(&profile);
        match &saved {
            Ok(id) => info!(%id, samples = profile.processed.valid_count(), "profile stored"),
            Err(e) => warn!(error = %e, "profile not stored"),
        }
        self.current = Some(profile);
        saved
    }

    /// Load a stored profile and make it current.
    pub fn load(&mut self, id: ProfileId) -> Option<&Profile> {
        let profile = self.store.get(id)?;
        self.current = Some(profile);
        self.current.as_ref()
    }
}
