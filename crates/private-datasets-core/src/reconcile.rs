use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{AllowListSession, AllowListStore, AllowedUser, PackageShow, PrivacyError, SearchIndexer};

/// Rows to create and delete to turn one allow-list snapshot into another.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AllowListDelta {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl AllowListDelta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Set difference in both directions. Order and duplicates are irrelevant.
#[must_use]
pub fn reconcile(new_users: &BTreeSet<String>, stored_users: &BTreeSet<String>) -> AllowListDelta {
    AllowListDelta {
        added: new_users.difference(stored_users).cloned().collect(),
        removed: stored_users.difference(new_users).cloned().collect(),
    }
}

pub struct AllowListReconciler<'a> {
    store: &'a dyn AllowListStore,
    packages: &'a dyn PackageShow,
    indexer: &'a dyn SearchIndexer,
}

impl<'a> AllowListReconciler<'a> {
    #[must_use]
    pub fn new(
        store: &'a dyn AllowListStore,
        packages: &'a dyn PackageShow,
        indexer: &'a dyn SearchIndexer,
    ) -> Self {
        Self { store, packages, indexer }
    }

    /// Stored allow-list of a dataset as a set of user names.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn stored_users(&self, package_id: &str) -> Result<BTreeSet<String>, PrivacyError> {
        self.store.init()?;
        Ok(self
            .store
            .allowed_users(package_id)?
            .into_iter()
            .map(|entry| entry.user_name)
            .collect())
    }

    /// Diff the declared allow-list against the stored one and queue the changes on `session`.
    ///
    /// # Errors
    /// Returns an error when reading the store or queuing a write fails.
    pub fn sync(
        &self,
        session: &mut dyn AllowListSession,
        package_id: &str,
        new_users: &BTreeSet<String>,
    ) -> Result<AllowListDelta, PrivacyError> {
        let stored = self.stored_users(package_id)?;
        let delta = reconcile(new_users, &stored);
        Self::apply(session, package_id, &delta)?;
        Ok(delta)
    }

    /// # Errors
    /// Returns the first write error reported by the session.
    pub fn apply(
        session: &mut dyn AllowListSession,
        package_id: &str,
        delta: &AllowListDelta,
    ) -> Result<(), PrivacyError> {
        for user_name in &delta.removed {
            session.delete(&AllowedUser::new(package_id, user_name.as_str()))?;
        }
        for user_name in &delta.added {
            session.add(AllowedUser::new(package_id, user_name.as_str()))?;
        }
        if !delta.is_empty() {
            info!(
                package_id,
                added = delta.added.len(),
                removed = delta.removed.len(),
                "allow-list reconciled"
            );
        }
        Ok(())
    }

    /// Push the current representation of the dataset to the search index when `delta`
    /// changed anything. Call after the session is committed.
    ///
    /// # Errors
    /// Returns an error when the representation cannot be built or indexed.
    pub fn refresh_index(
        &self,
        package_id: &str,
        delta: &AllowListDelta,
    ) -> Result<bool, PrivacyError> {
        if delta.is_empty() {
            return Ok(false);
        }
        let representation = self.packages.package_show(package_id)?;
        self.indexer.update_dict(&representation)?;
        Ok(true)
    }

    /// Drop every stored entry of a deleted dataset.
    ///
    /// # Errors
    /// Returns an error when reading the store or queuing a delete fails.
    pub fn purge(
        &self,
        session: &mut dyn AllowListSession,
        package_id: &str,
    ) -> Result<usize, PrivacyError> {
        self.store.init()?;
        let entries = self.store.allowed_users(package_id)?;
        for entry in &entries {
            session.delete(entry)?;
        }
        Ok(entries.len())
    }
}
