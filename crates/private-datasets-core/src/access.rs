use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    Actor, AllowListStore, AuthResult, Dataset, DatasetCatalog, OrgAuthorizer, PrivacyError,
    RequestEnv, READ_PERMISSION, UPDATE_PERMISSION,
};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct AccessPolicyConfig {
    /// Request paths under this prefix are dataset detail pages.
    pub dataset_path_prefix: String,
    /// Let the allow-list grant read access when an organization check fails.
    pub allow_list_for_org_datasets: bool,
}

impl Default for AccessPolicyConfig {
    fn default() -> Self {
        Self { dataset_path_prefix: "/dataset/".to_string(), allow_list_for_org_datasets: false }
    }
}

/// Decides whether an actor may see or modify a dataset.
pub struct AccessDecisionEngine<'a> {
    catalog: &'a dyn DatasetCatalog,
    allow_list: &'a dyn AllowListStore,
    orgs: &'a dyn OrgAuthorizer,
    request: &'a dyn RequestEnv,
    config: &'a AccessPolicyConfig,
}

impl<'a> AccessDecisionEngine<'a> {
    #[must_use]
    pub fn new(
        catalog: &'a dyn DatasetCatalog,
        allow_list: &'a dyn AllowListStore,
        orgs: &'a dyn OrgAuthorizer,
        request: &'a dyn RequestEnv,
        config: &'a AccessPolicyConfig,
    ) -> Self {
        Self { catalog, allow_list, orgs, request, config }
    }

    /// `package_show` auth function.
    ///
    /// # Errors
    /// Returns [`PrivacyError::NotFound`] for unknown datasets, or a persistence error.
    pub fn package_show(&self, actor: &Actor, package_id: &str) -> Result<AuthResult, PrivacyError> {
        let dataset = self.get_package_object(package_id)?;
        self.can_show(actor, &dataset)
    }

    /// `package_update` auth function.
    ///
    /// # Errors
    /// Returns [`PrivacyError::NotFound`] for unknown datasets, or a persistence error.
    pub fn package_update(
        &self,
        actor: &Actor,
        package_id: &str,
    ) -> Result<AuthResult, PrivacyError> {
        let dataset = self.get_package_object(package_id)?;
        self.can_update(actor, &dataset)
    }

    /// `resource_show` auth function: the resource inherits its dataset's visibility.
    ///
    /// # Errors
    /// Returns [`PrivacyError::NotFound`] when no dataset owns the resource.
    pub fn resource_show(
        &self,
        actor: &Actor,
        resource_id: &str,
    ) -> Result<AuthResult, PrivacyError> {
        let Some(dataset) = self.catalog.package_for_resource(resource_id)? else {
            return Err(PrivacyError::NotFound(
                "No package found for this resource, cannot check auth.".to_string(),
            ));
        };

        if self.can_show(actor, &dataset)?.success {
            Ok(AuthResult::allowed())
        } else {
            Ok(AuthResult::denied(format!(
                "User {} not authorized to read resource {resource_id}",
                actor.display_name()
            )))
        }
    }

    /// Evaluate read access to one dataset.
    ///
    /// # Errors
    /// Returns an error only when a collaborator fails; denial is `success: false`.
    pub fn can_show(&self, actor: &Actor, dataset: &Dataset) -> Result<AuthResult, PrivacyError> {
        let result = self.evaluate_show(actor, dataset)?;
        debug!(
            action = "package_show",
            package_id = %dataset.id,
            user = actor.display_name(),
            success = result.success,
            "authorization decided"
        );
        Ok(result)
    }

    fn evaluate_show(&self, actor: &Actor, dataset: &Dataset) -> Result<AuthResult, PrivacyError> {
        if actor.is_creator_of(dataset.creator_user_id.as_deref()) {
            return Ok(AuthResult::allowed());
        }

        // Only creators see drafts and deleted datasets.
        if !dataset.is_active() {
            return Ok(self.show_denied(actor, dataset));
        }

        if !dataset.private {
            return Ok(AuthResult::allowed());
        }

        let mut authorized = match dataset.owner_org.as_deref() {
            Some(org_id) => {
                self.orgs.has_permission(org_id, actor.user_name.as_deref(), READ_PERMISSION)?
            }
            None => false,
        };

        if !authorized && (dataset.owner_org.is_none() || self.config.allow_list_for_org_datasets)
        {
            self.allow_list.init()?;
            authorized = self.in_allow_list(actor, dataset)?;
        }

        if authorized {
            Ok(AuthResult::allowed())
        } else {
            self.offer_acquisition(dataset);
            Ok(self.show_denied(actor, dataset))
        }
    }

    /// Evaluate write access to one dataset.
    ///
    /// # Errors
    /// Returns an error only when the organization check fails.
    pub fn can_update(&self, actor: &Actor, dataset: &Dataset) -> Result<AuthResult, PrivacyError> {
        let authorized = if actor.is_anonymous() {
            false
        } else if actor.is_creator_of(dataset.creator_user_id.as_deref()) {
            true
        } else if let Some(org_id) = dataset.owner_org.as_deref() {
            self.orgs.has_permission(org_id, actor.user_name.as_deref(), UPDATE_PERMISSION)?
        } else {
            false
        };

        debug!(
            action = "package_update",
            package_id = %dataset.id,
            user = actor.display_name(),
            success = authorized,
            "authorization decided"
        );

        if authorized {
            Ok(AuthResult::allowed())
        } else {
            Ok(AuthResult::denied(format!(
                "User {} is not authorized to edit package {}",
                actor.display_name(),
                dataset.id
            )))
        }
    }

    /// `package_adquired` auth function. Reaching the endpoint is enough.
    #[must_use]
    pub fn can_acquire(&self, _actor: &Actor) -> AuthResult {
        AuthResult::allowed()
    }

    fn get_package_object(&self, package_id: &str) -> Result<Dataset, PrivacyError> {
        self.catalog
            .package(package_id)?
            .ok_or_else(|| PrivacyError::NotFound(format!("package {package_id}")))
    }

    fn in_allow_list(&self, actor: &Actor, dataset: &Dataset) -> Result<bool, PrivacyError> {
        let Some(user_name) = actor.user_name.as_deref() else {
            return Ok(false);
        };
        let entries = self.allow_list.allowed_users(&dataset.id)?;
        Ok(entries.iter().any(|entry| entry.user_name == user_name))
    }

    fn offer_acquisition(&self, dataset: &Dataset) {
        if !dataset.is_active() || dataset.owner_org.is_some() {
            return;
        }
        let on_detail_page = self
            .request
            .current_path()
            .is_some_and(|path| path.starts_with(&self.config.dataset_path_prefix));
        if !on_detail_page {
            return;
        }
        if let Some(url) = dataset.acquire_url() {
            self.request.flash_error(&format!(
                "This private dataset can be acquired. To do so, please click \
                 <a target=\"_blank\" href=\"{url}\">here</a>"
            ));
        }
    }

    fn show_denied(&self, actor: &Actor, dataset: &Dataset) -> AuthResult {
        AuthResult::denied(format!(
            "User {} not authorized to read package {}",
            actor.display_name(),
            dataset.id
        ))
    }
}
