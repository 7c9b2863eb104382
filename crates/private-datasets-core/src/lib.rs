use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod access;
#[cfg(test)]
mod fakes;
pub mod hooks;
pub mod notification;
pub mod reconcile;
pub mod schema;

pub use access::{AccessDecisionEngine, AccessPolicyConfig};
pub use hooks::{after_show, before_index};
pub use notification::{FiwareStoreParser, NotificationParser, UserDatasets};
pub use reconcile::{reconcile, AllowListDelta, AllowListReconciler};

pub const READ_PERMISSION: &str = "read";
pub const UPDATE_PERMISSION: &str = "update_dataset";

pub const ALLOWED_USERS: &str = "allowed_users";
pub const ALLOWED_USERS_STR: &str = "allowed_users_str";
pub const SEARCHABLE: &str = "searchable";
pub const ADQUIRE_URL: &str = "adquire_url";

/// Fields only the creator, a sysadmin or an API-to-API flow may see.
pub const PRIVATE_FIELDS: [&str; 3] = [ALLOWED_USERS, SEARCHABLE, ADQUIRE_URL];

/// Per-field validation messages, keyed by field name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct FieldErrors(pub BTreeMap<String, Vec<String>>);

impl FieldErrors {
    pub fn push(&mut self, field: &str, message: impl Into<String>) {
        self.0.entry(field.to_string()).or_default().push(message.into());
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn first(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(|messages| messages.first()).map(String::as_str)
    }
}

impl Display for FieldErrors {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (field, messages) in &self.0 {
            for message in messages {
                if !first {
                    write!(f, "; ")?;
                }
                write!(f, "{field}: {message}")?;
                first = false;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PrivacyError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(FieldErrors),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("search index error: {0}")]
    Index(String),
    #[error("notification error: {0}")]
    Notification(String),
}

impl PrivacyError {
    #[must_use]
    pub fn field(field: &str, message: impl Into<String>) -> Self {
        let mut errors = FieldErrors::default();
        errors.push(field, message);
        Self::Validation(errors)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DatasetState {
    #[default]
    Active,
    Draft,
    Deleted,
}

impl DatasetState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Draft => "draft",
            Self::Deleted => "deleted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "draft" => Some(Self::Draft),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Dataset {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub creator_user_id: Option<String>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub state: DatasetState,
    pub owner_org: Option<String>,
    pub adquire_url: Option<String>,
    pub searchable: Option<bool>,
}

impl Dataset {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == DatasetState::Active
    }

    /// The acquire URL, ignoring blank values.
    #[must_use]
    pub fn acquire_url(&self) -> Option<&str> {
        self.adquire_url.as_deref().map(str::trim).filter(|url| !url.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AllowedUser {
    pub package_id: String,
    pub user_name: String,
}

impl AllowedUser {
    #[must_use]
    pub fn new(package_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self { package_id: package_id.into(), user_name: user_name.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Resource {
    pub id: String,
    pub package_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Actor {
    pub user_name: Option<String>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub sysadmin: bool,
}

impl Actor {
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn user(user_name: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self { user_name: Some(user_name.into()), user_id: Some(user_id.into()), sysadmin: false }
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_none()
    }

    /// True when this actor created the dataset. Anonymous actors own nothing.
    #[must_use]
    pub fn is_creator_of(&self, creator_user_id: Option<&str>) -> bool {
        match (self.user_id.as_deref(), creator_user_id) {
            (Some(actor_id), Some(creator_id)) => actor_id == creator_id,
            _ => false,
        }
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        self.user_name.as_deref().unwrap_or("anonymous")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct CallContext {
    #[serde(default)]
    pub actor: Actor,
    /// Set by internal API-to-API update flows, such as acquisition notifications.
    #[serde(default)]
    pub updating_via_api: bool,
}

impl CallContext {
    #[must_use]
    pub fn for_actor(actor: Actor) -> Self {
        Self { actor, updating_via_api: false }
    }

    #[must_use]
    pub fn api_callback(actor: Actor) -> Self {
        Self { actor, updating_via_api: true }
    }
}

/// Outcome of an authorization function. Denial is a value, never an error.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuthResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl AuthResult {
    #[must_use]
    pub fn allowed() -> Self {
        Self { success: true, msg: None }
    }

    #[must_use]
    pub fn denied(msg: impl Into<String>) -> Self {
        Self { success: false, msg: Some(msg.into()) }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrgCapacity {
    Member,
    Editor,
    Admin,
}

impl OrgCapacity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Editor => "editor",
            Self::Admin => "admin",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "member" => Some(Self::Member),
            "editor" => Some(Self::Editor),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    #[must_use]
    pub fn grants(self, permission: &str) -> bool {
        match permission {
            READ_PERMISSION => true,
            UPDATE_PERMISSION => matches!(self, Self::Editor | Self::Admin),
            _ => self == Self::Admin,
        }
    }
}

/// Resolves dataset records owned by the host.
pub trait DatasetCatalog {
    /// # Errors
    /// Returns [`PrivacyError::Persistence`] when the lookup fails.
    fn package(&self, package_id: &str) -> Result<Option<Dataset>, PrivacyError>;

    /// Resolve the dataset a resource belongs to.
    ///
    /// # Errors
    /// Returns [`PrivacyError::Persistence`] when the lookup fails.
    fn package_for_resource(&self, resource_id: &str) -> Result<Option<Dataset>, PrivacyError>;
}

/// Read side of the allow-list persistence.
pub trait AllowListStore {
    /// Prepare the backing storage. Must be idempotent.
    ///
    /// # Errors
    /// Returns [`PrivacyError::Persistence`] when the storage cannot be prepared.
    fn init(&self) -> Result<(), PrivacyError>;

    /// # Errors
    /// Returns [`PrivacyError::Persistence`] when the query fails.
    fn allowed_users(&self, package_id: &str) -> Result<Vec<AllowedUser>, PrivacyError>;
}

/// Unit of work the allow-list writes are queued on. Committed by the caller.
pub trait AllowListSession {
    /// # Errors
    /// Returns [`PrivacyError::Persistence`] when the write fails.
    fn add(&mut self, entry: AllowedUser) -> Result<(), PrivacyError>;

    /// # Errors
    /// Returns [`PrivacyError::Persistence`] when the write fails.
    fn delete(&mut self, entry: &AllowedUser) -> Result<(), PrivacyError>;
}

pub trait OrgAuthorizer {
    /// # Errors
    /// Returns [`PrivacyError::Persistence`] when membership cannot be read.
    fn has_permission(
        &self,
        org_id: &str,
        user_name: Option<&str>,
        permission: &str,
    ) -> Result<bool, PrivacyError>;
}

/// The inbound request the check runs for.
pub trait RequestEnv {
    fn current_path(&self) -> Option<String>;

    fn flash_error(&self, message: &str);
}

pub trait SearchIndexer {
    /// # Errors
    /// Returns [`PrivacyError::Index`] when the document cannot be written.
    fn update_dict(&self, representation: &Value) -> Result<(), PrivacyError>;
}

/// Canonical, unfiltered dataset representation used for indexing.
pub trait PackageShow {
    /// # Errors
    /// Returns [`PrivacyError::NotFound`] for unknown datasets.
    fn package_show(&self, package_id: &str) -> Result<Value, PrivacyError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creator_check_requires_both_identities() {
        assert!(Actor::user("alice", "1").is_creator_of(Some("1")));
        assert!(!Actor::user("alice", "1").is_creator_of(Some("2")));
        assert!(!Actor::user("alice", "1").is_creator_of(None));
        assert!(!Actor::anonymous().is_creator_of(None));
    }

    #[test]
    fn org_capacity_grants_follow_role() {
        assert!(OrgCapacity::Member.grants(READ_PERMISSION));
        assert!(!OrgCapacity::Member.grants(UPDATE_PERMISSION));
        assert!(OrgCapacity::Editor.grants(UPDATE_PERMISSION));
        assert!(OrgCapacity::Admin.grants("delete_dataset"));
        assert!(!OrgCapacity::Editor.grants("delete_dataset"));
    }

    #[test]
    fn field_errors_render_every_message() {
        let mut errors = FieldErrors::default();
        errors.push(ADQUIRE_URL, "bad url");
        errors.push(SEARCHABLE, "only private");
        assert_eq!(errors.to_string(), "adquire_url: bad url; searchable: only private");
        assert_eq!(errors.first(ADQUIRE_URL), Some("bad url"));
    }

    #[test]
    fn blank_acquire_url_is_ignored() {
        let dataset = Dataset { adquire_url: Some("  ".to_string()), ..Dataset::default() };
        assert_eq!(dataset.acquire_url(), None);
    }
}
