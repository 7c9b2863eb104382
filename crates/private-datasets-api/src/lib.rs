use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use private_datasets_core::hooks::{CAPACITY, CAPACITY_PRIVATE, CAPACITY_PUBLIC};
use private_datasets_core::schema::{
    allowed_users_convert, create_package_schema, show_package_schema, update_package_schema,
    validate_package, PrivacyFields, SchemaField,
};
use private_datasets_core::{
    after_show, before_index, AccessDecisionEngine, AccessPolicyConfig, Actor, AllowListDelta,
    AllowListReconciler, AuthResult, CallContext, Dataset, DatasetCatalog, DatasetState,
    FiwareStoreParser, NotificationParser, PackageShow, PrivacyError, RequestEnv, Resource,
    SearchIndexer, ADQUIRE_URL, ALLOWED_USERS, SEARCHABLE,
};
use private_datasets_store_sqlite::{SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    #[default]
    Fiware,
}

/// Plugin settings, usually loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PluginConfig {
    /// Public URL of this instance. Acquisition notifications must point here.
    pub site_url: String,
    pub dataset_path_prefix: String,
    /// Let the allow-list grant read access to private datasets owned by an
    /// organization. When off, acquisitions of such datasets are still recorded
    /// but `package_adquired` reports a warning for each of them.
    pub allow_list_for_org_datasets: bool,
    pub parser: ParserKind,
}

impl Default for PluginConfig {
    fn default() -> Self {
        let policy = AccessPolicyConfig::default();
        Self {
            site_url: "http://localhost:5000".to_string(),
            dataset_path_prefix: policy.dataset_path_prefix,
            allow_list_for_org_datasets: policy.allow_list_for_org_datasets,
            parser: ParserKind::Fiware,
        }
    }
}

impl PluginConfig {
    /// Read a YAML config file. Missing keys take their defaults.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or is not valid YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config at {}", path.display()))
    }

    #[must_use]
    pub fn access_policy(&self) -> AccessPolicyConfig {
        AccessPolicyConfig {
            dataset_path_prefix: self.dataset_path_prefix.clone(),
            allow_list_for_org_datasets: self.allow_list_for_org_datasets,
        }
    }

    /// # Errors
    /// Returns an error when `site_url` is not an absolute URL.
    pub fn notification_parser(&self) -> Result<Box<dyn NotificationParser>> {
        match self.parser {
            ParserKind::Fiware => Ok(Box::new(FiwareStoreParser::new(&self.site_url)?)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuthFunction {
    PackageShow,
    PackageUpdate,
    PackageAdquired,
    ResourceShow,
}

impl AuthFunction {
    pub const ALL: [Self; 4] =
        [Self::PackageShow, Self::PackageUpdate, Self::PackageAdquired, Self::ResourceShow];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PackageShow => "package_show",
            Self::PackageUpdate => "package_update",
            Self::PackageAdquired => "package_adquired",
            Self::ResourceShow => "resource_show",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|function| function.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionFunction {
    PackageAdquired,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HelperFunction {
    PrivatedatasetsAdquired,
    GetAllowedUsersStr,
    IsOwner,
    CanRead,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    AfterCreate,
    AfterUpdate,
    AfterDelete,
    AfterShow,
    BeforeIndex,
}

/// Everything the plugin registers with its host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginManifest {
    pub auth_functions: Vec<AuthFunction>,
    pub actions: Vec<ActionFunction>,
    pub helpers: Vec<HelperFunction>,
    pub hooks: Vec<Hook>,
    /// Empty: the form applies to no specific package type.
    pub package_types: Vec<String>,
    pub is_fallback: bool,
    pub create_package_schema: Vec<SchemaField>,
    pub update_package_schema: Vec<SchemaField>,
    pub show_package_schema: Vec<SchemaField>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessRequest {
    #[serde(default)]
    pub context: CallContext,
    /// Dataset id, or resource id for `resource_show`. Unused by `package_adquired`.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub request_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessOutcome {
    pub function: AuthFunction,
    pub result: AuthResult,
    /// Flash messages raised while deciding.
    pub notices: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageView {
    pub result: AuthResult,
    pub notices: Vec<String>,
    pub package: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetUpsertRequest {
    #[serde(default)]
    pub context: CallContext,
    pub package: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllowListOutcome {
    pub delta: AllowListDelta,
    pub reindexed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetUpsertResult {
    pub package_id: String,
    pub created: bool,
    /// `None` when the submitted dictionary did not carry an allow-list.
    pub allow_list: Option<AllowListOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetDeleteResult {
    pub package_id: String,
    pub purged: usize,
    pub unindexed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcquisitionRequest {
    #[serde(default)]
    pub context: CallContext,
    pub notification: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcquisitionWarnings {
    pub warns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PrivateDatasetsPlugin {
    db_path: PathBuf,
    config: PluginConfig,
}

impl PrivateDatasetsPlugin {
    #[must_use]
    pub fn new(db_path: PathBuf, config: PluginConfig) -> Self {
        Self { db_path, config }
    }

    #[must_use]
    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    #[must_use]
    pub fn manifest(&self) -> PluginManifest {
        PluginManifest {
            auth_functions: AuthFunction::ALL.to_vec(),
            actions: vec![ActionFunction::PackageAdquired],
            helpers: vec![
                HelperFunction::PrivatedatasetsAdquired,
                HelperFunction::GetAllowedUsersStr,
                HelperFunction::IsOwner,
                HelperFunction::CanRead,
            ],
            hooks: vec![
                Hook::AfterCreate,
                Hook::AfterUpdate,
                Hook::AfterDelete,
                Hook::AfterShow,
                Hook::BeforeIndex,
            ],
            package_types: Vec::new(),
            is_fallback: true,
            create_package_schema: create_package_schema(),
            update_package_schema: update_package_schema(),
            show_package_schema: show_package_schema(),
        }
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = SqliteStore::open(&self.db_path)?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Run one auth function.
    ///
    /// # Errors
    /// Returns [`PrivacyError::NotFound`] for unknown datasets and resources, a
    /// validation error when `id` is missing, or a storage error.
    pub fn check_access(
        &self,
        function: AuthFunction,
        request: &AccessRequest,
    ) -> Result<AccessOutcome> {
        let store = self.open_store()?;
        let scope = RequestScope::new(request.request_path.clone());
        let result = self.authorize(&store, &scope, function, request)?;
        Ok(AccessOutcome { function, result, notices: scope.into_notices() })
    }

    fn authorize(
        &self,
        store: &SqliteStore,
        scope: &RequestScope,
        function: AuthFunction,
        request: &AccessRequest,
    ) -> Result<AuthResult, PrivacyError> {
        let policy = self.config.access_policy();
        let engine = AccessDecisionEngine::new(store, store, store, scope, &policy);
        let actor = &request.context.actor;
        match function {
            AuthFunction::PackageShow => engine.package_show(actor, required_id(request)?),
            AuthFunction::PackageUpdate => engine.package_update(actor, required_id(request)?),
            AuthFunction::PackageAdquired => Ok(engine.can_acquire(actor)),
            AuthFunction::ResourceShow => engine.resource_show(actor, required_id(request)?),
        }
    }

    /// Register a dataset record or update an existing one, then reconcile its
    /// allow-list when the dictionary carries one.
    ///
    /// Updates merge: every field omitted from `package` keeps its stored value,
    /// and the validators run over the merged record. An explicit `null` clears
    /// a field (`state` falls back to `active`).
    ///
    /// # Errors
    /// Returns [`PrivacyError::Validation`] for rejected fields, or a storage error.
    pub fn upsert_dataset(&self, request: DatasetUpsertRequest) -> Result<DatasetUpsertResult> {
        let package_id = required_str(&request.package, "id")?;
        let mut store = self.open_store()?;
        let existing = store.get_dataset(package_id)?;
        let created = existing.is_none();

        let mut package = existing.as_ref().map(stored_fields).unwrap_or_default();
        package.extend(request.package.iter().map(|(key, value)| (key.clone(), value.clone())));

        let fields = validate_package(&package)?;
        let resources = resource_ids(&package)?;
        let dataset = dataset_from_dict(&package, &fields, &request.context.actor)?;

        store.put_dataset(&dataset)?;
        for resource_id in resources {
            store.put_resource(&Resource { id: resource_id, package_id: dataset.id.clone() })?;
        }
        index_dataset(&store, &dataset.id)?;

        let allow_list = match &fields.allowed_users {
            Some(users) => Some(sync_allow_list(&store, &dataset.id, users)?),
            None => None,
        };

        info!(package_id = %dataset.id, created, private = dataset.private, "dataset stored");
        Ok(DatasetUpsertResult { package_id: dataset.id, created, allow_list })
    }

    /// `package_show` with the auth check and the `after_show` filter applied.
    ///
    /// # Errors
    /// Returns [`PrivacyError::NotFound`] for unknown datasets, or a storage error.
    pub fn package_show(&self, request: &AccessRequest) -> Result<PackageView> {
        let store = self.open_store()?;
        let scope = RequestScope::new(request.request_path.clone());
        let result = self.authorize(&store, &scope, AuthFunction::PackageShow, request)?;
        let package = if result.success {
            let representation = canonical_dict(&store, required_id(request)?)?;
            Some(after_show(&request.context, representation))
        } else {
            None
        };
        Ok(PackageView { result, notices: scope.into_notices(), package })
    }

    /// Soft-delete a dataset, purge its allow-list and drop it from the search index.
    /// The three writes share one transaction.
    ///
    /// # Errors
    /// Returns [`PrivacyError::NotFound`] for unknown datasets, or a storage error.
    pub fn delete_dataset(&self, package_id: &str) -> Result<DatasetDeleteResult> {
        let store = self.open_store()?;
        let packages = CanonicalPackageShow { store: &store };
        let indexer = IndexWriter { store: &store };
        let reconciler = AllowListReconciler::new(&store, &packages, &indexer);

        let mut session = store.session()?;
        if !session.mark_deleted(package_id)? {
            return Err(PrivacyError::NotFound(format!("package {package_id}")).into());
        }
        let purged = reconciler.purge(&mut session, package_id)?;
        let unindexed = session.delete_index_document(package_id)?;
        session.commit()?;
        info!(package_id, purged, "dataset deleted");
        Ok(DatasetDeleteResult { package_id: package_id.to_string(), purged, unindexed })
    }

    /// # Errors
    /// Returns an error when reconciliation or indexing fails.
    pub fn after_create(&self, pkg_dict: &Map<String, Value>) -> Result<Option<AllowListOutcome>> {
        let store = self.open_store()?;
        after_save(&store, pkg_dict)
    }

    /// # Errors
    /// Returns an error when reconciliation or indexing fails.
    pub fn after_update(&self, pkg_dict: &Map<String, Value>) -> Result<Option<AllowListOutcome>> {
        let store = self.open_store()?;
        after_save(&store, pkg_dict)
    }

    /// # Errors
    /// Returns an error when the allow-list cannot be purged.
    pub fn after_delete(&self, package_id: &str) -> Result<usize> {
        let store = self.open_store()?;
        purge_allow_list(&store, package_id)
    }

    /// Grant the acquiring users access to the datasets named in a store notification.
    /// Returns the warnings for datasets that were skipped, if any.
    ///
    /// # Errors
    /// Returns [`PrivacyError::Notification`] for malformed notifications, or a storage error.
    pub fn package_adquired(
        &self,
        request: &AcquisitionRequest,
    ) -> Result<Option<AcquisitionWarnings>> {
        let parser = self.config.notification_parser()?;
        let records = parser.parse_notification(&request.notification)?;
        let store = self.open_store()?;
        info!(
            caller = request.context.actor.display_name(),
            customers = records.len(),
            "acquisition notification received"
        );

        let mut warns = Vec::new();
        for record in &records {
            for reference in &record.datasets {
                let Some(dataset) = store.find_dataset(reference)? else {
                    warn!(dataset = %reference, "acquired dataset not found");
                    warns.push(format!("Dataset {reference} was not found in this instance"));
                    continue;
                };
                if !dataset.private {
                    warn!(dataset = %reference, "acquired dataset is public");
                    warns.push(format!(
                        "Unable to upload the dataset {reference}: It's a public dataset"
                    ));
                    continue;
                }

                let mut users: BTreeSet<String> = store
                    .list_allowed_users(&dataset.id)?
                    .into_iter()
                    .map(|entry| entry.user_name)
                    .collect();
                if dataset.owner_org.is_some() && !self.config.allow_list_for_org_datasets {
                    warn!(dataset = %reference, "acquired dataset belongs to an organization");
                    warns.push(format!(
                        "Dataset {reference} belongs to an organization: \
                         acquiring it does not grant read access"
                    ));
                }
                if users.insert(record.user.clone()) {
                    let outcome = sync_allow_list(&store, &dataset.id, &users)?;
                    info!(
                        package_id = %dataset.id,
                        user = %record.user,
                        reindexed = outcome.reindexed,
                        "dataset acquired"
                    );
                }
            }
        }

        Ok((!warns.is_empty()).then_some(AcquisitionWarnings { warns }))
    }

    /// Ids of the datasets `user_name` was granted, ordered by id.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn user_adquired_datasets(&self, user_name: &str) -> Result<Vec<String>> {
        let store = self.open_store()?;
        store.adquired_datasets(user_name)
    }

    /// `privatedatasets_adquired` helper.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn is_adquired(&self, package_id: &str, user_name: Option<&str>) -> Result<bool> {
        let Some(user_name) = user_name else {
            return Ok(false);
        };
        let store = self.open_store()?;
        Ok(store.list_allowed_users(package_id)?.iter().any(|entry| entry.user_name == user_name))
    }

    /// `can_read` helper.
    ///
    /// # Errors
    /// Returns an error when the dataset does not exist or the store cannot be read.
    pub fn can_read(&self, package_id: &str, actor: &Actor) -> Result<bool> {
        let request = AccessRequest {
            context: CallContext::for_actor(actor.clone()),
            id: Some(package_id.to_string()),
            request_path: None,
        };
        Ok(self.check_access(AuthFunction::PackageShow, &request)?.result.success)
    }
}

/// `get_allowed_users_str` helper.
#[must_use]
pub fn get_allowed_users_str(users: &[String]) -> String {
    users.join(",")
}

/// `is_owner` helper.
#[must_use]
pub fn is_owner(dataset: &Dataset, actor: &Actor) -> bool {
    actor.is_creator_of(dataset.creator_user_id.as_deref())
}

struct RequestScope {
    path: Option<String>,
    notices: RefCell<Vec<String>>,
}

impl RequestScope {
    fn new(path: Option<String>) -> Self {
        Self { path, notices: RefCell::new(Vec::new()) }
    }

    fn into_notices(self) -> Vec<String> {
        self.notices.into_inner()
    }
}

impl RequestEnv for RequestScope {
    fn current_path(&self) -> Option<String> {
        self.path.clone()
    }

    fn flash_error(&self, message: &str) {
        self.notices.borrow_mut().push(message.to_string());
    }
}

struct CanonicalPackageShow<'a> {
    store: &'a SqliteStore,
}

impl PackageShow for CanonicalPackageShow<'_> {
    fn package_show(&self, package_id: &str) -> Result<Value, PrivacyError> {
        canonical_dict(self.store, package_id).map(Value::Object)
    }
}

struct IndexWriter<'a> {
    store: &'a SqliteStore,
}

impl SearchIndexer for IndexWriter<'_> {
    fn update_dict(&self, representation: &Value) -> Result<(), PrivacyError> {
        let document = search_document(representation)?;
        let package_id = document
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| PrivacyError::Index("document has no id".to_string()))?
            .to_string();
        self.store
            .put_index_document(&package_id, &Value::Object(document))
            .map_err(|err| PrivacyError::Index(format!("{err:#}")))
    }
}

/// Unfiltered dictionary of a dataset, allow-list included.
fn canonical_dict(store: &SqliteStore, package_id: &str) -> Result<Map<String, Value>, PrivacyError> {
    let dataset = store
        .package(package_id)?
        .ok_or_else(|| PrivacyError::NotFound(format!("package {package_id}")))?;
    let allowed_users: Vec<String> = store
        .list_allowed_users(package_id)
        .map_err(|err| PrivacyError::Persistence(format!("{err:#}")))?
        .into_iter()
        .map(|entry| entry.user_name)
        .collect();

    let mut dict = Map::new();
    dict.insert("id".to_string(), json!(dataset.id));
    dict.insert("name".to_string(), json!(dataset.name));
    dict.insert("creator_user_id".to_string(), json!(dataset.creator_user_id));
    dict.insert("private".to_string(), json!(dataset.private));
    dict.insert("state".to_string(), json!(dataset.state.as_str()));
    dict.insert("owner_org".to_string(), json!(dataset.owner_org));
    if let Some(url) = &dataset.adquire_url {
        dict.insert(ADQUIRE_URL.to_string(), json!(url));
    }
    if let Some(searchable) = dataset.searchable {
        dict.insert(SEARCHABLE.to_string(), json!(searchable));
    }
    dict.insert(ALLOWED_USERS.to_string(), json!(allowed_users));
    Ok(dict)
}

/// Shape a dataset dictionary the way the search index stores it.
fn search_document(representation: &Value) -> Result<Map<String, Value>, PrivacyError> {
    let Value::Object(fields) = representation else {
        return Err(PrivacyError::Index("representation is not an object".to_string()));
    };
    let mut document = fields.clone();
    let private = document.get("private").and_then(Value::as_bool).unwrap_or(false);
    let capacity = if private { CAPACITY_PRIVATE } else { CAPACITY_PUBLIC };
    document.insert(CAPACITY.to_string(), json!(capacity));
    if let Some(searchable) = document.remove(SEARCHABLE).as_ref().and_then(Value::as_bool) {
        let flag = if searchable { "True" } else { "False" };
        document.insert(format!("extras_{SEARCHABLE}"), json!(flag));
    }
    Ok(before_index(document))
}

fn index_dataset(store: &SqliteStore, package_id: &str) -> Result<()> {
    let representation = CanonicalPackageShow { store }.package_show(package_id)?;
    IndexWriter { store }.update_dict(&representation)?;
    Ok(())
}

fn sync_allow_list(
    store: &SqliteStore,
    package_id: &str,
    users: &BTreeSet<String>,
) -> Result<AllowListOutcome> {
    let packages = CanonicalPackageShow { store };
    let indexer = IndexWriter { store };
    let reconciler = AllowListReconciler::new(store, &packages, &indexer);

    let mut session = store.session()?;
    let delta = reconciler.sync(&mut session, package_id, users)?;
    session.commit()?;
    let reindexed = reconciler.refresh_index(package_id, &delta)?;
    Ok(AllowListOutcome { delta, reindexed })
}

fn purge_allow_list(store: &SqliteStore, package_id: &str) -> Result<usize> {
    let packages = CanonicalPackageShow { store };
    let indexer = IndexWriter { store };
    let reconciler = AllowListReconciler::new(store, &packages, &indexer);

    let mut session = store.session()?;
    let purged = reconciler.purge(&mut session, package_id)?;
    session.commit()?;
    Ok(purged)
}

fn after_save(store: &SqliteStore, pkg_dict: &Map<String, Value>) -> Result<Option<AllowListOutcome>> {
    let Some(users) = allowed_users_convert(pkg_dict) else {
        return Ok(None);
    };
    let package_id = required_str(pkg_dict, "id")?;
    let users: BTreeSet<String> = users.into_iter().collect();
    sync_allow_list(store, package_id, &users).map(Some)
}

fn required_id(request: &AccessRequest) -> Result<&str, PrivacyError> {
    request
        .id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| PrivacyError::field("id", "Missing value"))
}

fn required_str<'a>(dict: &'a Map<String, Value>, field: &str) -> Result<&'a str, PrivacyError> {
    dict.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| PrivacyError::field(field, "Missing value"))
}

fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Record fields of a stored dataset, as a dictionary a submission is merged onto.
fn stored_fields(dataset: &Dataset) -> Map<String, Value> {
    let mut dict = Map::new();
    dict.insert("name".to_string(), json!(dataset.name));
    dict.insert("creator_user_id".to_string(), json!(dataset.creator_user_id));
    dict.insert("private".to_string(), json!(dataset.private));
    dict.insert("state".to_string(), json!(dataset.state.as_str()));
    dict.insert("owner_org".to_string(), json!(dataset.owner_org));
    dict.insert(ADQUIRE_URL.to_string(), json!(dataset.adquire_url));
    dict.insert(SEARCHABLE.to_string(), json!(dataset.searchable));
    dict
}

fn dataset_from_dict(
    package: &Map<String, Value>,
    fields: &PrivacyFields,
    actor: &Actor,
) -> Result<Dataset, PrivacyError> {
    let id = required_str(package, "id")?.to_string();
    let name = package
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| id.clone());
    let creator_user_id = package
        .get("creator_user_id")
        .and_then(value_as_id)
        .or_else(|| actor.user_id.clone());
    let state = match package.get("state") {
        None | Some(Value::Null) => DatasetState::Active,
        Some(value) => value
            .as_str()
            .and_then(DatasetState::parse)
            .ok_or_else(|| PrivacyError::field("state", format!("Unknown state: {value}")))?,
    };
    let owner_org = package
        .get("owner_org")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|org| !org.is_empty())
        .map(str::to_string);

    Ok(Dataset {
        id,
        name,
        creator_user_id,
        private: fields.private,
        state,
        owner_org,
        adquire_url: fields.adquire_url.clone(),
        searchable: fields.searchable,
    })
}

fn resource_ids(package: &Map<String, Value>) -> Result<Vec<String>, PrivacyError> {
    let invalid = || PrivacyError::field("resources", "Invalid resource format");
    match package.get("resources") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(id) => Ok(id.clone()),
                Value::Object(resource) => resource
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(invalid),
                _ => Err(invalid()),
            })
            .collect(),
        Some(_) => Err(invalid()),
    }
}
