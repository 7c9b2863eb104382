use std::cell::{Cell, RefCell};

use serde_json::Value;

use crate::{
    AllowListSession, AllowListStore, AllowedUser, Dataset, DatasetCatalog, OrgAuthorizer,
    PackageShow, PrivacyError, RequestEnv, Resource, SearchIndexer,
};

pub struct FakeCatalog {
    datasets: Vec<Dataset>,
    resources: Vec<Resource>,
}

impl FakeCatalog {
    pub fn with(datasets: Vec<Dataset>, resources: Vec<Resource>) -> Self {
        Self { datasets, resources }
    }
}

impl DatasetCatalog for FakeCatalog {
    fn package(&self, package_id: &str) -> Result<Option<Dataset>, PrivacyError> {
        Ok(self.datasets.iter().find(|dataset| dataset.id == package_id).cloned())
    }

    fn package_for_resource(&self, resource_id: &str) -> Result<Option<Dataset>, PrivacyError> {
        let Some(resource) = self.resources.iter().find(|resource| resource.id == resource_id)
        else {
            return Ok(None);
        };
        self.package(&resource.package_id)
    }
}

pub struct FakeAllowList {
    entries: Vec<AllowedUser>,
    init_calls: Cell<usize>,
    queries: RefCell<Vec<String>>,
}

impl FakeAllowList {
    pub fn with(entries: Vec<AllowedUser>) -> Self {
        Self { entries, init_calls: Cell::new(0), queries: RefCell::new(Vec::new()) }
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.get()
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.borrow().clone()
    }
}

impl AllowListStore for FakeAllowList {
    fn init(&self) -> Result<(), PrivacyError> {
        self.init_calls.set(self.init_calls.get() + 1);
        Ok(())
    }

    fn allowed_users(&self, package_id: &str) -> Result<Vec<AllowedUser>, PrivacyError> {
        self.queries.borrow_mut().push(package_id.to_string());
        Ok(self.entries.iter().filter(|entry| entry.package_id == package_id).cloned().collect())
    }
}

pub struct FakeOrgs {
    answer: bool,
    calls: RefCell<Vec<(String, Option<String>, String)>>,
}

impl FakeOrgs {
    pub fn answering(answer: bool) -> Self {
        Self { answer, calls: RefCell::new(Vec::new()) }
    }

    pub fn calls(&self) -> Vec<(String, Option<String>, String)> {
        self.calls.borrow().clone()
    }
}

impl OrgAuthorizer for FakeOrgs {
    fn has_permission(
        &self,
        org_id: &str,
        user_name: Option<&str>,
        permission: &str,
    ) -> Result<bool, PrivacyError> {
        self.calls.borrow_mut().push((
            org_id.to_string(),
            user_name.map(str::to_string),
            permission.to_string(),
        ));
        Ok(self.answer)
    }
}

pub struct FakeRequest {
    path: Option<String>,
    flashes: RefCell<Vec<String>>,
}

impl FakeRequest {
    pub fn at(path: Option<&str>) -> Self {
        Self { path: path.map(str::to_string), flashes: RefCell::new(Vec::new()) }
    }

    pub fn flashes(&self) -> Vec<String> {
        self.flashes.borrow().clone()
    }
}

impl RequestEnv for FakeRequest {
    fn current_path(&self) -> Option<String> {
        self.path.clone()
    }

    fn flash_error(&self, message: &str) {
        self.flashes.borrow_mut().push(message.to_string());
    }
}

#[derive(Default)]
pub struct RecordingSession {
    pub added: Vec<AllowedUser>,
    pub deleted: Vec<AllowedUser>,
}

impl AllowListSession for RecordingSession {
    fn add(&mut self, entry: AllowedUser) -> Result<(), PrivacyError> {
        self.added.push(entry);
        Ok(())
    }

    fn delete(&mut self, entry: &AllowedUser) -> Result<(), PrivacyError> {
        self.deleted.push(entry.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingIndexer {
    documents: RefCell<Vec<Value>>,
}

impl RecordingIndexer {
    pub fn documents(&self) -> Vec<Value> {
        self.documents.borrow().clone()
    }
}

impl SearchIndexer for RecordingIndexer {
    fn update_dict(&self, representation: &Value) -> Result<(), PrivacyError> {
        self.documents.borrow_mut().push(representation.clone());
        Ok(())
    }
}

pub struct StaticPackageShow {
    representation: Value,
    calls: Cell<usize>,
}

impl StaticPackageShow {
    pub fn returning(representation: Value) -> Self {
        Self { representation, calls: Cell::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl PackageShow for StaticPackageShow {
    fn package_show(&self, _package_id: &str) -> Result<Value, PrivacyError> {
        self.calls.set(self.calls.get() + 1);
        Ok(self.representation.clone())
    }
}
