//! Acquisition notifications sent by an external store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::PrivacyError;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserDatasets {
    pub user: String,
    pub datasets: Vec<String>,
}

pub trait NotificationParser {
    /// # Errors
    /// Returns [`PrivacyError::Notification`] when the payload is malformed.
    fn parse_notification(&self, request: &Value) -> Result<Vec<UserDatasets>, PrivacyError>;
}

/// Parses notifications of the FIWARE store:
/// `{"customer_name": "...", "resources": [{"url": "<site>/dataset/<name>"}]}`.
#[derive(Debug, Clone)]
pub struct FiwareStoreParser {
    site: Url,
}

impl FiwareStoreParser {
    /// # Errors
    /// Returns [`PrivacyError::Notification`] when `site_url` is not an absolute URL.
    pub fn new(site_url: &str) -> Result<Self, PrivacyError> {
        let site = Url::parse(site_url).map_err(|err| {
            PrivacyError::Notification(format!("invalid site_url {site_url}: {err}"))
        })?;
        Ok(Self { site })
    }

    fn same_instance(&self, url: &Url) -> bool {
        url.scheme() == self.site.scheme()
            && url.host_str() == self.site.host_str()
            && url.port_or_known_default() == self.site.port_or_known_default()
    }
}

fn authority(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    }
}

fn dataset_name(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?;
    if segments.next()? != "dataset" {
        return None;
    }
    segments.next().filter(|name| !name.is_empty()).map(str::to_string)
}

impl NotificationParser for FiwareStoreParser {
    fn parse_notification(&self, request: &Value) -> Result<Vec<UserDatasets>, PrivacyError> {
        for field in ["customer_name", "resources"] {
            if request.get(field).is_none() {
                return Err(PrivacyError::Notification(format!("{field} not found in the request")));
            }
        }

        let Some(user) = request.get("customer_name").and_then(Value::as_str) else {
            return Err(PrivacyError::Notification("Invalid customer_name format".to_string()));
        };
        let Some(resources) = request.get("resources").and_then(Value::as_array) else {
            return Err(PrivacyError::Notification("Invalid resources format".to_string()));
        };

        let mut datasets = Vec::with_capacity(resources.len());
        for resource in resources {
            let url = resource
                .get("url")
                .and_then(Value::as_str)
                .and_then(|raw| Url::parse(raw).ok())
                .ok_or_else(|| PrivacyError::Notification("Invalid resource format".to_string()))?;
            let name = dataset_name(&url)
                .ok_or_else(|| PrivacyError::Notification("Invalid resource format".to_string()))?;
            if !self.same_instance(&url) {
                return Err(PrivacyError::Notification(format!(
                    "Dataset {name} is associated with the instance located at {}",
                    authority(&url)
                )));
            }
            datasets.push(name);
        }

        Ok(vec![UserDatasets { user: user.to_string(), datasets }])
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parser() -> FiwareStoreParser {
        match FiwareStoreParser::new("http://localhost:5000") {
            Ok(parser) => parser,
            Err(err) => panic!("fixture site url rejected: {err}"),
        }
    }

    fn notification_error(result: Result<Vec<UserDatasets>, PrivacyError>) -> String {
        match result {
            Err(PrivacyError::Notification(message)) => message,
            other => panic!("expected notification error, got {other:?}"),
        }
    }

    #[test]
    fn parses_datasets_of_this_instance() -> Result<(), PrivacyError> {
        let parsed = parser().parse_notification(&json!({
            "customer_name": "user_name",
            "resources": [
                {"url": "http://localhost:5000/dataset/ds1"},
                {"url": "http://localhost:5000/dataset/ds2/resource/abc"},
            ],
        }))?;

        assert_eq!(
            parsed,
            vec![UserDatasets {
                user: "user_name".to_string(),
                datasets: vec!["ds1".to_string(), "ds2".to_string()],
            }]
        );
        Ok(())
    }

    #[test]
    fn rejects_missing_fields() {
        let message =
            notification_error(parser().parse_notification(&json!({"resources": []})));
        assert_eq!(message, "customer_name not found in the request");

        let message =
            notification_error(parser().parse_notification(&json!({"customer_name": "a"})));
        assert_eq!(message, "resources not found in the request");
    }

    #[test]
    fn rejects_malformed_values() {
        let message = notification_error(
            parser().parse_notification(&json!({"customer_name": 3, "resources": []})),
        );
        assert_eq!(message, "Invalid customer_name format");

        let message = notification_error(
            parser().parse_notification(&json!({"customer_name": "a", "resources": "x"})),
        );
        assert_eq!(message, "Invalid resources format");

        let message = notification_error(parser().parse_notification(&json!({
            "customer_name": "a",
            "resources": [{"url": "http://localhost:5000/organization/conwet"}],
        })));
        assert_eq!(message, "Invalid resource format");
    }

    #[test]
    fn rejects_datasets_of_other_instances() {
        let message = notification_error(parser().parse_notification(&json!({
            "customer_name": "a",
            "resources": [{"url": "http://example.com:8080/dataset/ds1"}],
        })));
        assert_eq!(
            message,
            "Dataset ds1 is associated with the instance located at example.com:8080"
        );
    }

    #[test]
    fn rejects_datasets_served_over_another_scheme() {
        let message = notification_error(parser().parse_notification(&json!({
            "customer_name": "a",
            "resources": [{"url": "https://localhost:5000/dataset/ds1"}],
        })));
        assert_eq!(
            message,
            "Dataset ds1 is associated with the instance located at localhost:5000"
        );
    }
}
