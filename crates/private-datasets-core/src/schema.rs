//! Dataset form fields contributed by the plugin and the validators behind them.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use url::Url;

use crate::{FieldErrors, PrivacyError, ADQUIRE_URL, ALLOWED_USERS, ALLOWED_USERS_STR, SEARCHABLE};

pub const PRIVATE: &str = "private";

const URL_SCHEMES: [&str; 4] = ["http", "https", "ftp", "ftps"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Validator {
    IgnoreMissing,
    BooleanValidator,
    ConvertToExtras,
    ConvertFromExtras,
    UrlChecker,
    PrivateDatasetsMetadataChecker,
    AllowedUsersConvert,
    GetAllowedUsers,
}

impl Validator {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IgnoreMissing => "ignore_missing",
            Self::BooleanValidator => "boolean_validator",
            Self::ConvertToExtras => "convert_to_extras",
            Self::ConvertFromExtras => "convert_from_extras",
            Self::UrlChecker => "url_checker",
            Self::PrivateDatasetsMetadataChecker => "private_datasets_metadata_checker",
            Self::AllowedUsersConvert => "allowed_users_convert",
            Self::GetAllowedUsers => "get_allowed_users",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SchemaField {
    pub name: String,
    pub validators: Vec<Validator>,
}

impl SchemaField {
    fn new(name: &str, validators: &[Validator]) -> Self {
        Self { name: name.to_string(), validators: validators.to_vec() }
    }
}

#[must_use]
pub fn create_package_schema() -> Vec<SchemaField> {
    use Validator::{
        AllowedUsersConvert, BooleanValidator, ConvertToExtras, IgnoreMissing,
        PrivateDatasetsMetadataChecker, UrlChecker,
    };

    vec![
        SchemaField::new(PRIVATE, &[IgnoreMissing, BooleanValidator]),
        SchemaField::new(
            ADQUIRE_URL,
            &[IgnoreMissing, ConvertToExtras, UrlChecker, PrivateDatasetsMetadataChecker],
        ),
        SchemaField::new(
            SEARCHABLE,
            &[IgnoreMissing, BooleanValidator, ConvertToExtras, PrivateDatasetsMetadataChecker],
        ),
        SchemaField::new(ALLOWED_USERS_STR, &[IgnoreMissing, PrivateDatasetsMetadataChecker]),
        SchemaField::new(
            ALLOWED_USERS,
            &[AllowedUsersConvert, IgnoreMissing, PrivateDatasetsMetadataChecker],
        ),
    ]
}

#[must_use]
pub fn update_package_schema() -> Vec<SchemaField> {
    create_package_schema()
}

#[must_use]
pub fn show_package_schema() -> Vec<SchemaField> {
    use Validator::{ConvertFromExtras, GetAllowedUsers, IgnoreMissing};

    vec![
        SchemaField::new(ADQUIRE_URL, &[IgnoreMissing, ConvertFromExtras]),
        SchemaField::new(SEARCHABLE, &[IgnoreMissing, ConvertFromExtras]),
        SchemaField::new(ALLOWED_USERS, &[IgnoreMissing, GetAllowedUsers]),
    ]
}

/// Plugin-owned fields of a dataset after the create/update chain ran.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PrivacyFields {
    pub private: bool,
    pub adquire_url: Option<String>,
    pub searchable: Option<bool>,
    /// `None` when the form did not mention the allow-list at all.
    pub allowed_users: Option<BTreeSet<String>>,
}

/// Run the create/update validator chains over a submitted dataset dictionary.
///
/// # Errors
/// Returns [`PrivacyError::Validation`] with every failing field.
pub fn validate_package(data: &Map<String, Value>) -> Result<PrivacyFields, PrivacyError> {
    let mut errors = FieldErrors::default();

    let private = match present(data, PRIVATE) {
        Some(value) => match boolean_validator(value) {
            Ok(flag) => flag,
            Err(message) => {
                errors.push(PRIVATE, message);
                false
            }
        },
        None => false,
    };

    let adquire_url = present(data, ADQUIRE_URL).and_then(|value| match value {
        Value::String(url) => Some(url.trim().to_string()),
        other => {
            errors.push(ADQUIRE_URL, format!("The URL \"{other}\" is not valid."));
            None
        }
    });
    if let Some(url) = adquire_url.as_deref() {
        if let Err(message) = url_checker(url) {
            errors.push(ADQUIRE_URL, message);
        }
    }

    let searchable = match present(data, SEARCHABLE).map(boolean_validator) {
        Some(Ok(flag)) => Some(flag),
        Some(Err(message)) => {
            errors.push(SEARCHABLE, message);
            None
        }
        None => None,
    };

    let allowed_users = allowed_users_convert(data);

    // The checker sees each field as the earlier validators of its chain left it.
    let converted_users = allowed_users.as_ref().map(|users| json!(users));
    let checked = [
        (ADQUIRE_URL, adquire_url.as_ref().map(|url| json!(url))),
        (SEARCHABLE, searchable.map(Value::Bool)),
        (ALLOWED_USERS_STR, data.get(ALLOWED_USERS_STR).and(converted_users.clone())),
        (ALLOWED_USERS, data.get(ALLOWED_USERS).and(converted_users)),
    ];
    for (field, value) in checked {
        if let Some(message) = metadata_checker(value.as_ref(), private) {
            errors.push(field, message);
        }
    }

    if !errors.is_empty() {
        return Err(PrivacyError::Validation(errors));
    }

    Ok(PrivacyFields {
        private,
        adquire_url: adquire_url.filter(|url| !url.is_empty()),
        searchable,
        allowed_users: allowed_users.map(|users| users.into_iter().collect()),
    })
}

fn present<'a>(data: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    data.get(field).filter(|value| !value.is_null())
}

/// Accept booleans and the usual textual spellings of them.
///
/// # Errors
/// Returns the user-facing message for values that are not booleans.
pub fn boolean_validator(value: &Value) -> Result<bool, String> {
    match value {
        Value::Bool(flag) => Ok(*flag),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Ok(true),
            "false" | "no" | "0" | "off" | "" => Ok(false),
            _ => Err(format!("Value must be a boolean, not \"{text}\"")),
        },
        Value::Number(number) => match number.as_u64() {
            Some(1) => Ok(true),
            Some(0) => Ok(false),
            _ => Err(format!("Value must be a boolean, not \"{number}\"")),
        },
        other => Err(format!("Value must be a boolean, not \"{other}\"")),
    }
}

/// # Errors
/// Returns the user-facing message for anything but an absolute http(s)/ftp(s) URL.
pub fn url_checker(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Ok(());
    }
    let valid = Url::parse(value).is_ok_and(|url| {
        URL_SCHEMES.contains(&url.scheme()) && url.host_str().is_some_and(|host| !host.is_empty())
    });
    if valid {
        Ok(())
    } else {
        Err(format!("The URL \"{value}\" is not valid."))
    }
}

/// Privacy metadata is only accepted on private datasets.
#[must_use]
pub fn metadata_checker(value: Option<&Value>, private: bool) -> Option<String> {
    if !private && value.is_some_and(is_truthy) {
        Some("This field is only valid when you create a private dataset".to_string())
    } else {
        None
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}

/// Normalise the declared allow-list. `allowed_users_str` wins over `allowed_users`.
#[must_use]
pub fn allowed_users_convert(data: &Map<String, Value>) -> Option<Vec<String>> {
    let raw: Vec<String> = if let Some(Value::String(text)) = data.get(ALLOWED_USERS_STR) {
        text.split(',').map(str::to_string).collect()
    } else {
        match data.get(ALLOWED_USERS)? {
            Value::String(text) => text.split(',').map(str::to_string).collect(),
            Value::Array(items) => {
                items.iter().filter_map(Value::as_str).map(str::to_string).collect()
            }
            _ => return None,
        }
    };

    Some(
        raw.iter()
            .map(|user| user.trim())
            .filter(|user| !user.is_empty())
            .map(str::to_string)
            .collect(),
    )
}
