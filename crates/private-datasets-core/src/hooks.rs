//! Dataset dictionary transforms run by the host around show and indexing.

use serde_json::{Map, Value};

use crate::{CallContext, PRIVATE_FIELDS, SEARCHABLE};

pub const CAPACITY: &str = "capacity";
pub const CAPACITY_PRIVATE: &str = "private";
pub const CAPACITY_PUBLIC: &str = "public";

/// Strip the private fields unless the caller is the creator, a sysadmin,
/// or an API-to-API update flow.
#[must_use]
pub fn after_show(context: &CallContext, mut pkg_dict: Map<String, Value>) -> Map<String, Value> {
    if !may_see_private_fields(context, &pkg_dict) {
        for field in PRIVATE_FIELDS {
            pkg_dict.remove(field);
        }
    }
    pkg_dict
}

fn may_see_private_fields(context: &CallContext, pkg_dict: &Map<String, Value>) -> bool {
    if context.updating_via_api || context.actor.sysadmin {
        return true;
    }
    let creator = pkg_dict.get("creator_user_id").and_then(value_as_id);
    context.actor.is_creator_of(creator.as_deref())
}

fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Hide datasets flagged as not searchable from the search results.
#[must_use]
pub fn before_index(mut pkg_dict: Map<String, Value>) -> Map<String, Value> {
    let key = format!("extras_{SEARCHABLE}");
    if pkg_dict.get(&key).and_then(Value::as_str) == Some("False") {
        pkg_dict.insert(CAPACITY.to_string(), Value::String(CAPACITY_PRIVATE.to_string()));
    }
    pkg_dict
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{Actor, ADQUIRE_URL, ALLOWED_USERS};

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn after_show_filters_private_fields() {
        #[rustfmt::skip]
        let cases: [(bool, Option<&str>, Option<bool>, bool); 16] = [
            (true, Some("1"), Some(false), true),
            (true, Some("2"), Some(false), true),
            (true, Some("1"), Some(true), true),
            (true, Some("2"), Some(true), true),
            (true, None, None, true),
            (true, Some("1"), None, true),
            (true, None, Some(true), true),
            (true, None, Some(false), true),
            (false, Some("1"), Some(false), true),
            (false, Some("2"), Some(false), false),
            (false, Some("1"), Some(true), true),
            (false, Some("2"), Some(true), true),
            (false, None, None, false),
            (false, Some("1"), None, true),
            (false, None, Some(true), true),
            (false, None, Some(false), false),
        ];

        for (index, (via_api, user_id, sysadmin, fields_expected)) in cases.into_iter().enumerate()
        {
            let context = CallContext {
                actor: Actor {
                    user_name: user_id.map(|_| "test".to_string()),
                    user_id: user_id.map(str::to_string),
                    sysadmin: sysadmin.unwrap_or(false),
                },
                updating_via_api: via_api,
            };
            let pkg_dict = as_map(json!({
                "creator_user_id": "1",
                "allowed_users": ["a", "b", "c"],
                "searchable": true,
                "adquire_url": "http://google.es",
            }));

            let result = after_show(&context, pkg_dict);
            for field in [ALLOWED_USERS, SEARCHABLE, ADQUIRE_URL] {
                assert_eq!(result.contains_key(field), fields_expected, "case {index} field {field}");
            }
            assert!(result.contains_key("creator_user_id"), "case {index}");
        }
    }

    #[test]
    fn after_show_accepts_numeric_creator_ids() {
        let context = CallContext::for_actor(Actor::user("test", "7"));
        let result = after_show(&context, as_map(json!({"creator_user_id": 7, "searchable": false})));
        assert!(result.contains_key(SEARCHABLE));
    }

    #[test]
    fn before_index_forces_private_capacity_for_unsearchable() {
        let cases = [
            ("public", None, "public"),
            ("public", Some("False"), "private"),
            ("public", Some("True"), "public"),
            ("private", None, "private"),
            ("private", Some("False"), "private"),
            ("private", Some("True"), "private"),
        ];

        for (initial, searchable, expected) in cases {
            let mut pkg_dict =
                as_map(json!({"capacity": initial, "name": "a", "description": "This is a test"}));
            if let Some(searchable) = searchable {
                pkg_dict.insert("extras_searchable".to_string(), json!(searchable));
            }
            let mut expected_dict = pkg_dict.clone();
            expected_dict.insert("capacity".to_string(), json!(expected));

            assert_eq!(before_index(pkg_dict), expected_dict);
        }
    }
}
