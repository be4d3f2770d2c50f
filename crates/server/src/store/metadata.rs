// Path-scoped metadata key/value storage and its access table.
//
// | path                 | admin      | user                     |
// |----------------------|------------|--------------------------|
// | global               | read/write | read                     |
// | model/<id>           | read/write | read                     |
// | user                 | read/write | read/write (own scope)   |
// | userPublic/<id>      | read/write own, read others             |
// | chat/<id>            | owner only; lock holder reads and writes |
//
// Metadata carries no version of its own.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use parley_common::metadata::MetadataPath;
use parley_common::types::{ChatId, ModelId, UserId, UserRole};
use serde_json::{Map, Value};

use crate::sync::{read_guard, write_guard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Access {
    None,
    Read,
    ReadWrite,
}

impl Access {
    pub fn can_read(self) -> bool {
        self >= Self::Read
    }

    pub fn can_write(self) -> bool {
        self == Self::ReadWrite
    }
}

/// Static role check for a metadata path. Chat ownership and lock holding
/// are checked by the caller against live state.
pub fn access_for(path: &MetadataPath, caller: UserId, role: UserRole) -> Access {
    match path {
        MetadataPath::Global | MetadataPath::Model(_) => {
            if role.is_admin() {
                Access::ReadWrite
            } else {
                Access::Read
            }
        }
        MetadataPath::User | MetadataPath::Chat(_) => Access::ReadWrite,
        MetadataPath::UserPublic(owner) => {
            if *owner == caller {
                Access::ReadWrite
            } else {
                Access::Read
            }
        }
    }
}

/// Storage key for one metadata namespace instance. Unlike
/// [`MetadataPath`], the private `user` scope is resolved to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MetadataScope {
    Global,
    Model(ModelId),
    User(UserId),
    UserPublic(UserId),
    Chat(ChatId),
}

impl MetadataScope {
    pub fn resolve(path: &MetadataPath, caller: UserId) -> Self {
        match path {
            MetadataPath::Global => Self::Global,
            MetadataPath::Model(model_id) => Self::Model(model_id.clone()),
            MetadataPath::User => Self::User(caller),
            MetadataPath::UserPublic(user_id) => Self::UserPublic(*user_id),
            MetadataPath::Chat(chat_id) => Self::Chat(chat_id.clone()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MetadataStore {
    scopes: RwLock<HashMap<MetadataScope, BTreeMap<String, Value>>>,
}

impl MetadataStore {
    /// One value (`null` when unset), or the whole scope as an object when
    /// `key` is `None`.
    pub fn get(&self, scope: &MetadataScope, key: Option<&str>) -> Value {
        let scopes = read_guard(&self.scopes);
        let entries = scopes.get(scope);
        match key {
            Some(key) => entries.and_then(|entries| entries.get(key)).cloned().unwrap_or(Value::Null),
            None => Value::Object(
                entries
                    .map(|entries| {
                        entries.iter().map(|(key, value)| (key.clone(), value.clone())).collect()
                    })
                    .unwrap_or_else(Map::new),
            ),
        }
    }

    pub fn set(&self, scope: MetadataScope, key: String, value: Value) {
        write_guard(&self.scopes).entry(scope).or_default().insert(key, value);
    }

    pub fn delete(&self, scope: &MetadataScope, key: &str) -> bool {
        let mut scopes = write_guard(&self.scopes);
        let Some(entries) = scopes.get_mut(scope) else {
            return false;
        };
        let deleted = entries.remove(key).is_some();
        if entries.is_empty() {
            scopes.remove(scope);
        }
        deleted
    }

    /// Drop a whole scope, e.g. when its chat or model is deleted.
    pub fn clear(&self, scope: &MetadataScope) {
        write_guard(&self.scopes).remove(scope);
    }
}

#[cfg(test)]
mod tests {
    use parley_common::metadata::MetadataPath;
    use parley_common::types::UserRole;
    use serde_json::json;
    use uuid::Uuid;

    use super::{access_for, Access, MetadataScope, MetadataStore};

    #[test]
    fn access_table_matches_roles() {
        let caller = Uuid::new_v4();
        let other = Uuid::new_v4();
        let model = MetadataPath::Model("m".into());

        assert_eq!(access_for(&MetadataPath::Global, caller, UserRole::User), Access::Read);
        assert_eq!(access_for(&MetadataPath::Global, caller, UserRole::Admin), Access::ReadWrite);
        assert_eq!(access_for(&model, caller, UserRole::User), Access::Read);
        assert_eq!(access_for(&MetadataPath::User, caller, UserRole::User), Access::ReadWrite);
        assert_eq!(
            access_for(&MetadataPath::UserPublic(caller), caller, UserRole::User),
            Access::ReadWrite
        );
        assert_eq!(access_for(&MetadataPath::UserPublic(other), caller, UserRole::Admin), Access::Read);
        assert!(Access::Read.can_read());
        assert!(!Access::Read.can_write());
        assert!(!Access::None.can_read());
    }

    #[test]
    fn private_user_scope_resolves_to_caller() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let store = MetadataStore::default();

        store.set(MetadataScope::resolve(&MetadataPath::User, alice), "theme".into(), json!("dark"));

        assert_eq!(
            store.get(&MetadataScope::resolve(&MetadataPath::User, alice), Some("theme")),
            json!("dark")
        );
        assert_eq!(
            store.get(&MetadataScope::resolve(&MetadataPath::User, bob), Some("theme")),
            json!(null)
        );
    }

    #[test]
    fn get_without_key_returns_scope_object() {
        let store = MetadataStore::default();
        store.set(MetadataScope::Global, "a".into(), json!(1));
        store.set(MetadataScope::Global, "b".into(), json!({ "x": true }));

        assert_eq!(store.get(&MetadataScope::Global, None), json!({ "a": 1, "b": { "x": true } }));
        assert_eq!(store.get(&MetadataScope::Chat("c".into()), None), json!({}));
    }

    #[test]
    fn delete_reports_whether_key_existed() {
        let store = MetadataStore::default();
        let scope = MetadataScope::Chat("c1".into());
        store.set(scope.clone(), "pinned".into(), json!(true));

        assert!(store.delete(&scope, "pinned"));
        assert!(!store.delete(&scope, "pinned"));

        store.set(scope.clone(), "a".into(), json!(1));
        store.clear(&scope);
        assert_eq!(store.get(&scope, Some("a")), json!(null));
    }
}
