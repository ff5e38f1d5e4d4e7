use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::{ATTR_ACCOUNT_ID, ATTR_ORIGIN, ATTR_ROUTING_KEY, ATTR_TYPE};

/// 广播消息属性。以 `_` 开头的键为保留键
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageAttributes(BTreeMap<String, String>);

impl MessageAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn origin(&self) -> Option<&str> {
        self.get(ATTR_ORIGIN)
    }

    pub fn message_type(&self) -> Option<&str> {
        self.get(ATTR_TYPE)
    }

    pub fn account_id(&self) -> Option<&str> {
        self.get(ATTR_ACCOUNT_ID)
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.get(ATTR_ROUTING_KEY)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MessageAttributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
