//! Feed items as delivered by the news API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One feed entry. Identity is `id`; ordering is `published_at`.
///
/// Everything besides the two keys (title, source, url, tickers, ...) is kept
/// verbatim in `fields` so the engine never needs to know the row schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    #[serde(alias = "publishedAt")]
    pub published_at: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Item {
    pub fn new(id: impl Into<String>, published_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            published_at,
            fields: Map::new(),
        }
    }

    /// Builder-style payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Sort newest first. Stable, so items sharing a timestamp keep arrival order.
pub(crate) fn sort_newest_first(items: &mut [Item]) {
    items.sort_by(|a, b| b.published_at.cmp(&a.published_at));
}

/// Newest `published_at` in a batch, independent of the order the server used.
pub(crate) fn newest(items: &[Item]) -> Option<DateTime<Utc>> {
    items.iter().map(|i| i.published_at).max()
}
