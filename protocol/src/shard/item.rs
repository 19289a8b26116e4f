//! Item records stored per shard.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ShardId;

/// Availability of an item on the market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Available,
    Pending,
    Exchanged,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => write!(f, "AVAILABLE"),
            Self::Pending => write!(f, "PENDING"),
            Self::Exchanged => write!(f, "EXCHANGED"),
        }
    }
}

/// An item owned by a user. `id` is assigned by the store on save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub images: Vec<String>,
    pub status: ItemStatus,
    pub shard_id: ShardId,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
}

/// Caller-supplied fields of a new item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewItem {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub images: Vec<String>,
}

impl NewItem {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            images: Vec::new(),
        }
    }
}

/// Partial update applied by `Store::update_item`. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<ItemStatus>,
}

impl ItemPatch {
    pub fn status(status: ItemStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn apply(&self, item: &mut Item) {
        if let Some(name) = &self.name {
            item.name = name.clone();
        }
        if let Some(description) = &self.description {
            item.description = description.clone();
        }
        if let Some(status) = self.status {
            item.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> Item {
        Item {
            id: "1".into(),
            user_id: "alice".into(),
            name: "book".into(),
            description: "paperback".into(),
            images: vec![],
            status: ItemStatus::Available,
            shard_id: ShardId::new(1),
            created_at: 0,
        }
    }

    #[test]
    fn patch_only_touches_set_fields() {
        let mut it = item();
        ItemPatch::status(ItemStatus::Exchanged).apply(&mut it);
        assert_eq!(it.status, ItemStatus::Exchanged);
        assert_eq!(it.name, "book");
    }

    #[test]
    fn item_wire_format_is_camel_case() {
        let json = serde_json::to_value(item()).unwrap();
        assert_eq!(json["userId"], "alice");
        assert_eq!(json["shardId"], "01");
        assert_eq!(json["status"], "AVAILABLE");
    }
}
