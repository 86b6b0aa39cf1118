// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Write operations that can be queued while offline and replayed later.
//!
//! Every payload maps onto exactly one request of the remote REST API. The JSON shape of the
//! payload is the request body expected by the corresponding endpoint.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identifiers::ItemId;

/// Tag identifying the domain object a mutation writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    StockMovement,
    ItemUpdate,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::StockMovement => "stock_movement",
            ResourceKind::ItemUpdate => "item_update",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unknown resource kind: {actual}")]
pub struct UnknownResourceKind {
    pub actual: String,
}

impl FromStr for ResourceKind {
    type Err = UnknownResourceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stock_movement" => Ok(ResourceKind::StockMovement),
            "item_update" => Ok(ResourceKind::ItemUpdate),
            s => Err(UnknownResourceKind {
                actual: s.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementDirection {
    In,
    Out,
}

/// A stock quantity change of a single item.
///
/// The quantity is a delta, applied in the given direction. Replaying movements in a different
/// order may change intermediate stock levels, which is why the queue never reorders them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub item_id: ItemId,
    pub quantity: u32,
    pub direction: MovementDirection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Fields of an item that can be changed while offline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_stock: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemUpdate {
    pub item_id: ItemId,
    pub changes: ItemChanges,
}

/// The data needed to replay one write against the remote API.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::From)]
pub enum MutationPayload {
    StockMovement(StockMovement),
    ItemUpdate(ItemUpdate),
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error(transparent)]
    UnknownKind(#[from] UnknownResourceKind),
    #[error("Invalid payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid item id {0:?}")]
    InvalidItemId(String),
    #[error("Stock movement of {0} has no quantity")]
    ZeroQuantity(ItemId),
}

impl MutationPayload {
    pub fn kind(&self) -> ResourceKind {
        match self {
            MutationPayload::StockMovement(_) => ResourceKind::StockMovement,
            MutationPayload::ItemUpdate(_) => ResourceKind::ItemUpdate,
        }
    }

    /// Serializes the payload for local storage. The kind is stored separately.
    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            MutationPayload::StockMovement(movement) => serde_json::to_string(movement),
            MutationPayload::ItemUpdate(update) => serde_json::to_string(update),
        }
    }

    /// Inverse of [`Self::to_json`].
    pub fn from_json(kind: &str, json: &str) -> Result<Self, PayloadError> {
        let payload = match kind.parse::<ResourceKind>()? {
            ResourceKind::StockMovement => Self::StockMovement(serde_json::from_str(json)?),
            ResourceKind::ItemUpdate => Self::ItemUpdate(serde_json::from_str(json)?),
        };
        Ok(payload)
    }

    /// Checks that the payload can be replayed as is.
    ///
    /// Stock movements need a positive quantity. Item ids must be usable as a single path
    /// segment, which rules out empty and dot-only ids.
    pub fn validate(&self) -> Result<(), PayloadError> {
        let item_id = match self {
            MutationPayload::StockMovement(movement) => {
                if movement.quantity == 0 {
                    return Err(PayloadError::ZeroQuantity(movement.item_id.clone()));
                }
                &movement.item_id
            }
            MutationPayload::ItemUpdate(update) => &update.item_id,
        };
        match item_id.as_str() {
            "" | "." | ".." => Err(PayloadError::InvalidItemId(item_id.to_string())),
            _ => Ok(()),
        }
    }

    /// The remote request replaying this payload.
    pub fn remote_write(&self) -> Result<RemoteWrite, PayloadError> {
        self.validate()?;
        let write = match self {
            MutationPayload::StockMovement(movement) => RemoteWrite {
                method: WriteMethod::Post,
                path: vec!["api".to_owned(), "stock-movements".to_owned()],
                body: serde_json::to_value(movement)?,
            },
            MutationPayload::ItemUpdate(update) => RemoteWrite {
                method: WriteMethod::Patch,
                path: vec![
                    "api".to_owned(),
                    "items".to_owned(),
                    update.item_id.as_str().to_owned(),
                ],
                body: serde_json::to_value(&update.changes)?,
            },
        };
        Ok(write)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMethod {
    Post,
    Patch,
}

/// Transport-agnostic description of a write request.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteWrite {
    pub method: WriteMethod,
    /// Path segments below the API base URL, not percent-encoded
    pub path: Vec<String>,
    pub body: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn movement() -> StockMovement {
        StockMovement {
            item_id: ItemId::new("drill-42"),
            quantity: 3,
            direction: MovementDirection::Out,
            note: Some("site B".to_owned()),
        }
    }

    #[test]
    fn stored_payload_restores_the_same_mutation() {
        let payload = MutationPayload::from(movement());
        let json = payload.to_json().unwrap();
        let restored = MutationPayload::from_json(payload.kind().as_str(), &json).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let error = MutationPayload::from_json("teleport", "{}").unwrap_err();
        assert!(matches!(error, PayloadError::UnknownKind(_)));
    }

    #[test]
    fn stock_movement_posts_payload_as_body() {
        let write = MutationPayload::from(movement()).remote_write().unwrap();
        assert_eq!(write.method, WriteMethod::Post);
        assert_eq!(write.path, ["api", "stock-movements"]);
        assert_eq!(
            write.body,
            json!({
                "item_id": "drill-42",
                "quantity": 3,
                "direction": "out",
                "note": "site B",
            })
        );
    }

    #[test]
    fn item_update_patches_only_changed_fields() {
        let update = ItemUpdate {
            item_id: ItemId::new("ladder-7"),
            changes: ItemChanges {
                location: Some("Shelf 4".to_owned()),
                ..Default::default()
            },
        };
        let write = MutationPayload::from(update).remote_write().unwrap();
        assert_eq!(write.method, WriteMethod::Patch);
        assert_eq!(write.path, ["api", "items", "ladder-7"]);
        assert_eq!(write.body, json!({ "location": "Shelf 4" }));
    }

    #[test]
    fn item_id_stays_a_single_path_segment() {
        let update = ItemUpdate {
            item_id: ItemId::new("../../admin/users?x="),
            changes: ItemChanges::default(),
        };
        let write = MutationPayload::from(update).remote_write().unwrap();
        assert_eq!(write.path, ["api", "items", "../../admin/users?x="]);
    }

    #[test]
    fn unaddressable_item_ids_are_rejected() {
        for id in ["", ".", ".."] {
            let update = ItemUpdate {
                item_id: ItemId::new(id),
                changes: ItemChanges::default(),
            };
            let error = MutationPayload::from(update).remote_write().unwrap_err();
            assert!(matches!(error, PayloadError::InvalidItemId(_)), "{id:?}");
        }
    }

    #[test]
    fn empty_stock_movement_is_rejected() {
        let payload = MutationPayload::from(StockMovement {
            quantity: 0,
            ..movement()
        });
        assert!(matches!(
            payload.validate(),
            Err(PayloadError::ZeroQuantity(id)) if id == ItemId::new("drill-42")
        ));
        assert!(MutationPayload::from(movement()).validate().is_ok());
    }
}
