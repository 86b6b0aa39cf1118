// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Offline-first data layer of the field inventory client.
//!
//! User writes are appended to a persistent [`MutationQueue`] and replayed in order by the
//! [`SyncService`] once the remote API is reachable. Reads and asset loads go through the
//! [`CacheLayer`].

pub mod cache;
pub mod clients;
pub mod mutation_queue;
pub mod settings;
pub mod sync_service;

mod utils;

pub use crate::{
    cache::{CacheError, CacheLayer, CacheResponse, FetchRequest, ResponseSource},
    clients::FieldClient,
    mutation_queue::{
        FailedMutation, MutationQueue, MutationStatus, MutationStore, PendingSummary, QueueError,
        QueuedMutation,
    },
    settings::{Settings, SettingsError},
    sync_service::{DrainAborted, SyncEngine, SyncReport, SyncService, SyncTrigger},
};

pub use fieldcommon::{
    identifiers::{ItemId, MutationId},
    mutations::{ItemChanges, ItemUpdate, MovementDirection, ResourceKind, StockMovement},
};
