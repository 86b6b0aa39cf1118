// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::time::Duration;

use fieldapiclient::{ApiRequest, ApiResponse, Transport};
use tracing::debug;

use super::{
    CacheError, CacheLayer, CacheResponse, OFFLINE_KEY,
    route::ResourceClass,
    storage::{CacheStorage, CachedEntry},
};

/// Where a response is looked up and stored.
#[derive(Debug, Clone)]
pub(super) struct Target {
    pub(super) class: ResourceClass,
    pub(super) namespace: String,
    pub(super) key: String,
    pub(super) max_age: Option<Duration>,
}

impl<T: Transport, S: CacheStorage> CacheLayer<T, S> {
    pub(super) async fn network_first(
        &self,
        request: &ApiRequest,
        target: &Target,
    ) -> Result<CacheResponse, CacheError> {
        match self.fetch_network(request).await {
            Ok(response) => {
                self.store(target, &response);
                Ok(CacheResponse::network(response))
            }
            Err(error) => match self.fallback(target) {
                Some(response) => {
                    debug!(%error, key = %target.key, "network failed; serving cached response");
                    Ok(CacheResponse::cache(response))
                }
                None => Err(error),
            },
        }
    }

    pub(super) async fn cache_first(
        &self,
        request: &ApiRequest,
        target: &Target,
    ) -> Result<CacheResponse, CacheError> {
        if let Some(response) = self.cached(target) {
            return Ok(CacheResponse::cache(response));
        }
        let response = self.fetch_network(request).await?;
        self.store(target, &response);
        Ok(CacheResponse::network(response))
    }

    pub(super) async fn stale_while_revalidate(
        &self,
        request: &ApiRequest,
        target: &Target,
    ) -> Result<CacheResponse, CacheError> {
        match self.cached(target) {
            Some(response) => {
                self.spawn_revalidation(request.clone(), target.clone());
                Ok(CacheResponse::cache(response))
            }
            None => {
                let response = self.fetch_network(request).await?;
                self.store(target, &response);
                Ok(CacheResponse::network(response))
            }
        }
    }

    pub(super) async fn network_first_with_fallback(
        &self,
        request: &ApiRequest,
        target: &Target,
    ) -> Result<CacheResponse, CacheError> {
        let error = match self.fetch_network(request).await {
            Ok(response) => {
                self.store(target, &response);
                return Ok(CacheResponse::network(response));
            }
            Err(error) => error,
        };

        if let Some(response) = self.fallback(target) {
            debug!(%error, key = %target.key, "offline; serving cached document");
            return Ok(CacheResponse::cache(response));
        }
        let offline = Target {
            key: OFFLINE_KEY.to_owned(),
            max_age: None,
            ..target.clone()
        };
        match self.fallback(&offline) {
            Some(offline) => {
                debug!(%error, key = %target.key, "offline; serving offline document");
                Ok(CacheResponse::offline(offline))
            }
            None => Err(CacheError::NoFallback {
                url: request.url.clone(),
                reason: error.to_string(),
            }),
        }
    }

    fn spawn_revalidation(&self, request: ApiRequest, target: Target) {
        let layer = self.clone();
        self.inner.revalidations.spawn(async move {
            match layer.fetch_network(&request).await {
                Ok(response) => layer.store(&target, &response),
                Err(error) => {
                    debug!(%error, key = %target.key, "revalidation failed; keeping cached response")
                }
            }
        });
    }

    /// Cached response after a network failure.
    ///
    /// Looks into the currently active namespace set too, in case the set the request started
    /// with was deleted by an activation meanwhile.
    fn fallback(&self, target: &Target) -> Option<ApiResponse> {
        self.cached(target).or_else(|| {
            let current = self.retarget(target)?;
            self.cached(&current)
        })
    }

    /// Fresh cached response, if any. Expired entries are evicted.
    fn cached(&self, target: &Target) -> Option<ApiResponse> {
        let entry = self.inner.storage.lookup(&target.namespace, &target.key)?;
        if entry.is_expired(target.max_age) {
            debug!(key = %target.key, namespace = %target.namespace, "cached response expired");
            self.inner.storage.delete(&target.namespace, &target.key);
            return None;
        }
        Some(entry.response)
    }

    /// Stores successful responses only.
    pub(super) fn store(&self, target: &Target, response: &ApiResponse) {
        if !response.is_success() {
            debug!(key = %target.key, status = response.status, "not caching unsuccessful response");
            return;
        }
        let stored = self.inner.storage.put(
            &target.namespace,
            &target.key,
            CachedEntry::new(response.clone()),
        );
        if !stored {
            // superseded by a newer version in the meantime
            debug!(key = %target.key, namespace = %target.namespace, "namespace gone; dropping response");
        }
    }
}
