// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Strategy-per-resource-class cache in front of every outbound fetch.
//!
//! Each request is matched against an ordered list of resource class predicates; the first match
//! decides the strategy and the namespace. Namespaces are versioned: activating a new version
//! swaps the whole namespace set at once and deletes the namespaces of older versions.

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use fieldapiclient::{
    ApiRequest, ApiResponse, Method, Rejection, ResilientTransport, Transport, TransportOutcome,
};
use parking_lot::RwLock;
use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::Url;

use self::{
    request::cache_key,
    route::{RouteRules, RouteTarget},
    strategy::Target,
};

pub use namespace::NamespaceSet;
pub use request::{Destination, FetchRequest};
pub use route::{ResourceClass, Strategy};
pub use storage::{CacheStorage, CachedEntry, MemoryCacheStorage, NamespaceLimits};

mod namespace;
mod request;
mod route;
mod storage;
mod strategy;

/// Key of the offline document in the navigation namespace.
pub(crate) const OFFLINE_KEY: &str = "offline:document";

pub const DEFAULT_OFFLINE_DOCUMENT: &str = "<!DOCTYPE html>\
<html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You are offline</h1>\
<p>Recorded changes are kept on this device and synchronized once you are back online.</p>\
</body></html>";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Invalid request URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The network failed and no cached copy could be used instead
    #[error("Network request failed: {0}")]
    Network(String),
    #[error("Offline and nothing cached for {url}: {reason}")]
    NoFallback { url: String, reason: String },
    #[error("Cache namespace {namespace} of version {version} vanished during activation")]
    Incomplete { version: String, namespace: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    OfflineFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheResponse {
    pub response: ApiResponse,
    pub source: ResponseSource,
}

impl CacheResponse {
    fn network(response: ApiResponse) -> Self {
        Self {
            response,
            source: ResponseSource::Network,
        }
    }

    fn cache(response: ApiResponse) -> Self {
        Self {
            response,
            source: ResponseSource::Cache,
        }
    }

    fn offline(response: ApiResponse) -> Self {
        Self {
            response,
            source: ResponseSource::OfflineFallback,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Content version of the namespace set activated on construction
    pub version: String,
    /// Origin of the application; static assets and API reads are only matched on it
    pub app_origin: Url,
    pub api_prefix: String,
    /// Hosts of the object storage serving uploaded images
    pub storage_hosts: Vec<String>,
    pub pages: NamespaceLimits,
    pub api: NamespaceLimits,
    pub objects: NamespaceLimits,
    pub static_assets: NamespaceLimits,
    /// Everything not matched by another resource class, third-party origins included
    pub runtime: NamespaceLimits,
    pub offline_document: String,
}

impl CacheConfig {
    pub fn new(app_origin: Url) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            app_origin,
            api_prefix: "/api/".to_owned(),
            storage_hosts: Vec::new(),
            pages: NamespaceLimits {
                max_entries: NonZeroUsize::new(50),
                max_age: None,
            },
            api: NamespaceLimits {
                max_entries: NonZeroUsize::new(100),
                max_age: Some(Duration::from_secs(24 * 60 * 60)),
            },
            objects: NamespaceLimits {
                max_entries: NonZeroUsize::new(200),
                max_age: Some(Duration::from_secs(30 * 24 * 60 * 60)),
            },
            static_assets: NamespaceLimits {
                max_entries: NonZeroUsize::new(500),
                max_age: None,
            },
            runtime: NamespaceLimits {
                max_entries: NonZeroUsize::new(100),
                max_age: Some(Duration::from_secs(24 * 60 * 60)),
            },
            offline_document: DEFAULT_OFFLINE_DOCUMENT.to_owned(),
        }
    }

    fn limits(&self, class: ResourceClass) -> NamespaceLimits {
        match class {
            ResourceClass::Navigation => self.pages,
            ResourceClass::StaticAsset => self.static_assets,
            ResourceClass::ApiRead => self.api,
            ResourceClass::ObjectStorage => self.objects,
            ResourceClass::Other => self.runtime,
        }
    }
}

/// Serves outbound fetches according to the strategy of their resource class.
///
/// Network requests go through the same [`Transport`] as the mutation replay, so gateway
/// failures are retried before a cached fallback is considered.
pub struct CacheLayer<T = ResilientTransport, S = MemoryCacheStorage> {
    inner: Arc<CacheLayerInner<T, S>>,
}

struct CacheLayerInner<T, S> {
    transport: T,
    storage: S,
    config: CacheConfig,
    rules: RouteRules,
    /// Snapshotted by each request; replaced as a whole on activation
    active: RwLock<Arc<NamespaceSet>>,
    /// Held for the whole activation; activations never interleave
    activation: tokio::sync::Mutex<()>,
    revalidations: TaskTracker,
}

impl<T, S> Clone for CacheLayer<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> CacheLayer<T, MemoryCacheStorage> {
    pub fn new(config: CacheConfig, transport: T) -> Self {
        Self::with_storage(config, transport, MemoryCacheStorage::new())
    }
}

impl<T: Transport, S: CacheStorage> CacheLayer<T, S> {
    /// Creates the layer and prepares the namespace set of `config.version`.
    ///
    /// Namespaces of other versions found in the storage are deleted.
    pub fn with_storage(config: CacheConfig, transport: T, storage: S) -> Self {
        let namespaces = NamespaceSet::new(config.version.clone());
        let rules = RouteRules {
            app_origin: config.app_origin.clone(),
            api_prefix: config.api_prefix.clone(),
            storage_hosts: config.storage_hosts.clone(),
        };
        let layer = Self {
            inner: Arc::new(CacheLayerInner {
                transport,
                storage,
                config,
                rules,
                active: RwLock::new(Arc::new(namespaces.clone())),
                activation: tokio::sync::Mutex::new(()),
                revalidations: TaskTracker::new(),
            }),
        };
        layer.prepare(&namespaces);
        layer.delete_superseded(&namespaces);
        layer
    }

    pub fn storage(&self) -> &S {
        &self.inner.storage
    }

    pub fn active_version(&self) -> String {
        self.active().version().to_owned()
    }

    fn active(&self) -> Arc<NamespaceSet> {
        self.inner.active.read().clone()
    }

    /// Serves a fetch according to the strategy of its resource class.
    ///
    /// Only `GET` requests are cached; all other requests go straight to the network.
    pub async fn fetch(&self, request: FetchRequest) -> Result<CacheResponse, CacheError> {
        let url = self.inner.config.app_origin.join(&request.request.url)?;
        let network_request = ApiRequest {
            url: url.to_string(),
            ..request.request
        };

        if network_request.method != Method::GET {
            let response = self.fetch_network(&network_request).await?;
            return Ok(CacheResponse::network(response));
        }

        // all lookups of this request resolve against the same version
        let namespaces = self.active();
        let class = self.classify(&network_request.method, &url, request.destination);
        let target = Target {
            class,
            namespace: namespaces.name(class),
            key: cache_key(&network_request.method, &url),
            max_age: self.inner.config.limits(class).max_age,
        };
        debug!(%url, %class, strategy = ?class.strategy(), "routing fetch");

        match class.strategy() {
            Strategy::NetworkFirst => self.network_first(&network_request, &target).await,
            Strategy::CacheFirst => self.cache_first(&network_request, &target).await,
            Strategy::StaleWhileRevalidate => {
                self.stale_while_revalidate(&network_request, &target)
                    .await
            }
            Strategy::NetworkFirstWithFallback => {
                self.network_first_with_fallback(&network_request, &target)
                    .await
            }
        }
    }

    /// Activates the namespace set of a new application version.
    ///
    /// The new namespaces are created and populated with the offline document and the precached
    /// resources first. Only then the active set is swapped and all namespaces of other versions
    /// are deleted. If precaching fails, the previous version stays active.
    ///
    /// Concurrent activations run one after the other; the last one to finish wins.
    pub async fn activate(
        &self,
        version: &str,
        precache: &[FetchRequest],
    ) -> Result<(), CacheError> {
        let _activation = self.inner.activation.lock().await;

        let namespaces = NamespaceSet::new(version);
        self.prepare(&namespaces);

        if let Err(error) = self.precache(&namespaces, precache).await {
            warn!(version, %error, "failed to precache; keeping previous cache version");
            self.abandon(&namespaces);
            return Err(error);
        }

        let previous = {
            let mut active = self.inner.active.write();
            let existing = self.inner.storage.namespaces();
            if let Some(missing) = namespaces.names().find(|name| !existing.contains(name)) {
                drop(active);
                warn!(
                    version,
                    namespace = %missing,
                    "cache namespace vanished; keeping previous cache version"
                );
                self.abandon(&namespaces);
                return Err(CacheError::Incomplete {
                    version: version.to_owned(),
                    namespace: missing,
                });
            }
            std::mem::replace(&mut *active, Arc::new(namespaces.clone()))
        };
        info!(from = previous.version(), to = version, "activated cache version");
        self.delete_superseded(&namespaces);
        Ok(())
    }

    /// Deletes the namespaces of a failed activation unless they are the active ones.
    fn abandon(&self, namespaces: &NamespaceSet) {
        if self.active_version() != namespaces.version() {
            for namespace in namespaces.names() {
                self.inner.storage.delete_namespace(&namespace);
            }
        }
    }

    /// The target in the currently active namespace set, if the set was swapped after the target
    /// was resolved.
    fn retarget(&self, target: &Target) -> Option<Target> {
        let namespace = self.active().name(target.class);
        (namespace != target.namespace).then(|| Target {
            namespace,
            ..target.clone()
        })
    }

    /// Waits until all background revalidations are finished.
    pub async fn settle(&self) {
        let revalidations = &self.inner.revalidations;
        revalidations.close();
        revalidations.wait().await;
        revalidations.reopen();
    }

    fn classify(&self, method: &Method, url: &Url, destination: Destination) -> ResourceClass {
        self.inner.rules.classify(&RouteTarget {
            method,
            url,
            destination,
        })
    }

    fn prepare(&self, namespaces: &NamespaceSet) {
        for class in ResourceClass::ALL {
            self.inner
                .storage
                .open(&namespaces.name(class), self.inner.config.limits(class));
        }
        let offline = ApiResponse {
            headers: vec![(
                "content-type".to_owned(),
                "text/html; charset=utf-8".to_owned(),
            )],
            ..ApiResponse::new(200, self.inner.config.offline_document.clone())
        };
        self.inner.storage.put(
            &namespaces.name(ResourceClass::Navigation),
            OFFLINE_KEY,
            CachedEntry::new(offline),
        );
    }

    async fn precache(
        &self,
        namespaces: &NamespaceSet,
        precache: &[FetchRequest],
    ) -> Result<(), CacheError> {
        for request in precache {
            let url = self.inner.config.app_origin.join(&request.request.url)?;
            let network_request = ApiRequest {
                url: url.to_string(),
                ..request.request.clone()
            };
            let response = self.fetch_network(&network_request).await?;
            if !response.is_success() {
                return Err(CacheError::Network(format!(
                    "{url}: {}",
                    response.error_reason()
                )));
            }
            let class = self.classify(&network_request.method, &url, request.destination);
            let target = Target {
                class,
                namespace: namespaces.name(class),
                key: cache_key(&network_request.method, &url),
                max_age: None,
            };
            self.store(&target, &response);
        }
        Ok(())
    }

    fn delete_superseded(&self, namespaces: &NamespaceSet) {
        for namespace in self.inner.storage.namespaces() {
            if namespaces.is_superseded(&namespace) {
                debug!(namespace, "deleting superseded cache namespace");
                self.inner.storage.delete_namespace(&namespace);
            }
        }
    }

    /// Any response counts; only a missing response is a failure.
    async fn fetch_network(&self, request: &ApiRequest) -> Result<ApiResponse, CacheError> {
        match self.inner.transport.execute(request).await {
            TransportOutcome::Success(response)
            | TransportOutcome::PermanentReject(Rejection {
                response: Some(response),
                ..
            }) => Ok(response),
            TransportOutcome::PermanentReject(Rejection { reason, .. })
            | TransportOutcome::TransientExhausted(reason) => Err(CacheError::Network(reason)),
        }
    }
}
