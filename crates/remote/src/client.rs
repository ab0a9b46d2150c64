//! HTTP client for the remote document store.
//!
//! Speaks a generic JSON document API:
//!
//! - `GET    /collections/{collection}/documents[?fields=..|?field=..&value=..]`
//! - `GET    /collections/{collection}/documents/{id}`
//! - `POST   /collections/{collection}/documents`
//! - `PATCH  /collections/{collection}/documents/{id}`
//! - `DELETE /collections/{collection}/documents/{id}`
//!
//! Device tokens live in the `device_tokens` sub-collection of each
//! recipient document, keyed by device id.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use attendsync_core::cache::{InMemoryKeyValueStore, KeyTracker, KeyValueStore};
use attendsync_core::notifications::{DeviceToken, RecipientRef, TokenStore};
use attendsync_core::sync::{
    DomainSpec, FieldMap, ListOptions, RemoteRecord, RemoteStore, SyncDomain,
};

use crate::error::{RemoteError, Result};
use crate::types::*;

/// Default timeout for API requests.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Default lifetime of cached collection listings.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const MAX_LOG_BODY_CHARS: usize = 512;
const TOKEN_COLLECTION: &str = "device_tokens";

#[derive(Debug, Clone)]
pub struct RemoteStoreConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub cache_ttl: Duration,
}

impl RemoteStoreConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }
}

pub(crate) fn log_response(component: &str, status: reqwest::StatusCode, body: &str) {
    if status.is_success() {
        debug!("[{}] response status: {}", component, status);
        return;
    }

    let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
    if body.chars().count() > MAX_LOG_BODY_CHARS {
        preview.push_str("...");
    }
    debug!("[{}] response error ({}): {}", component, status, preview);
}

pub(crate) fn api_error(status: reqwest::StatusCode, body: &str) -> RemoteError {
    if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(body) {
        return RemoteError::api(status.as_u16(), format!("{}: {}", error.code, error.message));
    }
    RemoteError::api(status.as_u16(), format!("Request failed: {}", body))
}

pub(crate) fn bearer_headers(token: Option<&str>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(token) = token {
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| RemoteError::auth("Invalid access token format"))?;
        headers.insert(AUTHORIZATION, auth_value);
    }
    Ok(headers)
}

fn recipient_collection(recipient: &RecipientRef) -> &'static str {
    match recipient {
        RecipientRef::Employee(_) => "employees",
        RecipientRef::User(_) => "users",
    }
}

fn time_field(fields: &FieldMap, key: &str) -> Option<DateTime<Utc>> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn token_from_document(recipient: &RecipientRef, doc: DocumentDto) -> Option<DeviceToken> {
    let device_id = doc.id.filter(|id| !id.trim().is_empty())?;
    let token = doc
        .fields
        .get("token")
        .and_then(Value::as_str)
        .filter(|t| !t.trim().is_empty())?
        .to_string();
    let created_at = time_field(&doc.fields, "created_at").unwrap_or_default();
    Some(DeviceToken {
        recipient: recipient.clone(),
        device_id,
        token,
        platform: doc
            .fields
            .get("platform")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        created_at,
        last_used_at: time_field(&doc.fields, "last_used_at").unwrap_or(created_at),
    })
}

fn time_value(at: &DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Client for the remote document store with a TTL read cache for
/// collection listings.
pub struct RemoteStoreClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    cache: Arc<dyn KeyValueStore>,
    tracker: KeyTracker,
    cache_ttl: Duration,
}

impl RemoteStoreClient {
    pub fn new(config: RemoteStoreConfig) -> Result<Self> {
        Self::with_cache(config, Arc::new(InMemoryKeyValueStore::new()))
    }

    /// Uses `cache` for listing snapshots instead of a private in-memory map.
    pub fn with_cache(config: RemoteStoreConfig, cache: Arc<dyn KeyValueStore>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
            cache,
            tracker: KeyTracker::new(),
            cache_ttl: config.cache_ttl,
        })
    }

    fn headers(&self) -> Result<HeaderMap> {
        bearer_headers(self.token.as_deref())
    }

    fn documents_url(&self, collection: &str) -> String {
        format!(
            "{}/collections/{}/documents",
            self.base_url,
            urlencoding::encode(collection)
        )
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        format!(
            "{}/{}",
            self.documents_url(collection),
            urlencoding::encode(id)
        )
    }

    fn tokens_url(&self, recipient: &RecipientRef) -> String {
        format!(
            "{}/{}",
            self.document_url(recipient_collection(recipient), recipient.id()),
            TOKEN_COLLECTION
        )
    }

    fn token_url(&self, recipient: &RecipientRef, device_id: &str) -> String {
        format!(
            "{}/{}",
            self.tokens_url(recipient),
            urlencoding::encode(device_id)
        )
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        log_response("RemoteStore", status, &body);

        if !status.is_success() {
            return Err(api_error(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| {
            log::error!("[RemoteStore] failed to deserialize response: {}", e);
            RemoteError::api(status.as_u16(), format!("Failed to parse response: {}", e))
        })
    }

    async fn expect_success(response: reqwest::Response) -> Result<()> {
        let status = response.status();
        let body = response.text().await?;
        log_response("RemoteStore", status, &body);
        if status.is_success() {
            Ok(())
        } else {
            Err(api_error(status, &body))
        }
    }

    /// GET /collections/{collection}/documents[?fields=a,b]
    pub async fn fetch_documents(
        &self,
        collection: &str,
        projection: Option<&[&str]>,
    ) -> Result<Vec<DocumentDto>> {
        let mut url = self.documents_url(collection);
        if let Some(fields) = projection.filter(|f| !f.is_empty()) {
            url = format!("{}?fields={}", url, urlencoding::encode(&fields.join(",")));
        }
        debug!("[RemoteStore] GET {}", url);

        let response = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .send()
            .await?;
        let list: DocumentListResponse = Self::parse_response(response).await?;
        Ok(list.documents)
    }

    /// GET /collections/{collection}/documents/{id}. A 404 is `None`.
    pub async fn fetch_document(&self, collection: &str, id: &str) -> Result<Option<DocumentDto>> {
        let response = self
            .client
            .get(self.document_url(collection, id))
            .headers(self.headers()?)
            .send()
            .await?;
        match Self::parse_response::<DocumentDto>(response).await {
            Ok(doc) => Ok(Some(doc)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// GET /collections/{collection}/documents?field={field}&value={value}
    pub async fn search_documents(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<DocumentDto>> {
        let url = format!(
            "{}?field={}&value={}",
            self.documents_url(collection),
            urlencoding::encode(field),
            urlencoding::encode(value)
        );
        let response = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .send()
            .await?;
        let list: DocumentListResponse = Self::parse_response(response).await?;
        Ok(list.documents)
    }

    pub async fn create_document(&self, collection: &str, id: &str, fields: &FieldMap) -> Result<()> {
        let response = self
            .client
            .post(self.documents_url(collection))
            .headers(self.headers()?)
            .json(&CreateDocumentRequest { id, fields })
            .send()
            .await?;
        Self::expect_success(response).await
    }

    pub async fn update_document(&self, collection: &str, id: &str, fields: &FieldMap) -> Result<()> {
        let response = self
            .client
            .patch(self.document_url(collection, id))
            .headers(self.headers()?)
            .json(&UpdateDocumentRequest { fields })
            .send()
            .await?;
        Self::expect_success(response).await
    }

    pub async fn delete_document(&self, collection: &str, id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.document_url(collection, id))
            .headers(self.headers()?)
            .send()
            .await?;
        match Self::expect_success(response).await {
            Err(err) if err.is_not_found() => Ok(()),
            other => other,
        }
    }

    fn list_cache_key(collection: &str, minimal: bool) -> String {
        format!(
            "remote:list:{}:{}",
            collection,
            if minimal { "minimal" } else { "full" }
        )
    }

    async fn cached_list(&self, key: &str) -> Option<Vec<RemoteRecord>> {
        match self.cache.get(key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(err) => {
                warn!("[RemoteStore] cache read failed for {}: {}", key, err);
                None
            }
        }
    }

    async fn store_list(&self, collection: &str, key: &str, records: &[RemoteRecord]) {
        let Ok(serialized) = serde_json::to_string(records) else {
            return;
        };
        match self.cache.set(key, &serialized, Some(self.cache_ttl)).await {
            Ok(()) => self.tracker.track(collection, key),
            Err(err) => warn!("[RemoteStore] cache write failed for {}: {}", key, err),
        }
    }

    /// Drops every cached key of `collection` in one pass.
    pub async fn invalidate(&self, collection: &str) {
        let keys = self.tracker.drain(&[collection]);
        if keys.is_empty() {
            return;
        }
        match self.cache.remove_many(&keys).await {
            Ok(removed) => debug!(
                "[RemoteStore] invalidated {} cached key(s) for {}",
                removed, collection
            ),
            Err(err) => warn!("[RemoteStore] cache invalidation failed for {}: {}", collection, err),
        }
    }
}

#[async_trait]
impl RemoteStore for RemoteStoreClient {
    async fn list(
        &self,
        domain: SyncDomain,
        options: ListOptions,
    ) -> attendsync_core::Result<Vec<RemoteRecord>> {
        let collection = domain.collection();
        let key = Self::list_cache_key(collection, options.minimal);
        if options.use_cache {
            if let Some(records) = self.cached_list(&key).await {
                debug!("[RemoteStore] cache hit for {}", key);
                return Ok(records);
            }
        }

        let projection = options
            .minimal
            .then(|| DomainSpec::for_domain(domain).remote_projection());
        let records = self
            .fetch_documents(collection, projection.as_deref())
            .await?
            .into_iter()
            .map(RemoteRecord::from)
            .collect::<Vec<_>>();
        self.store_list(collection, &key, &records).await;
        Ok(records)
    }

    async fn get_by_id(
        &self,
        domain: SyncDomain,
        id: &str,
    ) -> attendsync_core::Result<Option<RemoteRecord>> {
        Ok(self
            .fetch_document(domain.collection(), id)
            .await?
            .map(|mut doc| {
                doc.id.get_or_insert_with(|| id.to_string());
                RemoteRecord::from(doc)
            }))
    }

    async fn search_by_field(
        &self,
        domain: SyncDomain,
        field: &str,
        value: &str,
    ) -> attendsync_core::Result<Vec<RemoteRecord>> {
        Ok(self
            .search_documents(domain.collection(), field, value)
            .await?
            .into_iter()
            .map(RemoteRecord::from)
            .collect())
    }

    async fn create(&self, domain: SyncDomain, id: &str, data: &FieldMap) -> attendsync_core::Result<()> {
        let result = self.create_document(domain.collection(), id, data).await;
        self.invalidate(domain.collection()).await;
        Ok(result?)
    }

    async fn update(&self, domain: SyncDomain, id: &str, data: &FieldMap) -> attendsync_core::Result<()> {
        let result = self.update_document(domain.collection(), id, data).await;
        self.invalidate(domain.collection()).await;
        Ok(result?)
    }

    async fn delete(&self, domain: SyncDomain, id: &str) -> attendsync_core::Result<()> {
        let result = self.delete_document(domain.collection(), id).await;
        self.invalidate(domain.collection()).await;
        Ok(result?)
    }
}

#[async_trait]
impl TokenStore for RemoteStoreClient {
    async fn list_tokens(&self, recipient: &RecipientRef) -> attendsync_core::Result<Vec<DeviceToken>> {
        let response = self
            .client
            .get(self.tokens_url(recipient))
            .headers(self.headers()?)
            .send()
            .await
            .map_err(RemoteError::from)?;
        let list = match Self::parse_response::<DocumentListResponse>(response).await {
            Ok(list) => list,
            // No recipient document means no tokens.
            Err(err) if err.is_not_found() => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let total = list.documents.len();
        let tokens = list
            .documents
            .into_iter()
            .filter_map(|doc| token_from_document(recipient, doc))
            .collect::<Vec<_>>();
        if tokens.len() < total {
            warn!(
                "[RemoteStore] skipped {} malformed token document(s) for {}",
                total - tokens.len(),
                recipient
            );
        }
        Ok(tokens)
    }

    async fn add_token(&self, token: &DeviceToken) -> attendsync_core::Result<()> {
        let mut fields = FieldMap::new();
        fields.insert("token".to_string(), Value::String(token.token.clone()));
        fields.insert("platform".to_string(), Value::String(token.platform.clone()));
        fields.insert("created_at".to_string(), time_value(&token.created_at));
        fields.insert("last_used_at".to_string(), time_value(&token.last_used_at));

        // PUT replaces the device's previous token.
        let response = self
            .client
            .put(self.token_url(&token.recipient, &token.device_id))
            .headers(self.headers()?)
            .json(&UpdateDocumentRequest { fields: &fields })
            .send()
            .await
            .map_err(RemoteError::from)?;
        Ok(Self::expect_success(response).await?)
    }

    async fn remove_token(&self, recipient: &RecipientRef, device_id: &str) -> attendsync_core::Result<()> {
        let response = self
            .client
            .delete(self.token_url(recipient, device_id))
            .headers(self.headers()?)
            .send()
            .await
            .map_err(RemoteError::from)?;
        match Self::expect_success(response).await {
            Err(err) if !err.is_not_found() => Err(err.into()),
            _ => Ok(()),
        }
    }

    async fn touch_token(
        &self,
        recipient: &RecipientRef,
        device_id: &str,
        at: DateTime<Utc>,
    ) -> attendsync_core::Result<()> {
        let mut fields = FieldMap::new();
        fields.insert("last_used_at".to_string(), time_value(&at));
        let response = self
            .client
            .patch(self.token_url(recipient, device_id))
            .headers(self.headers()?)
            .json(&UpdateDocumentRequest { fields: &fields })
            .send()
            .await
            .map_err(RemoteError::from)?;
        Ok(Self::expect_success(response).await?)
    }
}
