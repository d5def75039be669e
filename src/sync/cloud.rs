//! S3-compatible object storage for the sync mesh.
//!
//! The store is untrusted: everything uploaded is ciphertext, and the
//! keyspace under `{user_id}/` is the only structure the server sees:
//!
//! ```text
//! {user_id}/dek.enc                          — reserved (unused in v1)
//! {user_id}/manifest.enc                     — encrypted aggregate manifest
//! {user_id}/changelog/{device_id}/{batch}.enc
//! {user_id}/files/{sha256}.enc               — content-addressed
//! ```
//!
//! [`ObjectStore`] is the transport seam: [`S3Store`] signs requests with
//! AWS Signature V4 over plain `reqwest`, and [`MemoryStore`] backs tests
//! and offline development.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::config::Settings;
use crate::error::{Result, SyncError};

type HmacSha256 = Hmac<Sha256>;

/// Result of a prefix listing.
#[derive(Debug, Default, Clone)]
pub struct ObjectListing {
    pub keys: Vec<String>,
    pub common_prefixes: Vec<String>,
}

/// Raw object operations. Implementations must be safe to call
/// concurrently.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the bucket if absent. Idempotent.
    async fn ensure_bucket(&self) -> Result<()>;
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()>;
    /// `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
    /// List all keys under `prefix`, optionally collapsing at `delimiter`.
    /// Pagination is handled internally.
    async fn list(&self, prefix: &str, delimiter: Option<&str>) -> Result<ObjectListing>;
}

// ── SigV4 S3 client ─────────────────────────────────────────────

/// Path-style S3 client with hand-rolled AWS Signature Version 4.
pub struct S3Store {
    http: reqwest::Client,
    endpoint: String,
    host: String,
    bucket: String,
    region: String,
    access_key: String,
    secret_key: String,
}

impl S3Store {
    pub fn new(settings: &Settings) -> Result<Self> {
        let endpoint = settings.s3_endpoint.trim_end_matches('/').to_string();
        let url = reqwest::Url::parse(&endpoint)
            .map_err(|e| SyncError::Network(format!("invalid S3 endpoint: {e}")))?;
        let host = match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            _ => return Err(SyncError::Network("S3 endpoint has no host".into())),
        };
        Ok(Self {
            http: reqwest::Client::new(),
            endpoint,
            host,
            bucket: settings.s3_bucket.clone(),
            region: settings.s3_region.clone(),
            access_key: settings.s3_access_key.clone(),
            secret_key: settings.s3_secret_key.clone(),
        })
    }

    /// Percent-encode one path segment per the SigV4 canonicalization
    /// rules (everything but unreserved characters).
    fn encode_segment(segment: &str) -> String {
        urlencoding::encode(segment).into_owned()
    }

    /// Canonical URI for a key inside the bucket, used both in the signed
    /// canonical request and as the literal request path.
    fn canonical_uri(&self, key: Option<&str>) -> String {
        let mut uri = format!("/{}", Self::encode_segment(&self.bucket));
        if let Some(key) = key {
            for segment in key.split('/') {
                uri.push('/');
                uri.push_str(&Self::encode_segment(segment));
            }
        }
        uri
    }

    fn signing_key(&self, date: &str) -> Vec<u8> {
        let mut key = format!("AWS4{}", self.secret_key).into_bytes();
        for part in [date, self.region.as_str(), "s3", "aws4_request"] {
            let mut mac = HmacSha256::new_from_slice(&key).expect("any key length");
            mac.update(part.as_bytes());
            key = mac.finalize().into_bytes().to_vec();
        }
        key
    }

    /// Sign and send one request. `query` must be pre-sorted by key.
    async fn send(
        &self,
        method: reqwest::Method,
        uri: &str,
        query: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let payload_hash = hex::encode(Sha256::digest(&body));

        let canonical_query = query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
            self.host, payload_hash, amz_date
        );
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            uri,
            canonical_query,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let scope = format!("{}/{}/s3/aws4_request", date, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let mut mac = HmacSha256::new_from_slice(&self.signing_key(&date)).expect("any key length");
        mac.update(string_to_sign.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, scope, signed_headers, signature
        );

        let mut url = format!("{}{}", self.endpoint, uri);
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query);
        }

        let response = self
            .http
            .request(method, url)
            .header("host", &self.host)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .header("authorization", authorization)
            .body(body)
            .send()
            .await?;
        Ok(response)
    }

    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<&str>,
    ) -> Result<ListPage> {
        // Canonical query requires the parameters in sorted key order.
        let mut query: Vec<(String, String)> = Vec::new();
        if let Some(token) = continuation {
            query.push(("continuation-token".into(), token.into()));
        }
        if let Some(d) = delimiter {
            query.push(("delimiter".into(), d.into()));
        }
        query.push(("list-type".into(), "2".into()));
        query.push(("prefix".into(), prefix.into()));

        let uri = self.canonical_uri(None);
        let response = self
            .send(reqwest::Method::GET, &uri, &query, Vec::new())
            .await?;
        if !response.status().is_success() {
            return Err(SyncError::Network(format!(
                "list failed with status {}",
                response.status()
            )));
        }
        let body = response.bytes().await?;
        parse_list_response(&body)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn ensure_bucket(&self) -> Result<()> {
        let uri = self.canonical_uri(None);
        let head = self
            .send(reqwest::Method::HEAD, &uri, &[], Vec::new())
            .await?;
        if head.status().is_success() {
            return Ok(());
        }

        let body = if self.region == "us-east-1" {
            Vec::new()
        } else {
            format!(
                "<CreateBucketConfiguration><LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
                self.region
            )
            .into_bytes()
        };
        let created = self.send(reqwest::Method::PUT, &uri, &[], body).await?;
        // Another device may have raced us; both outcomes are fine.
        if created.status().is_success() || created.status().as_u16() == 409 {
            tracing::info!(bucket = %self.bucket, "Sync bucket ready");
            Ok(())
        } else {
            Err(SyncError::Network(format!(
                "create bucket failed with status {}",
                created.status()
            )))
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        let uri = self.canonical_uri(Some(key));
        let response = self.send(reqwest::Method::PUT, &uri, &[], body).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(SyncError::Network(format!(
                "put {key} failed with status {}",
                response.status()
            )))
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let uri = self.canonical_uri(Some(key));
        let response = self
            .send(reqwest::Method::GET, &uri, &[], Vec::new())
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SyncError::Network(format!(
                "get {key} failed with status {}",
                response.status()
            )));
        }
        Ok(Some(response.bytes().await?.to_vec()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let uri = self.canonical_uri(Some(key));
        let response = self
            .send(reqwest::Method::HEAD, &uri, &[], Vec::new())
            .await?;
        if response.status().is_success() {
            Ok(true)
        } else if response.status().as_u16() == 404 {
            Ok(false)
        } else {
            Err(SyncError::Network(format!(
                "head {key} failed with status {}",
                response.status()
            )))
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let uri = self.canonical_uri(Some(key));
        let response = self
            .send(reqwest::Method::DELETE, &uri, &[], Vec::new())
            .await?;
        if response.status().is_success() || response.status().as_u16() == 404 {
            Ok(())
        } else {
            Err(SyncError::Network(format!(
                "delete {key} failed with status {}",
                response.status()
            )))
        }
    }

    async fn list(&self, prefix: &str, delimiter: Option<&str>) -> Result<ObjectListing> {
        let mut listing = ObjectListing::default();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .list_page(prefix, delimiter, continuation.as_deref())
                .await?;
            listing.keys.extend(page.keys);
            listing.common_prefixes.extend(page.common_prefixes);
            match page.next_token {
                Some(token) if page.truncated => continuation = Some(token),
                _ => break,
            }
        }
        listing.common_prefixes.dedup();
        Ok(listing)
    }
}

// ── ListObjectsV2 XML ───────────────────────────────────────────

struct ListPage {
    keys: Vec<String>,
    common_prefixes: Vec<String>,
    next_token: Option<String>,
    truncated: bool,
}

fn parse_list_response(xml: &[u8]) -> Result<ListPage> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut page = ListPage {
        keys: Vec::new(),
        common_prefixes: Vec::new(),
        next_token: None,
        truncated: false,
    };
    let mut stack: Vec<String> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                stack.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| SyncError::Network(format!("bad list XML: {e}")))?
                    .into_owned();
                let current = stack.last().map(String::as_str);
                let parent = stack.len().checked_sub(2).map(|i| stack[i].as_str());
                match (parent, current) {
                    (Some("Contents"), Some("Key")) => page.keys.push(text),
                    (Some("CommonPrefixes"), Some("Prefix")) => page.common_prefixes.push(text),
                    (_, Some("NextContinuationToken")) => page.next_token = Some(text),
                    (_, Some("IsTruncated")) => page.truncated = text == "true",
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(SyncError::Network(format!("bad list XML: {e}"))),
        }
        buf.clear();
    }
    Ok(page)
}

// ── In-memory store (tests, offline development) ────────────────

/// Shared in-memory object store. Two [`CloudClient`]s over one
/// `MemoryStore` emulate two devices sharing a bucket.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    put_count: Mutex<BTreeMap<String, usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `key` was PUT (dedup assertions in tests).
    pub fn put_count(&self, key: &str) -> usize {
        self.put_count.lock().get(key).copied().unwrap_or(0)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn ensure_bucket(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.objects.lock().insert(key.to_string(), body);
        *self.put_count.lock().entry(key.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.lock().get(key).cloned())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str, delimiter: Option<&str>) -> Result<ObjectListing> {
        let objects = self.objects.lock();
        let mut listing = ObjectListing::default();
        for key in objects.keys() {
            if !key.starts_with(prefix) {
                continue;
            }
            match delimiter {
                Some(d) => {
                    let rest = &key[prefix.len()..];
                    if let Some(pos) = rest.find(d) {
                        let collapsed = format!("{}{}{}", prefix, &rest[..pos], d);
                        if listing.common_prefixes.last() != Some(&collapsed) {
                            listing.common_prefixes.push(collapsed);
                        }
                    } else {
                        listing.keys.push(key.clone());
                    }
                }
                None => listing.keys.push(key.clone()),
            }
        }
        Ok(listing)
    }
}

// ── CloudClient: the sync keyspace over any ObjectStore ─────────

#[derive(Clone)]
pub struct CloudClient {
    store: std::sync::Arc<dyn ObjectStore>,
    user_id: String,
}

impl CloudClient {
    pub fn new(store: std::sync::Arc<dyn ObjectStore>, user_id: impl Into<String>) -> Self {
        Self {
            store,
            user_id: user_id.into(),
        }
    }

    fn key(&self, parts: &[&str]) -> String {
        let mut key = self.user_id.clone();
        for part in parts {
            key.push('/');
            key.push_str(part);
        }
        key
    }

    pub async fn ensure_bucket(&self) -> Result<()> {
        self.store.ensure_bucket().await
    }

    // ── Changelog batches ───────────────────────────────────────

    pub async fn upload_changelog_batch(
        &self,
        device_id: &str,
        batch_id: &str,
        data: Vec<u8>,
    ) -> Result<()> {
        let key = self.key(&["changelog", device_id, &format!("{batch_id}.enc")]);
        self.store.put(&key, data).await?;
        tracing::debug!(device_id, batch_id, "Uploaded changelog batch");
        Ok(())
    }

    /// Batch IDs for a device, lexicographically sorted. Because batch IDs
    /// begin with the zero-padded HLC of their last entry, this order is
    /// the HLC order.
    pub async fn list_changelog_batches(&self, device_id: &str) -> Result<Vec<String>> {
        let prefix = self.key(&["changelog", device_id]) + "/";
        let listing = self.store.list(&prefix, None).await?;
        let mut batches: Vec<String> = listing
            .keys
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .map(|name| name.trim_end_matches(".enc").to_string())
            .collect();
        batches.sort_unstable();
        Ok(batches)
    }

    pub async fn download_changelog_batch(
        &self,
        device_id: &str,
        batch_id: &str,
    ) -> Result<Vec<u8>> {
        let key = self.key(&["changelog", device_id, &format!("{batch_id}.enc")]);
        self.store
            .get(&key)
            .await?
            .ok_or_else(|| SyncError::Network(format!("missing changelog batch {key}")))
    }

    // ── Content-addressed files ─────────────────────────────────

    /// Upload a file under its content hash. Returns `false` when the
    /// object already existed (deduplicated), `true` when uploaded.
    pub async fn upload_file(&self, content_hash: &str, data: Vec<u8>) -> Result<bool> {
        let key = self.key(&["files", &format!("{content_hash}.enc")]);
        if self.store.exists(&key).await? {
            tracing::debug!(content_hash, "File already in object store, skipping upload");
            return Ok(false);
        }
        self.store.put(&key, data).await?;
        tracing::debug!(content_hash, "Uploaded file");
        Ok(true)
    }

    pub async fn download_file(&self, content_hash: &str) -> Result<Option<Vec<u8>>> {
        let key = self.key(&["files", &format!("{content_hash}.enc")]);
        self.store.get(&key).await
    }

    pub async fn file_exists(&self, content_hash: &str) -> Result<bool> {
        let key = self.key(&["files", &format!("{content_hash}.enc")]);
        self.store.exists(&key).await
    }

    // ── Aggregate manifest ──────────────────────────────────────

    pub async fn upload_manifest(&self, data: Vec<u8>) -> Result<()> {
        self.store.put(&self.key(&["manifest.enc"]), data).await
    }

    pub async fn download_manifest(&self) -> Result<Option<Vec<u8>>> {
        self.store.get(&self.key(&["manifest.enc"])).await
    }

    // ── Device discovery / removal ──────────────────────────────

    /// Device IDs that have pushed at least one changelog batch.
    pub async fn list_devices(&self) -> Result<Vec<String>> {
        let prefix = self.key(&["changelog"]) + "/";
        let listing = self.store.list(&prefix, Some("/")).await?;
        let mut devices: Vec<String> = listing
            .common_prefixes
            .iter()
            .filter_map(|p| {
                p.trim_end_matches('/')
                    .rsplit('/')
                    .next()
                    .map(str::to_string)
            })
            .collect();
        devices.sort_unstable();
        devices.dedup();
        Ok(devices)
    }

    /// Delete every changelog batch a device has pushed. Returns the
    /// number of objects removed.
    pub async fn delete_device_data(&self, device_id: &str) -> Result<usize> {
        let prefix = self.key(&["changelog", device_id]) + "/";
        let listing = self.store.list(&prefix, None).await?;
        let mut deleted = 0;
        for key in &listing.keys {
            self.store.delete(key).await?;
            deleted += 1;
        }
        tracing::info!(device_id, deleted, "Deleted device data from object store");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn s3_settings(endpoint: &str) -> Settings {
        Settings {
            s3_endpoint: endpoint.to_string(),
            s3_bucket: "lime-sync".into(),
            s3_region: "us-east-1".into(),
            s3_access_key: "AKIDEXAMPLE".into(),
            s3_secret_key: "secret".into(),
            ..Settings::default()
        }
    }

    // ── MemoryStore + CloudClient ───────────────────────────────

    #[tokio::test]
    async fn changelog_batch_roundtrip() {
        let store = Arc::new(MemoryStore::new());
        let cloud = CloudClient::new(store, "user-1");

        cloud
            .upload_changelog_batch("dev-a", "0000000001000:0000:dev-a_abc12345", b"x".to_vec())
            .await
            .unwrap();
        cloud
            .upload_changelog_batch("dev-a", "0000000000900:0000:dev-a_def67890", b"y".to_vec())
            .await
            .unwrap();

        let batches = cloud.list_changelog_batches("dev-a").await.unwrap();
        assert_eq!(batches.len(), 2);
        // Sorted by HLC prefix.
        assert!(batches[0].starts_with("0000000000900"));
        assert!(batches[1].starts_with("0000000001000"));

        let data = cloud
            .download_changelog_batch("dev-a", &batches[1])
            .await
            .unwrap();
        assert_eq!(data, b"x");
    }

    #[tokio::test]
    async fn missing_batch_is_an_error() {
        let cloud = CloudClient::new(Arc::new(MemoryStore::new()), "user-1");
        assert!(matches!(
            cloud.download_changelog_batch("dev-a", "nope").await,
            Err(SyncError::Network(_))
        ));
    }

    #[tokio::test]
    async fn file_upload_deduplicates() {
        let store = Arc::new(MemoryStore::new());
        let cloud = CloudClient::new(Arc::clone(&store) as Arc<dyn ObjectStore>, "user-1");

        assert!(cloud.upload_file("aabb", b"enc".to_vec()).await.unwrap());
        // Identical content from a second meeting: HEAD short-circuits.
        assert!(!cloud.upload_file("aabb", b"enc".to_vec()).await.unwrap());

        assert_eq!(store.put_count("user-1/files/aabb.enc"), 1);
        assert!(cloud.file_exists("aabb").await.unwrap());
        assert_eq!(
            cloud.download_file("aabb").await.unwrap().unwrap(),
            b"enc"
        );
        assert!(cloud.download_file("ffff").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_devices_from_common_prefixes() {
        let store = Arc::new(MemoryStore::new());
        let cloud = CloudClient::new(store, "user-1");

        cloud
            .upload_changelog_batch("dev-b", "b1", b"1".to_vec())
            .await
            .unwrap();
        cloud
            .upload_changelog_batch("dev-a", "a1", b"1".to_vec())
            .await
            .unwrap();
        cloud
            .upload_changelog_batch("dev-a", "a2", b"2".to_vec())
            .await
            .unwrap();

        let devices = cloud.list_devices().await.unwrap();
        assert_eq!(devices, vec!["dev-a".to_string(), "dev-b".to_string()]);
    }

    #[tokio::test]
    async fn delete_device_data_removes_batches_only() {
        let store = Arc::new(MemoryStore::new());
        let cloud = CloudClient::new(Arc::clone(&store) as Arc<dyn ObjectStore>, "user-1");

        cloud
            .upload_changelog_batch("dev-a", "a1", b"1".to_vec())
            .await
            .unwrap();
        cloud
            .upload_changelog_batch("dev-b", "b1", b"1".to_vec())
            .await
            .unwrap();
        cloud.upload_file("hash", b"f".to_vec()).await.unwrap();

        let deleted = cloud.delete_device_data("dev-a").await.unwrap();
        assert_eq!(deleted, 1);
        assert!(cloud.list_changelog_batches("dev-a").await.unwrap().is_empty());
        assert_eq!(cloud.list_changelog_batches("dev-b").await.unwrap().len(), 1);
        assert!(cloud.file_exists("hash").await.unwrap());
    }

    #[tokio::test]
    async fn manifest_roundtrip() {
        let cloud = CloudClient::new(Arc::new(MemoryStore::new()), "user-1");
        assert!(cloud.download_manifest().await.unwrap().is_none());
        cloud.upload_manifest(b"manifest".to_vec()).await.unwrap();
        assert_eq!(
            cloud.download_manifest().await.unwrap().unwrap(),
            b"manifest"
        );
    }

    #[tokio::test]
    async fn users_are_namespaced() {
        let store = Arc::new(MemoryStore::new());
        let alice = CloudClient::new(Arc::clone(&store) as Arc<dyn ObjectStore>, "alice");
        let bob = CloudClient::new(Arc::clone(&store) as Arc<dyn ObjectStore>, "bob");

        alice.upload_file("h1", b"a".to_vec()).await.unwrap();
        assert!(!bob.file_exists("h1").await.unwrap());
    }

    // ── S3Store against a mock server ───────────────────────────

    #[tokio::test]
    async fn s3_get_and_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/lime-sync/user-1/manifest.enc"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"cipher".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/lime-sync/user-1/missing.enc"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = S3Store::new(&s3_settings(&server.uri())).unwrap();
        assert_eq!(
            store.get("user-1/manifest.enc").await.unwrap().unwrap(),
            b"cipher"
        );
        assert!(store.get("user-1/missing.enc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn s3_put_sends_signed_request() {
        use wiremock::matchers::header_exists;

        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/lime-sync/user-1/files/abc.enc"))
            .and(header_exists("authorization"))
            .and(header_exists("x-amz-date"))
            .and(header_exists("x-amz-content-sha256"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = S3Store::new(&s3_settings(&server.uri())).unwrap();
        store
            .put("user-1/files/abc.enc", b"data".to_vec())
            .await
            .unwrap();
        // Mock expectations (signed headers present, exactly one PUT) are
        // verified when the server drops.
    }

    #[tokio::test]
    async fn s3_head_maps_status() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/lime-sync/present"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/lime-sync/absent"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = S3Store::new(&s3_settings(&server.uri())).unwrap();
        assert!(store.exists("present").await.unwrap());
        assert!(!store.exists("absent").await.unwrap());
    }

    #[tokio::test]
    async fn s3_list_parses_keys_and_prefixes() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
    <Name>lime-sync</Name>
    <Prefix>user-1/changelog/</Prefix>
    <IsTruncated>false</IsTruncated>
    <Contents><Key>user-1/changelog/dev-a/b1.enc</Key></Contents>
    <Contents><Key>user-1/changelog/dev-a/b2.enc</Key></Contents>
    <CommonPrefixes><Prefix>user-1/changelog/dev-a/</Prefix></CommonPrefixes>
    <CommonPrefixes><Prefix>user-1/changelog/dev-b/</Prefix></CommonPrefixes>
</ListBucketResult>"#;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/lime-sync"))
            .and(query_param("list-type", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(xml.as_bytes().to_vec()))
            .mount(&server)
            .await;

        let store = S3Store::new(&s3_settings(&server.uri())).unwrap();
        let listing = store.list("user-1/changelog/", Some("/")).await.unwrap();
        assert_eq!(listing.keys.len(), 2);
        assert_eq!(listing.common_prefixes.len(), 2);
        assert!(listing.common_prefixes[0].ends_with("dev-a/"));
    }

    #[tokio::test]
    async fn s3_server_error_is_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/lime-sync/boom"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = S3Store::new(&s3_settings(&server.uri())).unwrap();
        assert!(matches!(
            store.get("boom").await,
            Err(SyncError::Network(_))
        ));
    }

    #[test]
    fn canonical_uri_encodes_segments() {
        let store = S3Store::new(&s3_settings("http://127.0.0.1:9000")).unwrap();
        let uri = store.canonical_uri(Some("user-1/changelog/dev/0000000001000:0000:dev_a.enc"));
        assert_eq!(
            uri,
            "/lime-sync/user-1/changelog/dev/0000000001000%3A0000%3Adev_a.enc"
        );
    }

    #[test]
    fn signing_is_deterministic_and_keyed() {
        let store_a = S3Store::new(&s3_settings("http://127.0.0.1:9000")).unwrap();
        let key1 = store_a.signing_key("20260801");
        let key2 = store_a.signing_key("20260801");
        assert_eq!(key1, key2);

        let mut other = s3_settings("http://127.0.0.1:9000");
        other.s3_secret_key = "different".into();
        let store_b = S3Store::new(&other).unwrap();
        assert_ne!(key1, store_b.signing_key("20260801"));
    }
}
