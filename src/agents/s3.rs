//! S3-compatible object store agent.
//!
//! The tree is `bucket` nodes under the root with object keys below them
//! (`bucket/dir/key`). Listing and bucket configuration go through a `BucketClient`; the
//! default client talks to the endpoint over HTTP with presigned requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::RwLock;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::presign::{self, Addressing, Credentials, SignOptions};
use super::{SharedTree, StorageAgent};
use crate::error::{AccessError, AccessResult};
use crate::policy::Action;
use crate::tree::{ResourceNode, ResourceTree};

pub const FLAVOR: &str = "s3";
pub const SEPARATOR: &str = "/";

/// Allow browser uploads and downloads from any origin with presigned URLs.
pub const PERMISSIVE_CORS: &str = "<CORSConfiguration><CORSRule>\
<AllowedOrigin>*</AllowedOrigin>\
<AllowedMethod>GET</AllowedMethod><AllowedMethod>PUT</AllowedMethod><AllowedMethod>HEAD</AllowedMethod>\
<AllowedHeader>*</AllowedHeader><ExposeHeader>ETag</ExposeHeader><MaxAgeSeconds>3000</MaxAgeSeconds>\
</CORSRule></CORSConfiguration>";

fn default_region() -> String { "us-east-1".to_string() }

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    pub endpoint_url: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    /// Address buckets as `bucket.host` instead of `host/bucket`.
    #[serde(default)]
    pub virtual_host: bool,
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint_url", &self.endpoint_url)
            .field("region", &self.region)
            .field("aws_access_key_id", &self.aws_access_key_id)
            .field("virtual_host", &self.virtual_host)
            .finish_non_exhaustive()
    }
}

impl S3Config {
    pub fn endpoint(&self) -> AccessResult<Url> {
        Url::parse(&self.endpoint_url)
            .map_err(|e| AccessError::InvalidConfig(format!("endpoint_url '{}': {}", self.endpoint_url, e)))
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            access_key_id: self.aws_access_key_id.clone(),
            secret_access_key: self.aws_secret_access_key.clone(),
            session_token: self.session_token.clone(),
        }
    }

    pub fn addressing(&self) -> Addressing {
        if self.virtual_host { Addressing::VirtualHost } else { Addressing::Path }
    }
}

/// The backend operations the agent needs besides signing.
pub trait BucketClient: Send + Sync {
    fn list_buckets(&self) -> AccessResult<Vec<String>>;
    /// Every object key in `bucket`, across all pages.
    fn list_keys(&self, bucket: &str) -> AccessResult<Vec<String>>;
    fn put_cors(&self, bucket: &str, cors_xml: &str) -> AccessResult<()>;
}

pub type Connector = Box<dyn Fn(&S3Config) -> AccessResult<Arc<dyn BucketClient>> + Send + Sync>;

// ---- wire types ----

#[derive(Debug, Deserialize)]
struct ListAllMyBucketsResult {
    #[serde(rename = "Buckets", default)]
    buckets: BucketList,
}

#[derive(Debug, Default, Deserialize)]
struct BucketList {
    #[serde(rename = "Bucket", default)]
    bucket: Vec<BucketEntry>,
}

#[derive(Debug, Deserialize)]
struct BucketEntry {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ListBucketResult {
    #[serde(rename = "Contents", default)]
    contents: Vec<Contents>,
    #[serde(rename = "IsTruncated", default)]
    is_truncated: bool,
    #[serde(rename = "NextContinuationToken")]
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Contents {
    #[serde(rename = "Key")]
    key: String,
}

#[derive(Debug, Deserialize)]
struct S3Error {
    #[serde(rename = "Code")]
    code: String,
    #[serde(rename = "Message", default)]
    message: String,
}

fn describe_failure(status: reqwest::StatusCode, body: &str) -> String {
    match quick_xml::de::from_str::<S3Error>(body) {
        Ok(err) => format!("{} {}: {}", status.as_u16(), err.code, err.message),
        Err(_) => format!("{} {}", status.as_u16(), body.chars().take(200).collect::<String>()),
    }
}

/// HTTP client for S3-compatible endpoints. Requests carry no headers beyond what the
/// operation needs; authentication is a short-lived presigned query string.
pub struct HttpBucketClient {
    http: reqwest::blocking::Client,
    endpoint: Url,
    credentials: Credentials,
    region: String,
    addressing: Addressing,
}

const INTERNAL_EXPIRES_SECS: u64 = 300;

impl HttpBucketClient {
    pub fn new(config: &S3Config) -> AccessResult<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(AccessError::backend)?;
        Ok(Self {
            http,
            endpoint: config.endpoint()?,
            credentials: config.credentials(),
            region: config.region.clone(),
            addressing: config.addressing(),
        })
    }

    fn signed(&self, method: &str, bucket: &str, query: Vec<(String, String)>) -> AccessResult<String> {
        let options = SignOptions {
            method: method.to_string(),
            bucket: bucket.to_string(),
            query,
            expires: INTERNAL_EXPIRES_SECS,
            region: self.region.clone(),
            addressing: self.addressing,
            ..Default::default()
        };
        presign::presign_url(&self.endpoint, &self.credentials, &options)
    }

    fn get_text(&self, url: &str) -> AccessResult<String> {
        let resp = self.http.get(url).send().map_err(AccessError::backend)?;
        let status = resp.status();
        let body = resp.text().map_err(AccessError::backend)?;
        if !status.is_success() {
            return Err(AccessError::BackendUnavailable(describe_failure(status, &body)));
        }
        Ok(body)
    }
}

impl BucketClient for HttpBucketClient {
    fn list_buckets(&self) -> AccessResult<Vec<String>> {
        let body = self.get_text(&self.signed("GET", "", Vec::new())?)?;
        let parsed: ListAllMyBucketsResult = quick_xml::de::from_str(&body).map_err(AccessError::backend)?;
        Ok(parsed.buckets.bucket.into_iter().map(|b| b.name).collect())
    }

    fn list_keys(&self, bucket: &str) -> AccessResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut query = vec![("list-type".to_string(), "2".to_string())];
            if let Some(t) = &token {
                query.push(("continuation-token".to_string(), t.clone()));
            }
            let body = self.get_text(&self.signed("GET", bucket, query)?)?;
            let page: ListBucketResult = quick_xml::de::from_str(&body).map_err(AccessError::backend)?;
            keys.extend(page.contents.into_iter().map(|c| c.key));
            match page.next_continuation_token {
                Some(next) if page.is_truncated => token = Some(next),
                _ => break,
            }
        }
        debug!(target: "dam::agents", "listed {} keys in bucket '{}'", keys.len(), bucket);
        Ok(keys)
    }

    fn put_cors(&self, bucket: &str, cors_xml: &str) -> AccessResult<()> {
        let url = self.signed("PUT", bucket, vec![("cors".to_string(), String::new())])?;
        let digest = md5::compute(cors_xml.as_bytes());
        let resp = self
            .http
            .put(url)
            .header("Content-MD5", STANDARD.encode(digest.0))
            .header("Content-Type", "application/xml")
            .body(cors_xml.to_string())
            .send()
            .map_err(AccessError::backend)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(AccessError::BackendUnavailable(describe_failure(status, &body)));
        }
        Ok(())
    }
}

pub struct S3Agent {
    config: S3Config,
    endpoint: Url,
    client: RwLock<Option<Arc<dyn BucketClient>>>,
    connector: Connector,
    tree: SharedTree,
    cors_applied: AtomicBool,
}

impl S3Agent {
    /// Connect over HTTP and list the endpoint.
    pub fn connect(config: S3Config) -> AccessResult<Self> {
        Self::with_connector(
            config,
            Box::new(|c: &S3Config| Ok(Arc::new(HttpBucketClient::new(c)?) as Arc<dyn BucketClient>)),
        )
    }

    /// Connect through `connector`, list the endpoint and apply the CORS rule to every bucket
    /// found. CORS failures are logged and otherwise ignored.
    pub fn with_connector(config: S3Config, connector: Connector) -> AccessResult<Self> {
        let endpoint = config.endpoint()?;
        let client = connector(&config)?;
        let agent = Self {
            config,
            endpoint,
            client: RwLock::new(Some(client)),
            connector,
            tree: SharedTree::new(ResourceTree::new(SEPARATOR)),
            cors_applied: AtomicBool::new(false),
        };
        agent.load_tree()?;
        agent.apply_cors_once();
        info!(target: "dam::agents", "s3 agent connected to {}", agent.endpoint);
        Ok(agent)
    }

    fn client(&self) -> AccessResult<Arc<dyn BucketClient>> {
        self.client
            .read()
            .clone()
            .ok_or_else(|| AccessError::BackendUnavailable(format!("s3 agent for {} is closed", self.endpoint)))
    }

    fn apply_cors_once(&self) {
        if self.cors_applied.swap(true, Ordering::SeqCst) { return; }
        let Ok(client) = self.client() else { return; };
        let tree = self.tree.get();
        // a bucket named like the root id has its keys directly under the root
        let mut buckets: Vec<&str> = Vec::new();
        for node in tree.children(tree.root()) {
            let bucket = node.id.split_once(SEPARATOR).map_or(node.id.as_str(), |(b, _)| b);
            if !buckets.contains(&bucket) { buckets.push(bucket); }
        }
        for bucket in buckets {
            if let Err(e) = client.put_cors(bucket, PERMISSIVE_CORS) {
                warn!(target: "dam::agents", "could not apply CORS to bucket '{}': {}", bucket, e);
            }
        }
    }
}

impl StorageAgent for S3Agent {
    fn flavor(&self) -> &'static str { FLAVOR }

    fn tree(&self) -> Arc<ResourceTree> { self.tree.get() }

    fn load_tree(&self) -> AccessResult<Arc<ResourceTree>> {
        let client = self.client()?;
        let mut tree = ResourceTree::new(SEPARATOR);
        for bucket in client.list_buckets()? {
            tree.insert_path(&bucket);
            for key in client.list_keys(&bucket)? {
                tree.insert_path(&format!("{}{}{}", bucket, SEPARATOR, key));
            }
        }
        debug!(target: "dam::agents", "s3 tree for {} has {} nodes", self.endpoint, tree.len());
        Ok(self.tree.replace(tree))
    }

    fn sign(&self, path: &str, action: Action, ttl: Duration) -> AccessResult<String> {
        self.client()?;
        let (bucket, key) = path.split_once(SEPARATOR).unwrap_or((path, ""));
        let method = match action {
            Action::Read => "GET",
            Action::Write => "PUT",
            other => return Err(AccessError::UnsupportedAction(other.to_string())),
        };
        if bucket.is_empty() || key.is_empty() {
            return Err(AccessError::InvalidPattern {
                pattern: path.to_string(),
                reason: "expected bucket/key".to_string(),
            });
        }
        let options = SignOptions {
            method: method.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            expires: ttl.as_secs(),
            region: self.config.region.clone(),
            addressing: self.config.addressing(),
            ..Default::default()
        };
        presign::presign_url(&self.endpoint, &self.config.credentials(), &options)
    }

    fn config(&self, include_secrets: bool) -> serde_json::Map<String, serde_json::Value> {
        let mut map = match serde_json::to_value(&self.config) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        if !include_secrets {
            map.remove("aws_secret_access_key");
            map.remove("session_token");
        }
        map
    }

    /// Objects only. Buckets and key prefixes are never signed for read.
    fn readable(&self, node: &ResourceNode) -> bool { node.is_leaf() && node.id.contains(SEPARATOR) }

    fn refresh_connection(&self) -> AccessResult<()> {
        let fresh = (self.connector)(&self.config)?;
        *self.client.write() = Some(fresh);
        info!(target: "dam::agents", "s3 connection to {} refreshed", self.endpoint);
        Ok(())
    }

    fn close(&self) {
        if self.client.write().take().is_some() {
            debug!(target: "dam::agents", "s3 agent for {} closed", self.endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct MemoryBuckets {
        objects: BTreeMap<String, Vec<String>>,
        cors: Mutex<Vec<String>>,
        fail_cors: bool,
    }

    impl BucketClient for MemoryBuckets {
        fn list_buckets(&self) -> AccessResult<Vec<String>> { Ok(self.objects.keys().cloned().collect()) }

        fn list_keys(&self, bucket: &str) -> AccessResult<Vec<String>> {
            Ok(self.objects.get(bucket).cloned().unwrap_or_default())
        }

        fn put_cors(&self, bucket: &str, _cors_xml: &str) -> AccessResult<()> {
            if self.fail_cors {
                return Err(AccessError::BackendUnavailable("AccessDenied".into()));
            }
            self.cors.lock().push(bucket.to_string());
            Ok(())
        }
    }

    fn config() -> S3Config {
        S3Config {
            endpoint_url: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            aws_access_key_id: "minio".into(),
            aws_secret_access_key: "minio-secret".into(),
            session_token: None,
            virtual_host: false,
        }
    }

    fn memory(objects: Vec<(&str, Vec<&str>)>, fail_cors: bool) -> Arc<MemoryBuckets> {
        Arc::new(MemoryBuckets {
            objects: objects
                .into_iter()
                .map(|(b, keys)| (b.to_string(), keys.into_iter().map(str::to_string).collect()))
                .collect(),
            cors: Mutex::new(Vec::new()),
            fail_cors,
        })
    }

    fn agent_over(client: Arc<MemoryBuckets>) -> S3Agent {
        let shared = client.clone();
        S3Agent::with_connector(config(), Box::new(move |_: &S3Config| Ok(shared.clone() as Arc<dyn BucketClient>))).unwrap()
    }

    #[test]
    fn tree_is_buckets_then_keys() {
        let agent = agent_over(memory(vec![("b", vec!["x", "y"]), ("c", vec!["dir/z"])], false));
        let tree = agent.tree();
        let ids: Vec<&str> = tree.ids().collect();
        assert_eq!(ids, vec!["b", "b/x", "b/y", "c", "c/dir", "c/dir/z"]);
    }

    #[test]
    fn empty_bucket_still_appears() {
        let agent = agent_over(memory(vec![("empty", vec![])], false));
        assert!(agent.tree().contains("empty"));
    }

    #[test]
    fn cors_is_applied_once_per_connect() {
        let client = memory(vec![("b", vec!["x"]), ("c", vec![])], false);
        let agent = agent_over(client.clone());
        agent.load_tree().unwrap();
        agent.apply_cors_once();
        assert_eq!(*client.cors.lock(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn cors_failure_does_not_fail_connect() {
        let agent = agent_over(memory(vec![("b", vec!["x"])], true));
        assert!(agent.tree().contains("b/x"));
    }

    #[test]
    fn read_issuance_aligns_urls_with_matches() {
        let agent = agent_over(memory(vec![("b", vec!["x", "y"]), ("c", vec!["z"])], false));
        let cred = agent.issue_access("b/.*", Action::Read, Duration::from_secs(600)).unwrap();
        assert_eq!(cred.resource_paths, vec!["b/x", "b/y"]);
        assert_eq!(cred.urls.len(), 2);
        assert!(cred.urls[0].starts_with("http://localhost:9000/b/x?"));
        assert!(cred.urls[1].starts_with("http://localhost:9000/b/y?"));
        assert!(cred.urls.iter().all(|u| u.contains("X-Amz-Expires=600")));
    }

    #[test]
    fn write_issuance_signs_a_put_for_the_literal_key() {
        let agent = agent_over(memory(vec![("b", vec![])], false));
        let cred = agent.issue_access("b/new file.bin", Action::Write, Duration::from_secs(3600)).unwrap();
        assert_eq!(cred.resource_paths, vec!["b/new file.bin"]);
        assert!(cred.urls[0].starts_with("http://localhost:9000/b/new%20file.bin?"));
        let read = agent.sign("b/new file.bin", Action::Read, Duration::from_secs(3600)).unwrap();
        assert_ne!(read, cred.urls[0]);
    }

    #[test]
    fn write_to_a_bare_bucket_is_rejected() {
        let agent = agent_over(memory(vec![("b", vec![])], false));
        assert!(matches!(
            agent.issue_access("b", Action::Write, Duration::from_secs(60)),
            Err(AccessError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn read_signs_objects_only() {
        let agent = agent_over(memory(vec![("b", vec!["x"]), ("c", vec!["dir/z"]), ("e", vec![])], false));
        let cred = agent.issue_access("[bce].*", Action::Read, Duration::from_secs(60)).unwrap();
        assert_eq!(cred.resource_paths, vec!["b/x", "c/dir/z"]);
        assert!(cred.urls[0].starts_with("http://localhost:9000/b/x?"));
        assert!(matches!(
            agent.issue_access("e|c/dir", Action::Read, Duration::from_secs(60)),
            Err(AccessError::NoMatch(_))
        ));
        assert!(matches!(
            agent.sign("b", Action::Read, Duration::from_secs(60)),
            Err(AccessError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn doubled_separators_in_keys_stay_distinct_objects() {
        let agent = agent_over(memory(vec![("b", vec!["dir//file", "dir/file"])], false));
        let cred = agent.issue_access("b/dir.*", Action::Read, Duration::from_secs(60)).unwrap();
        assert_eq!(cred.resource_paths, vec!["b/dir//file", "b/dir/file"]);
        assert!(cred.urls[0].starts_with("http://localhost:9000/b/dir//file?"));
        assert!(cred.urls[1].starts_with("http://localhost:9000/b/dir/file?"));
    }

    #[test]
    fn bucket_named_root_keeps_its_objects() {
        let client = memory(vec![("b", vec!["x"]), ("root", vec!["secret.txt"])], false);
        let agent = agent_over(client.clone());
        let cred = agent.issue_access("root/.*", Action::Read, Duration::from_secs(60)).unwrap();
        assert_eq!(cred.resource_paths, vec!["root/secret.txt"]);
        assert!(cred.urls[0].starts_with("http://localhost:9000/root/secret.txt?"));
        assert_eq!(*client.cors.lock(), vec!["b".to_string(), "root".to_string()]);
    }

    #[test]
    fn unmatched_read_is_no_match() {
        let agent = agent_over(memory(vec![("b", vec!["x"])], false));
        assert!(matches!(
            agent.issue_access("nothing/.*", Action::Read, Duration::from_secs(60)),
            Err(AccessError::NoMatch(_))
        ));
    }

    #[test]
    fn config_hides_secrets_unless_asked() {
        let agent = agent_over(memory(vec![], false));
        let public = agent.config(false);
        assert!(public.get("aws_secret_access_key").is_none());
        assert_eq!(public["aws_access_key_id"], "minio");
        let full = agent.config(true);
        assert_eq!(full["aws_secret_access_key"], "minio-secret");
        let back: S3Config = serde_json::from_value(serde_json::Value::Object(full)).unwrap();
        assert_eq!(back, config());
    }

    #[test]
    fn close_is_idempotent_and_refresh_reopens() {
        let agent = agent_over(memory(vec![("b", vec!["x"])], false));
        agent.close();
        agent.close();
        assert!(matches!(agent.load_tree(), Err(AccessError::BackendUnavailable(_))));
        assert!(matches!(agent.sign("b/x", Action::Read, Duration::from_secs(5)), Err(AccessError::BackendUnavailable(_))));
        // the cached tree survives a failed reload
        assert!(agent.tree().contains("b/x"));
        agent.refresh_connection().unwrap();
        assert!(agent.load_tree().is_ok());
        assert!(agent.sign("b/x", Action::Read, Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn list_result_parses_pages() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>b</Name><KeyCount>2</KeyCount><MaxKeys>1000</MaxKeys><IsTruncated>true</IsTruncated>
  <Contents><Key>x</Key><Size>3</Size></Contents>
  <Contents><Key>dir/y</Key><Size>4</Size></Contents>
  <NextContinuationToken>tok</NextContinuationToken>
</ListBucketResult>"#;
        let page: ListBucketResult = quick_xml::de::from_str(xml).unwrap();
        assert!(page.is_truncated);
        assert_eq!(page.next_continuation_token.as_deref(), Some("tok"));
        let keys: Vec<_> = page.contents.into_iter().map(|c| c.key).collect();
        assert_eq!(keys, vec!["x", "dir/y"]);
    }

    #[test]
    fn bucket_listing_and_error_bodies_parse() {
        let xml = r#"<ListAllMyBucketsResult><Owner><ID>o</ID></Owner><Buckets>
<Bucket><Name>one</Name><CreationDate>2024-01-01T00:00:00.000Z</CreationDate></Bucket>
<Bucket><Name>two</Name><CreationDate>2024-01-01T00:00:00.000Z</CreationDate></Bucket>
</Buckets></ListAllMyBucketsResult>"#;
        let parsed: ListAllMyBucketsResult = quick_xml::de::from_str(xml).unwrap();
        let names: Vec<_> = parsed.buckets.bucket.into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["one", "two"]);

        let err = "<Error><Code>AccessDenied</Code><Message>Access Denied</Message></Error>";
        let msg = describe_failure(reqwest::StatusCode::FORBIDDEN, err);
        assert_eq!(msg, "403 AccessDenied: Access Denied");
    }
}
