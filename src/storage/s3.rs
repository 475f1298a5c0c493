use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::debug;

use super::{ObjectInfo, ObjectStore};
use crate::config::StorageSettings;
use crate::error::StorageError;

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "s3";
const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// S3-compatible client (MinIO, AWS) using path-style URLs and SigV4 signing
#[derive(Debug, Clone)]
pub struct S3Client {
    client: Client,
    endpoint: Url,
    host: String,
    bucket: String,
    region: String,
    access_key: String,
    secret_key: String,
}

impl S3Client {
    pub fn new(settings: &StorageSettings) -> Result<Self, StorageError> {
        let endpoint = Url::parse(settings.endpoint.trim_end_matches('/'))
            .map_err(|e| StorageError::Endpoint(format!("{}: {}", settings.endpoint, e)))?;
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(StorageError::Endpoint(format!("{} has no host", settings.endpoint))),
        };

        Ok(Self {
            client: Client::new(),
            endpoint,
            host,
            bucket: settings.bucket.clone(),
            region: settings.region.clone(),
            access_key: settings.access_key.clone(),
            secret_key: settings.secret_key.clone(),
        })
    }

    fn object_uri(&self, key: &str) -> String {
        let encoded: Vec<String> = key.split('/').map(|seg| urlencoding::encode(seg).into_owned()).collect();
        format!("/{}/{}", self.bucket, encoded.join("/"))
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        query: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<reqwest::Response, StorageError> {
        let payload_hash = hex::encode(Sha256::digest(&body));
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), self.host.clone());
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
        headers.insert("x-amz-date".to_string(), amz_date.clone());

        let request = SigningRequest {
            method: method.as_str(),
            uri,
            query,
            headers: &headers,
            payload_hash: &payload_hash,
        };
        let authorization = self.authorization(&request, now);

        let mut url = format!("{}{}", self.endpoint.as_str().trim_end_matches('/'), uri);
        let query_string = canonical_query(query);
        if !query_string.is_empty() {
            url = format!("{}?{}", url, query_string);
        }
        debug!("{} {}", method, url);

        let response = self
            .client
            .request(method, &url)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date)
            .header("authorization", authorization)
            .body(body)
            .send()
            .await?;
        Ok(response)
    }

    fn authorization(&self, request: &SigningRequest<'_>, now: DateTime<Utc>) -> String {
        let date = now.format("%Y%m%d").to_string();
        let scope = format!("{}/{}/{}/aws4_request", date, self.region, SERVICE);
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            now.format("%Y%m%dT%H%M%SZ"),
            scope,
            hex::encode(Sha256::digest(request.canonical().as_bytes()))
        );

        let signing_key = signing_key(&self.secret_key, &date, &self.region);
        let signature = hex::encode(hmac(&signing_key, &string_to_sign));

        format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM,
            self.access_key,
            scope,
            request.signed_headers(),
            signature
        )
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<ObjectInfo>, StorageError> {
        let uri = format!("/{}", self.bucket);
        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("prefix".to_string(), prefix.to_string()),
            ];
            if !recursive {
                query.push(("delimiter".to_string(), "/".to_string()));
            }
            if let Some(token) = &continuation {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let response = self.send(Method::GET, &uri, &query, Vec::new()).await?;
            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(StorageError::Status { key: prefix.to_string(), status: status.as_u16(), body });
            }

            let page = parse_listing(&body)?;
            entries.extend(page.entries);
            match page.next_token {
                Some(token) if page.truncated => continuation = Some(token),
                _ => break,
            }
        }

        debug!("Listed {} entries under '{}'", entries.len(), prefix);
        Ok(entries)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.send(Method::GET, &self.object_uri(key), &[], Vec::new()).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(key.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Status { key: key.to_string(), status: status.as_u16(), body });
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), StorageError> {
        let response = self.send(Method::PUT, &self.object_uri(key), &[], body).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Status { key: key.to_string(), status: status.as_u16(), body });
        }
        Ok(())
    }
}

/// The parts of a request covered by the signature
struct SigningRequest<'a> {
    method: &'a str,
    uri: &'a str,
    query: &'a [(String, String)],
    /// Lowercase header names
    headers: &'a BTreeMap<String, String>,
    payload_hash: &'a str,
}

impl SigningRequest<'_> {
    fn signed_headers(&self) -> String {
        self.headers.keys().cloned().collect::<Vec<_>>().join(";")
    }

    fn canonical(&self) -> String {
        let headers: String = self
            .headers
            .iter()
            .map(|(name, value)| format!("{}:{}\n", name, value.trim()))
            .collect();
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            self.method,
            self.uri,
            canonical_query(self.query),
            headers,
            self.signed_headers(),
            self.payload_hash
        )
    }
}

/// Query parameters URI-encoded and sorted by name
fn canonical_query(query: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (urlencoding::encode(k).into_owned(), urlencoding::encode(v).into_owned()))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn hmac(key: &[u8], data: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn signing_key(secret: &str, date: &str, region: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{}", secret).as_bytes(), date);
    let k_region = hmac(&k_date, region);
    let k_service = hmac(&k_region, SERVICE);
    hmac(&k_service, "aws4_request")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    next_continuation_token: Option<String>,
    #[serde(default)]
    contents: Vec<ListedObject>,
    #[serde(default)]
    common_prefixes: Vec<ListedPrefix>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedObject {
    key: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedPrefix {
    prefix: String,
}

struct ListingPage {
    entries: Vec<ObjectInfo>,
    truncated: bool,
    next_token: Option<String>,
}

fn parse_listing(xml: &str) -> Result<ListingPage, StorageError> {
    let result: ListBucketResult =
        quick_xml::de::from_str(xml).map_err(|e| StorageError::Listing(e.to_string()))?;

    let mut entries: Vec<ObjectInfo> = result
        .contents
        .into_iter()
        .map(|o| ObjectInfo::object(o.key, o.size))
        .collect();
    entries.extend(result.common_prefixes.into_iter().map(|p| ObjectInfo::prefix(p.prefix)));

    Ok(ListingPage {
        entries,
        truncated: result.is_truncated,
        next_token: result.next_continuation_token,
    })
}
