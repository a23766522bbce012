// API client module: a small blocking HTTP client for the AnyMotion API.
//
// `Transport` is the seam the rest of the crate talks to; `ApiClient` is the
// real implementation on top of `reqwest::blocking`. Every call made through
// it is authenticated with a bearer token that is fetched once per process
// from the client credentials.

use crate::credentials::Credentials;
use crate::error::{Error, Result, TransportError};
use crate::handle::{HandleKind, JobId};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::OnceCell;
use std::time::Duration;
use tracing::{debug, info};

/// Items requested per page when listing a collection.
pub const PAGE_SIZE: u32 = 1000;

/// Reply to registering an image or movie: the new id and where to PUT
/// the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRegistration {
    pub id: JobId,
    pub upload_url: String,
}

/// A downloaded artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Everything the pipeline needs from the service.
#[cfg_attr(test, mockall::automock)]
pub trait Transport {
    /// Registers a new image or movie and returns where to upload it.
    fn register_media(
        &self,
        kind: HandleKind,
        origin_key: &str,
        content_md5: &str,
    ) -> Result<MediaRegistration, TransportError>;

    /// Sends the media bytes to the upload URL from `register_media`.
    fn put_object(&self, upload_url: &str, body: Vec<u8>, content_md5: &str)
        -> Result<(), TransportError>;

    /// Starts a job in the `kind` collection and returns its id.
    fn create(&self, kind: HandleKind, body: Value) -> Result<JobId, TransportError>;

    fn get_one(&self, kind: HandleKind, id: JobId) -> Result<Value, TransportError>;

    /// All items of a collection, following pagination. `exec_status`
    /// filters by job status when given.
    fn get_list(
        &self,
        kind: HandleKind,
        exec_status: Option<String>,
    ) -> Result<Vec<Value>, TransportError>;

    fn fetch(&self, url: &str) -> Result<Artifact, TransportError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct CreatedResponse {
    id: JobId,
}

#[derive(Deserialize)]
struct Page {
    data: Vec<Value>,
    next: Option<String>,
}

/// Blocking client bound to one API root and one set of credentials.
pub struct ApiClient {
    client: Client,
    base_url: Url,
    api_url: Url,
    credentials: Credentials,
    token: OnceCell<String>,
}

impl ApiClient {
    /// Builds a client for `credentials.api_url`. The URL must point at an
    /// `anymotion` API path; a trailing slash is added when missing. No
    /// request is made until the first call.
    pub fn new(credentials: Credentials) -> Result<Self> {
        let (base_url, api_url) = split_api_url(&credentials.api_url)?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(ApiClient {
            client,
            base_url,
            api_url,
            credentials,
            token: OnceCell::new(),
        })
    }

    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    fn token(&self) -> Result<&str, TransportError> {
        if let Some(token) = self.token.get() {
            return Ok(token.as_str());
        }
        let url = join(&self.base_url, "v1/oauth/accesstokens")?;
        debug!(%url, "requesting access token");
        let request = TokenRequest {
            client_id: &self.credentials.client_id,
            client_secret: &self.credentials.client_secret,
            grant_type: "client_credentials",
        };
        let response = send(self.client.post(url).json(&request))?;
        let body: TokenResponse = decode(response)?;
        Ok(self.token.get_or_init(|| body.access_token).as_str())
    }

    fn authed(&self, builder: RequestBuilder) -> Result<RequestBuilder, TransportError> {
        let token = self.token()?;
        Ok(builder.header(AUTHORIZATION, format!("Bearer {token}")))
    }

    fn collection_url(&self, kind: HandleKind) -> Result<Url, TransportError> {
        join(&self.api_url, &format!("{}/", kind.endpoint()))
    }
}

impl Transport for ApiClient {
    fn register_media(
        &self,
        kind: HandleKind,
        origin_key: &str,
        content_md5: &str,
    ) -> Result<MediaRegistration, TransportError> {
        let url = self.collection_url(kind)?;
        let body = serde_json::json!({ "origin_key": origin_key, "content_md5": content_md5 });
        debug!(%url, origin_key, "registering media");
        let response = send(self.authed(self.client.post(url))?.json(&body))?;
        decode(response)
    }

    fn put_object(
        &self,
        upload_url: &str,
        body: Vec<u8>,
        content_md5: &str,
    ) -> Result<(), TransportError> {
        // Pre-signed URL: it carries its own authorisation.
        debug!(bytes = body.len(), "uploading media to storage");
        send(
            self.client
                .put(upload_url)
                .header("Content-MD5", content_md5)
                .body(body),
        )?;
        Ok(())
    }

    fn create(&self, kind: HandleKind, body: Value) -> Result<JobId, TransportError> {
        let url = self.collection_url(kind)?;
        info!(%url, "submitting job");
        let response = send(self.authed(self.client.post(url))?.json(&body))?;
        let created: CreatedResponse = decode(response)?;
        Ok(created.id)
    }

    fn get_one(&self, kind: HandleKind, id: JobId) -> Result<Value, TransportError> {
        let url = join(&self.api_url, &format!("{}/{}/", kind.endpoint(), id))?;
        debug!(%url, "fetching item");
        decode(send(self.authed(self.client.get(url))?)?)
    }

    fn get_list(
        &self,
        kind: HandleKind,
        exec_status: Option<String>,
    ) -> Result<Vec<Value>, TransportError> {
        let mut url = self.collection_url(kind)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("size", &PAGE_SIZE.to_string());
            if let Some(status) = &exec_status {
                query.append_pair("execStatus", status);
            }
        }

        let mut items = Vec::new();
        let mut next = Some(url);
        while let Some(url) = next.take() {
            debug!(%url, "fetching page");
            let page: Page = decode(send(self.authed(self.client.get(url))?)?)?;
            items.extend(page.data);
            next = match page.next {
                Some(link) if !link.is_empty() => Some(
                    Url::parse(&link).map_err(|e| TransportError::Decode(e.to_string()))?,
                ),
                _ => None,
            };
        }
        Ok(items)
    }

    fn fetch(&self, url: &str) -> Result<Artifact, TransportError> {
        // Artifact URLs are pre-signed storage links, so no bearer token.
        debug!("downloading artifact");
        let response = send(self.client.get(url))?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let bytes = response.bytes().map_err(classify)?.to_vec();
        Ok(Artifact {
            bytes,
            content_type,
        })
    }
}

/// Splits an API URL into the server root (used for authentication) and the
/// normalised API root.
fn split_api_url(raw: &str) -> Result<(Url, Url)> {
    let mut api_url = Url::parse(raw).map_err(|_| Error::InvalidApiUrl(raw.to_string()))?;
    if !api_url.path().contains("anymotion") {
        return Err(Error::InvalidApiUrl(raw.to_string()));
    }
    if !api_url.path().ends_with('/') {
        let path = format!("{}/", api_url.path());
        api_url.set_path(&path);
    }
    let base_url = api_url
        .join("/")
        .map_err(|_| Error::InvalidApiUrl(raw.to_string()))?;
    Ok((base_url, api_url))
}

fn join(base: &Url, path: &str) -> Result<Url, TransportError> {
    base.join(path)
        .map_err(|e| TransportError::Decode(format!("bad URL {path:?}: {e}")))
}

fn send(builder: RequestBuilder) -> Result<Response, TransportError> {
    let response = builder.send().map_err(classify)?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().unwrap_or_default();
    Err(status_error(status, text))
}

fn status_error(status: StatusCode, text: String) -> TransportError {
    // The service wraps messages as {"message": "..."}; fall back to the raw body.
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
        .unwrap_or(text);
    TransportError::Status {
        status: status.as_u16(),
        message,
    }
}

fn decode<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, TransportError> {
    response
        .json()
        .map_err(|e| TransportError::Decode(e.to_string()))
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        TransportError::Transient(e.to_string())
    } else {
        TransportError::Decode(e.to_string())
    }
}
