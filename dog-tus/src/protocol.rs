//! tus 1.0 wire format: request construction, response parsing and
//! `Upload-Metadata` encoding. Nothing in here performs I/O.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use url::Url;

use crate::{StringMap, TusConfig, TusError, TusResult, UploadRecord};

/// Header names used by the protocol
pub mod headers {
    pub const TUS_RESUMABLE: &str = "Tus-Resumable";
    pub const TUS_VERSION: &str = "Tus-Version";
    pub const TUS_EXTENSION: &str = "Tus-Extension";
    pub const TUS_MAX_SIZE: &str = "Tus-Max-Size";
    pub const TUS_CHECKSUM_ALGORITHM: &str = "Tus-Checksum-Algorithm";
    pub const UPLOAD_LENGTH: &str = "Upload-Length";
    pub const UPLOAD_OFFSET: &str = "Upload-Offset";
    pub const UPLOAD_METADATA: &str = "Upload-Metadata";
    pub const LOCATION: &str = "Location";
    pub const CONTENT_TYPE: &str = "Content-Type";
}

/// Content type of every PATCH body
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// HTTP methods the protocol uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Post,
    Head,
    Patch,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Head => "HEAD",
            Self::Patch => "PATCH",
            Self::Options => "OPTIONS",
        }
    }
}

/// A transport-agnostic HTTP request
#[derive(Debug, Clone)]
pub struct TusRequest {
    pub method: Method,
    pub url: String,
    pub headers: StringMap,
    pub body: Option<Bytes>,
}

impl TusRequest {
    fn new(method: Method, url: String, config: &TusConfig, custom: &StringMap) -> Self {
        let mut headers = config.default_headers.clone();
        headers.extend(custom.iter().map(|(k, v)| (k.clone(), v.clone())));
        headers.insert(headers::TUS_RESUMABLE.to_string(), config.tus_version.clone());
        Self {
            method,
            url,
            headers,
            body: None,
        }
    }

    fn header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Look up a header ignoring case
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_len(&self) -> u64 {
        self.body.as_ref().map_or(0, |b| b.len() as u64)
    }
}

/// A transport-agnostic HTTP response; header names are stored lowercased
#[derive(Debug, Clone, Default)]
pub struct TusResponse {
    pub status: u16,
    headers: BTreeMap<String, String>,
}

impl TusResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header<K: AsRef<str>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.insert_header(key, value);
        self
    }

    pub fn insert_header<K: AsRef<str>, V: Into<String>>(&mut self, key: K, value: V) {
        self.headers.insert(key.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `Upload-Offset`, if present and numeric
    pub fn offset(&self) -> TusResult<u64> {
        parse_u64(self, headers::UPLOAD_OFFSET)?
            .ok_or_else(|| TusError::malformed("missing Upload-Offset header"))
    }

    /// `Upload-Length`, if the server sent one
    pub fn length(&self) -> TusResult<Option<u64>> {
        parse_u64(self, headers::UPLOAD_LENGTH)
    }

    pub fn location(&self) -> Option<&str> {
        self.header(headers::LOCATION)
    }
}

fn parse_u64(response: &TusResponse, name: &str) -> TusResult<Option<u64>> {
    match response.header(name) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| TusError::malformed(format!("invalid {} header: {}", name, value))),
        None => Ok(None),
    }
}

/// Encode metadata as `key base64(value)` pairs separated by commas
pub fn encode_metadata(metadata: &StringMap) -> Option<String> {
    if metadata.is_empty() {
        return None;
    }
    let pairs: Vec<String> = metadata
        .iter()
        .map(|(key, value)| {
            if value.is_empty() {
                key.clone()
            } else {
                format!("{} {}", key, STANDARD.encode(value.as_bytes()))
            }
        })
        .collect();
    Some(pairs.join(","))
}

/// Parse an `Upload-Metadata` header value
pub fn decode_metadata(header: &str) -> TusResult<StringMap> {
    let mut metadata = StringMap::new();
    for pair in header.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let mut parts = pair.splitn(2, ' ');
        let key = parts.next().unwrap_or_default().to_string();
        let value = match parts.next() {
            Some(encoded) => {
                let raw = STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| TusError::malformed(format!("metadata value for {}: {}", key, e)))?;
                String::from_utf8(raw)
                    .map_err(|e| TusError::malformed(format!("metadata value for {}: {}", key, e)))?
            }
            None => String::new(),
        };
        metadata.insert(key, value);
    }
    Ok(metadata)
}

/// `POST <endpoint>` announcing the length and metadata of a new upload
pub fn creation_request(config: &TusConfig, record: &UploadRecord) -> TusRequest {
    let mut request = TusRequest::new(Method::Post, config.endpoint.clone(), config, &record.headers)
        .header(headers::UPLOAD_LENGTH, record.length.to_string());
    if let Some(encoded) = encode_metadata(&record.metadata) {
        request = request.header(headers::UPLOAD_METADATA, encoded);
    }
    request
}

/// `HEAD <upload url>` asking for the server's offset
pub fn offset_request(config: &TusConfig, record: &UploadRecord, url: &str) -> TusRequest {
    TusRequest::new(Method::Head, url.to_string(), config, &record.headers)
}

/// `PATCH <upload url>` carrying one chunk at `offset`
pub fn chunk_request(
    config: &TusConfig,
    record: &UploadRecord,
    url: &str,
    offset: u64,
    chunk: Bytes,
) -> TusRequest {
    let mut request = TusRequest::new(Method::Patch, url.to_string(), config, &record.headers)
        .header(headers::UPLOAD_OFFSET, offset.to_string())
        .header(headers::CONTENT_TYPE, OFFSET_OCTET_STREAM);
    request.body = Some(chunk);
    request
}

/// `OPTIONS <endpoint>` for capability discovery
pub fn options_request(config: &TusConfig) -> TusRequest {
    TusRequest::new(Method::Options, config.endpoint.clone(), config, &StringMap::new())
}

/// Resolve a `Location` header against the creation endpoint
pub fn resolve_location(endpoint: &str, location: &str) -> TusResult<String> {
    let base = Url::parse(endpoint)?;
    let resolved = base
        .join(location)
        .map_err(|e| TusError::malformed(format!("invalid Location {}: {}", location, e)))?;
    Ok(resolved.to_string())
}

/// Map a non-2xx status to the error the state machine acts on
pub fn status_error(status: u16, url: &str) -> TusError {
    match status {
        404 | 410 => TusError::RemoteNotFound { url: url.to_string() },
        408 | 429 | 500..=599 => TusError::transport_status(format!("server returned {}", status), status),
        _ => TusError::Rejected { status },
    }
}

/// Capabilities a server advertises in response to `OPTIONS`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    pub version: String,
    pub supported_versions: Vec<String>,
    pub extensions: Vec<String>,
    pub max_size: Option<u64>,
    pub checksum_algorithms: Vec<String>,
}

impl ServerInfo {
    pub fn from_response(response: &TusResponse) -> TusResult<Self> {
        if response.status != 200 && response.status != 204 {
            return Err(status_error(response.status, "OPTIONS"));
        }

        let list = |name: &str| -> Vec<String> {
            response
                .header(name)
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(Self {
            version: response.header(headers::TUS_RESUMABLE).unwrap_or_default().to_string(),
            supported_versions: list(headers::TUS_VERSION),
            extensions: list(headers::TUS_EXTENSION),
            max_size: parse_u64(response, headers::TUS_MAX_SIZE)?,
            checksum_algorithms: list(headers::TUS_CHECKSUM_ALGORITHM),
        })
    }

    pub fn supports_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|e| e.eq_ignore_ascii_case(name))
    }

    /// Whether an upload of `length` bytes fits under `Tus-Max-Size`
    pub fn accepts_length(&self, length: u64) -> bool {
        self.max_size.map_or(true, |max| length <= max)
    }
}
