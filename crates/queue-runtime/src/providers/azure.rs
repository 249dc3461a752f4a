//! Azure Storage Queue provider implementation using the HTTP REST API.
//!
//! Requests are made directly with `reqwest` and authenticated with the
//! storage account Shared Key scheme, so every call can be exercised against
//! a mock HTTP server in unit tests.
//!
//! ## Operations
//!
//! | Operation                   | Request                                             |
//! |-----------------------------|-----------------------------------------------------|
//! | create queue if absent      | `PUT /{queue}` (201 created, 204 already present)   |
//! | send message                | `POST /{queue}/messages`                            |
//! | approximate count           | `GET /{queue}?comp=metadata`                        |
//! | receive message             | `GET /{queue}/messages?numofmessages=1`             |
//! | delete message              | `DELETE /{queue}/messages/{id}?popreceipt=..`       |
//! | update visibility           | `PUT /{queue}/messages/{id}?popreceipt=..`          |
//!
//! The service's approximate count includes messages that are currently
//! leased, so it can stay above zero while the last items are in flight.
//!
//! ## Example
//!
//! ```no_run
//! use queue_runtime::{AzureStorageConfig, ProviderConfig, QueueClientFactory, QueueConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = QueueConfig {
//!     provider: ProviderConfig::AzureStorage(AzureStorageConfig::from_connection_string(
//!         "UseDevelopmentStorage=true",
//!     )?),
//!     ..Default::default()
//! };
//!
//! let client = QueueClientFactory::create_client(config)?;
//! # Ok(())
//! # }
//! ```

use crate::client::QueueProvider;
use crate::error::{ConfigurationError, QueueError, SerializationError, ValidationError};
use crate::message::{Message, MessageId, QueueName, ReceiptHandle, ReceivedMessage, Timestamp};
use crate::provider::{AzureStorageConfig, ProviderType};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use reqwest::{Client as HttpClient, Method, StatusCode};
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use tracing::{debug, instrument};
use url::Url;
use zeroize::Zeroizing;

#[cfg(test)]
#[path = "azure_tests.rs"]
mod tests;

const PROVIDER_NAME: &str = "AzureStorage";
const APPROXIMATE_COUNT_HEADER: &str = "x-ms-approximate-messages-count";
const POP_RECEIPT_HEADER: &str = "x-ms-popreceipt";
const TIME_NEXT_VISIBLE_HEADER: &str = "x-ms-time-next-visible";
const ERROR_CODE_HEADER: &str = "x-ms-error-code";

// ============================================================================
// Error Types
// ============================================================================

/// Azure Storage Queue specific errors
#[derive(Debug, thiserror::Error)]
pub enum AzureError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Pop receipt no longer valid: {0}")]
    ReceiptInvalid(String),

    #[error("Server busy: {0}")]
    ServerBusy(String),

    #[error("Storage service error {status}: {code} - {message}")]
    ServiceError {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("Malformed response: {0}")]
    SerializationError(String),

    #[error("Missing or invalid response header: {0}")]
    InvalidHeader(&'static str),
}

impl AzureError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Authentication(_) => false,
            Self::NetworkError(_) => true,
            Self::Timeout(_) => true,
            Self::QueueNotFound(_) => false,
            Self::ReceiptInvalid(_) => false,
            Self::ServerBusy(_) => true,
            Self::ServiceError { status, .. } => *status >= 500,
            Self::ConfigurationError(_) => false,
            Self::SerializationError(_) => false,
            Self::InvalidHeader(_) => false,
        }
    }
}

impl From<AzureError> for QueueError {
    fn from(error: AzureError) -> Self {
        match error {
            AzureError::Authentication(message) => QueueError::AuthenticationFailed { message },
            AzureError::NetworkError(message) => QueueError::ConnectionFailed { message },
            AzureError::Timeout(duration) => QueueError::Timeout {
                duration: Duration::from_std(duration).unwrap_or_else(|_| Duration::zero()),
            },
            AzureError::QueueNotFound(queue_name) => QueueError::QueueNotFound { queue_name },
            AzureError::ReceiptInvalid(receipt) => QueueError::MessageNotFound { receipt },
            AzureError::ServerBusy(message) => QueueError::ServerBusy { message },
            AzureError::ServiceError {
                status,
                code,
                message,
            } if status < 500 => QueueError::ValidationError(ValidationError::InvalidFormat {
                field: "request".to_string(),
                message: format!("{}: {} (status {})", code, message, status),
            }),
            AzureError::ServiceError { code, message, .. } => QueueError::ProviderError {
                provider: PROVIDER_NAME.to_string(),
                code,
                message,
            },
            AzureError::ConfigurationError(message) => {
                QueueError::ConfigurationError(ConfigurationError::Invalid { message })
            }
            AzureError::SerializationError(message) => {
                QueueError::SerializationError(SerializationError::Xml { message })
            }
            AzureError::InvalidHeader(header) => {
                QueueError::SerializationError(SerializationError::InvalidHeader {
                    header: header.to_string(),
                })
            }
        }
    }
}

// ============================================================================
// Shared Key Signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// Shared Key signer for storage account requests
///
/// Builds the canonical string for the queue service:
/// 1. Verb and the standard headers, one per line (Content-Length is empty when zero)
/// 2. Lowercase `x-ms-*` headers sorted by name, as `name:value`
/// 3. `/{account}{path}` followed by each query parameter as `\nname:value`, sorted
///
/// The signature is the base64 HMAC-SHA256 of that string under the decoded
/// account key.
#[derive(Clone)]
pub(crate) struct SharedKeySigner {
    account_name: String,
    key: Zeroizing<Vec<u8>>,
}

impl SharedKeySigner {
    pub(crate) fn new(account_name: &str, key: &[u8]) -> Self {
        Self {
            account_name: account_name.to_string(),
            key: Zeroizing::new(key.to_vec()),
        }
    }

    /// Build the canonical string to sign
    pub(crate) fn string_to_sign(
        &self,
        method: &Method,
        url: &Url,
        ms_headers: &BTreeMap<String, String>,
        content_length: usize,
        content_type: Option<&str>,
    ) -> String {
        let content_length = if content_length == 0 {
            String::new()
        } else {
            content_length.to_string()
        };

        let mut canonical = format!(
            "{}\n\n\n{}\n\n{}\n\n\n\n\n\n\n",
            method.as_str(),
            content_length,
            content_type.unwrap_or("")
        );

        for (name, value) in ms_headers {
            canonical.push_str(&format!("{}:{}\n", name.to_ascii_lowercase(), value.trim()));
        }

        canonical.push('/');
        canonical.push_str(&self.account_name);
        canonical.push_str(url.path());

        let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in url.query_pairs() {
            params
                .entry(name.to_ascii_lowercase())
                .or_default()
                .push(value.into_owned());
        }
        for (name, mut values) in params {
            values.sort();
            canonical.push_str(&format!("\n{}:{}", name, values.join(",")));
        }

        canonical
    }

    /// Compute the `Authorization` header value
    pub(crate) fn authorization(&self, string_to_sign: &str) -> Result<String, AzureError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| AzureError::ConfigurationError(format!("invalid account key: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        let signature = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        Ok(format!("SharedKey {}:{}", self.account_name, signature))
    }
}

// ============================================================================
// Response Parsing
// ============================================================================

struct RawResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

impl RawResponse {
    fn header(&self, name: &'static str) -> Result<&str, AzureError> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .ok_or(AzureError::InvalidHeader(name))
    }
}

/// What a failing request addressed, used to interpret a bare 404
#[derive(Clone, Copy)]
enum Target {
    Queue,
    Message,
}

fn parse_http_date(value: &str) -> Option<Timestamp> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| Timestamp::from_datetime(dt.with_timezone(&Utc)))
}

fn xml_error(e: impl std::fmt::Display) -> AzureError {
    AzureError::SerializationError(format!("XML parsing error: {}", e))
}

/// Collect the child element text of every `record` element in document order
fn parse_records(xml: &str, record: &[u8]) -> Result<Vec<HashMap<String, String>>, AzureError> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    // Text is kept verbatim; whitespace between elements falls outside any field
    let mut reader = Reader::from_str(xml);

    let mut records = Vec::new();
    let mut current: Option<HashMap<String, String>> = None;
    let mut field: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.name().as_ref() == record => {
                current = Some(HashMap::new());
            }
            Ok(Event::Start(ref e)) if current.is_some() => {
                field = Some(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            }
            Ok(Event::Text(e)) => {
                if let (Some(fields), Some(name)) = (current.as_mut(), field.as_ref()) {
                    let text = e.unescape().map_err(xml_error)?;
                    fields.entry(name.clone()).or_default().push_str(&text);
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == record => {
                if let Some(fields) = current.take() {
                    records.push(fields);
                }
                field = None;
            }
            Ok(Event::End(_)) => field = None,
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(records)
}

/// Extract `<Error><Code>` and `<Message>` from an error body
fn parse_error_body(xml: &str) -> (Option<String>, Option<String>) {
    match parse_records(xml, b"Error") {
        Ok(mut records) if !records.is_empty() => {
            let mut fields = records.swap_remove(0);
            (fields.remove("Code"), fields.remove("Message"))
        }
        _ => (None, None),
    }
}

fn classify_error(response: &RawResponse, queue: &QueueName, target: Target) -> AzureError {
    let (body_code, body_message) = parse_error_body(&response.body);
    let code = response
        .headers
        .get(ERROR_CODE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(body_code)
        .unwrap_or_else(|| "Unknown".to_string());
    let message = body_message.unwrap_or_else(|| {
        response
            .status
            .canonical_reason()
            .unwrap_or("Unknown error")
            .to_string()
    });
    let status = response.status;

    match code.as_str() {
        "QueueNotFound" | "QueueBeingDeleted" => AzureError::QueueNotFound(queue.to_string()),
        "MessageNotFound" | "PopReceiptMismatch" => {
            AzureError::ReceiptInvalid(format!("{}: {}", code, message))
        }
        "ServerBusy" | "OperationTimedOut" => AzureError::ServerBusy(message),
        "AuthenticationFailed" | "AuthorizationFailure" | "InsufficientAccountPermissions" => {
            AzureError::Authentication(format!("{}: {}", code, message))
        }
        _ if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN => {
            AzureError::Authentication(format!("{}: {}", code, message))
        }
        _ if status == StatusCode::SERVICE_UNAVAILABLE => AzureError::ServerBusy(message),
        _ if status == StatusCode::NOT_FOUND => match target {
            Target::Queue => AzureError::QueueNotFound(queue.to_string()),
            Target::Message => AzureError::ReceiptInvalid(format!("{}: {}", code, message)),
        },
        _ => AzureError::ServiceError {
            status: status.as_u16(),
            code,
            message,
        },
    }
}

fn whole_seconds(field: &str, duration: Duration, max: Duration) -> Result<i64, QueueError> {
    if duration < Duration::zero() || duration > max {
        return Err(QueueError::ValidationError(ValidationError::OutOfRange {
            field: field.to_string(),
            message: format!("must be between 0 and {} seconds", max.num_seconds()),
        }));
    }

    Ok(duration.num_seconds())
}

// ============================================================================
// AzureStorageQueueProvider
// ============================================================================

/// Azure Storage Queue provider speaking the REST protocol
pub struct AzureStorageQueueProvider {
    http_client: HttpClient,
    endpoint: Url,
    api_version: String,
    signer: SharedKeySigner,
    request_timeout: std::time::Duration,
}

impl AzureStorageQueueProvider {
    /// Create new Azure Storage Queue provider
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn new(
        config: AzureStorageConfig,
        request_timeout: std::time::Duration,
    ) -> Result<Self, AzureError> {
        let http_client = HttpClient::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AzureError::ConfigurationError(format!("HTTP client: {}", e)))?;

        let connection = &config.connection;
        Ok(Self {
            http_client,
            endpoint: connection.queue_endpoint().clone(),
            api_version: config.api_version,
            signer: SharedKeySigner::new(connection.account_name(), connection.account_key()),
            request_timeout,
        })
    }

    fn queue_url(&self, queue: &QueueName, suffix: &str) -> Result<Url, AzureError> {
        let raw = format!(
            "{}/{}{}",
            self.endpoint.as_str().trim_end_matches('/'),
            queue.as_str(),
            suffix
        );
        Url::parse(&raw).map_err(|e| AzureError::ConfigurationError(format!("bad URL: {}", e)))
    }

    fn message_url(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
        visibility_timeout: Option<i64>,
    ) -> Result<Url, AzureError> {
        let mut url = self.queue_url(
            queue,
            &format!("/messages/{}", urlencoding::encode(receipt.message_id().as_str())),
        )?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("popreceipt", receipt.handle());
            if let Some(seconds) = visibility_timeout {
                query.append_pair("visibilitytimeout", &seconds.to_string());
            }
        }
        Ok(url)
    }

    /// Make a signed HTTP request and collect the response
    async fn make_request(
        &self,
        method: Method,
        url: Url,
        body: Option<String>,
    ) -> Result<RawResponse, AzureError> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let mut ms_headers = BTreeMap::new();
        ms_headers.insert("x-ms-date".to_string(), date);
        ms_headers.insert("x-ms-version".to_string(), self.api_version.clone());

        let content_type = body.as_ref().map(|_| "application/xml; charset=utf-8");
        let content_length = body.as_ref().map(String::len).unwrap_or(0);
        let string_to_sign =
            self.signer
                .string_to_sign(&method, &url, &ms_headers, content_length, content_type);
        let authorization = self.signer.authorization(&string_to_sign)?;

        let mut request = self
            .http_client
            .request(method.clone(), url.clone())
            .header("Authorization", authorization);
        for (name, value) in &ms_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let (Some(body), Some(content_type)) = (body, content_type) {
            request = request.header("Content-Type", content_type).body(body);
        } else {
            request = request.header("Content-Length", "0");
        }

        debug!(method = %method, path = url.path(), "Sending storage queue request");
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AzureError::Timeout(self.request_timeout)
            } else if e.is_connect() {
                AzureError::NetworkError(format!("Connection failed: {}", e))
            } else {
                AzureError::NetworkError(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| AzureError::NetworkError(format!("Failed to read response body: {}", e)))?;

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }

    fn build_receipt(
        &self,
        message_id: MessageId,
        pop_receipt: String,
        next_visible: Option<Timestamp>,
        visibility_timeout: Duration,
    ) -> ReceiptHandle {
        ReceiptHandle::new(
            message_id,
            pop_receipt,
            next_visible.unwrap_or_else(|| Timestamp::after(visibility_timeout)),
            ProviderType::AzureStorage,
        )
    }

    fn parse_received(
        &self,
        mut fields: HashMap<String, String>,
        visibility_timeout: Duration,
    ) -> Result<ReceivedMessage, AzureError> {
        let mut take = |element: &'static str| {
            fields.remove(element).ok_or_else(|| {
                AzureError::SerializationError(format!("missing element '{}'", element))
            })
        };

        let message_id = MessageId::from_str(&take("MessageId")?)
            .map_err(|e| AzureError::SerializationError(e.to_string()))?;
        let pop_receipt = take("PopReceipt")?;
        let delivery_count = take("DequeueCount")?
            .parse::<u32>()
            .map_err(|e| AzureError::SerializationError(format!("DequeueCount: {}", e)))?;
        // An empty MessageText element produces no text event
        let body = take("MessageText").unwrap_or_default();
        let inserted_at = take("InsertionTime")
            .ok()
            .and_then(|v| parse_http_date(&v))
            .unwrap_or_else(Timestamp::now);
        let next_visible = take("TimeNextVisible")
            .ok()
            .and_then(|v| parse_http_date(&v));

        Ok(ReceivedMessage {
            receipt_handle: self.build_receipt(
                message_id.clone(),
                pop_receipt,
                next_visible,
                visibility_timeout,
            ),
            message_id,
            body,
            delivery_count,
            inserted_at,
            delivered_at: Timestamp::now(),
        })
    }
}

#[async_trait]
impl QueueProvider for AzureStorageQueueProvider {
    #[instrument(skip(self, queue), fields(queue = %queue))]
    async fn create_queue_if_absent(&self, queue: &QueueName) -> Result<bool, QueueError> {
        let url = self.queue_url(queue, "")?;
        let response = self.make_request(Method::PUT, url, None).await?;

        match response.status {
            StatusCode::CREATED => Ok(true),
            StatusCode::NO_CONTENT => Ok(false),
            _ => Err(classify_error(&response, queue, Target::Queue).into()),
        }
    }

    async fn send_message(
        &self,
        queue: &QueueName,
        message: &Message,
    ) -> Result<MessageId, QueueError> {
        let mut url = self.queue_url(queue, "/messages")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(ttl) = message.time_to_live {
                query.append_pair("messagettl", &ttl.num_seconds().to_string());
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }

        let body = format!(
            "<QueueMessage><MessageText>{}</MessageText></QueueMessage>",
            quick_xml::escape::escape(message.body.as_str())
        );
        let response = self.make_request(Method::POST, url, Some(body)).await?;
        if response.status != StatusCode::CREATED {
            return Err(classify_error(&response, queue, Target::Queue).into());
        }

        let mut records = parse_records(&response.body, b"QueueMessage")?;
        let id = records
            .first_mut()
            .and_then(|fields| fields.remove("MessageId"))
            .ok_or_else(|| SerializationError::MissingElement {
                element: "MessageId".to_string(),
            })?;

        Ok(MessageId::from_str(&id)?)
    }

    async fn approximate_message_count(&self, queue: &QueueName) -> Result<u64, QueueError> {
        let url = self.queue_url(queue, "?comp=metadata")?;
        let response = self.make_request(Method::GET, url, None).await?;
        if response.status != StatusCode::OK {
            return Err(classify_error(&response, queue, Target::Queue).into());
        }

        let count = response
            .header(APPROXIMATE_COUNT_HEADER)?
            .parse::<u64>()
            .map_err(|_| AzureError::InvalidHeader(APPROXIMATE_COUNT_HEADER))?;
        Ok(count)
    }

    async fn receive_message(
        &self,
        queue: &QueueName,
        visibility_timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        let seconds = whole_seconds(
            "visibility_timeout",
            visibility_timeout,
            ProviderType::AzureStorage.max_visibility_timeout(),
        )?
        // The service rejects receive leases shorter than one second
        .max(1);

        let url = self.queue_url(
            queue,
            &format!("/messages?numofmessages=1&visibilitytimeout={}", seconds),
        )?;
        let response = self.make_request(Method::GET, url, None).await?;
        if response.status != StatusCode::OK {
            return Err(classify_error(&response, queue, Target::Queue).into());
        }

        let mut records = parse_records(&response.body, b"QueueMessage")?;
        if records.is_empty() {
            return Ok(None);
        }

        let received = self.parse_received(records.swap_remove(0), visibility_timeout)?;
        Ok(Some(received))
    }

    async fn delete_message(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
    ) -> Result<(), QueueError> {
        let url = self.message_url(queue, receipt, None)?;
        let response = self.make_request(Method::DELETE, url, None).await?;

        match response.status {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(()),
            _ => Err(classify_error(&response, queue, Target::Message).into()),
        }
    }

    async fn update_visibility(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
        visibility_timeout: Duration,
    ) -> Result<ReceiptHandle, QueueError> {
        let seconds = whole_seconds(
            "visibility_timeout",
            visibility_timeout,
            ProviderType::AzureStorage.max_visibility_timeout(),
        )?;
        let url = self.message_url(queue, receipt, Some(seconds))?;
        let response = self.make_request(Method::PUT, url, None).await?;
        if response.status != StatusCode::NO_CONTENT {
            return Err(classify_error(&response, queue, Target::Message).into());
        }

        let pop_receipt = response.header(POP_RECEIPT_HEADER)?.to_string();
        let next_visible = response
            .header(TIME_NEXT_VISIBLE_HEADER)
            .ok()
            .and_then(parse_http_date);

        Ok(self.build_receipt(
            receipt.message_id().clone(),
            pop_receipt,
            next_visible,
            visibility_timeout,
        ))
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::AzureStorage
    }
}
