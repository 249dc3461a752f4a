//! Provider types and configuration.

use crate::error::ConfigurationError;
use base64::{engine::general_purpose, Engine as _};
use std::time::Duration;
use url::Url;
use zeroize::Zeroizing;

/// Well-known account used by the local storage emulator
const DEV_STORAGE_ACCOUNT: &str = "devstoreaccount1";
const DEV_STORAGE_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const DEV_STORAGE_QUEUE_ENDPOINT: &str = "http://127.0.0.1:10001/devstoreaccount1";

/// Enumeration of supported queue providers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    AzureStorage,
    InMemory,
}

impl ProviderType {
    /// Get maximum message size for provider
    pub fn max_message_size(&self) -> usize {
        match self {
            Self::AzureStorage => 64 * 1024, // 64KB
            Self::InMemory => 64 * 1024,     // mirrors the storage limit
        }
    }

    /// Get maximum visibility timeout for provider
    pub fn max_visibility_timeout(&self) -> chrono::Duration {
        match self {
            Self::AzureStorage => chrono::Duration::days(7),
            Self::InMemory => chrono::Duration::days(7),
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AzureStorage => write!(f, "AzureStorage"),
            Self::InMemory => write!(f, "InMemory"),
        }
    }
}

/// Configuration for queue client initialization
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub provider: ProviderConfig,
    pub request_timeout: Duration,
    pub max_retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::InMemory(InMemoryConfig::default()),
            request_timeout: Duration::from_secs(30),
            max_retry_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(16),
        }
    }
}

/// Provider-specific configuration
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    AzureStorage(AzureStorageConfig),
    InMemory(InMemoryConfig),
}

/// Azure Storage Queue configuration
#[derive(Debug, Clone)]
pub struct AzureStorageConfig {
    pub connection: StorageConnectionString,
    pub api_version: String,
}

impl AzureStorageConfig {
    /// Storage REST API version sent with every request
    pub const DEFAULT_API_VERSION: &'static str = "2021-12-02";

    /// Build configuration from a storage connection string
    pub fn from_connection_string(connection_string: &str) -> Result<Self, ConfigurationError> {
        Ok(Self {
            connection: StorageConnectionString::parse(connection_string)?,
            api_version: Self::DEFAULT_API_VERSION.to_string(),
        })
    }
}

/// In-memory provider configuration
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    pub max_queue_size: usize,
    pub max_message_size: usize,
    pub default_message_ttl: Option<chrono::Duration>,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100_000,
            max_message_size: ProviderType::InMemory.max_message_size(),
            default_message_ttl: None,
        }
    }
}

// ============================================================================
// Storage Connection String
// ============================================================================

/// Parsed storage account connection string
///
/// Understands the `AccountName`/`AccountKey`/`EndpointSuffix`/`QueueEndpoint`
/// form as well as `UseDevelopmentStorage=true`. The decoded account key is
/// wiped from memory on drop and never printed.
#[derive(Clone)]
pub struct StorageConnectionString {
    account_name: String,
    account_key: Zeroizing<Vec<u8>>,
    queue_endpoint: Url,
}

impl StorageConnectionString {
    /// Parse a `key=value;key=value` connection string
    pub fn parse(connection_string: &str) -> Result<Self, ConfigurationError> {
        let mut protocol = "https".to_string();
        let mut account_name = None;
        let mut account_key = None;
        let mut endpoint_suffix = "core.windows.net".to_string();
        let mut queue_endpoint = None;
        let mut development = false;

        for part in connection_string.split(';').map(str::trim) {
            if part.is_empty() {
                continue;
            }

            let (key, value) = part.split_once('=').ok_or_else(|| ConfigurationError::Parsing {
                message: "connection string segment is not key=value".to_string(),
            })?;

            match key {
                "DefaultEndpointsProtocol" => protocol = value.to_string(),
                "AccountName" => account_name = Some(value.to_string()),
                "AccountKey" => account_key = Some(Zeroizing::new(value.to_string())),
                "EndpointSuffix" => endpoint_suffix = value.to_string(),
                "QueueEndpoint" => queue_endpoint = Some(value.to_string()),
                "UseDevelopmentStorage" => development = value.eq_ignore_ascii_case("true"),
                // Blob/table/file endpoints and SAS tokens are irrelevant here
                _ => {}
            }
        }

        if development {
            account_name.get_or_insert_with(|| DEV_STORAGE_ACCOUNT.to_string());
            account_key.get_or_insert_with(|| Zeroizing::new(DEV_STORAGE_KEY.to_string()));
            queue_endpoint.get_or_insert_with(|| DEV_STORAGE_QUEUE_ENDPOINT.to_string());
        }

        let account_name = account_name.ok_or_else(|| ConfigurationError::Missing {
            key: "AccountName".to_string(),
        })?;
        let account_key = account_key.ok_or_else(|| ConfigurationError::Missing {
            key: "AccountKey".to_string(),
        })?;
        let decoded_key = general_purpose::STANDARD
            .decode(account_key.as_bytes())
            .map_err(|_| ConfigurationError::Invalid {
                message: "AccountKey is not valid base64".to_string(),
            })?;

        let endpoint = queue_endpoint.unwrap_or_else(|| {
            format!("{}://{}.queue.{}", protocol, account_name, endpoint_suffix)
        });
        let queue_endpoint = Url::parse(endpoint.trim_end_matches('/')).map_err(|e| {
            ConfigurationError::Invalid {
                message: format!("QueueEndpoint is not a valid URL: {}", e),
            }
        })?;

        Ok(Self {
            account_name,
            account_key: Zeroizing::new(decoded_key),
            queue_endpoint,
        })
    }

    /// Storage account name
    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    /// Decoded account key bytes used for Shared Key signing
    pub fn account_key(&self) -> &[u8] {
        &self.account_key
    }

    /// Base URL of the queue service
    pub fn queue_endpoint(&self) -> &Url {
        &self.queue_endpoint
    }
}

impl std::fmt::Debug for StorageConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConnectionString")
            .field("account_name", &self.account_name)
            .field("account_key", &"<redacted>")
            .field("queue_endpoint", &self.queue_endpoint.as_str())
            .finish()
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
