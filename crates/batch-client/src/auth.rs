//! Shared Key credentials for the batch service.
//!
//! Each request is signed with HMAC-SHA256 over a canonical string made of the
//! verb, the standard content headers, the `ocp-*` headers and the
//! canonicalized resource (`/{account}{path}` plus sorted query parameters).

use crate::error::BatchError;
use base64::{engine::general_purpose, Engine};
use hmac::{Hmac, Mac};
use reqwest::Method;
use sha2::Sha256;
use std::collections::BTreeMap;
use url::Url;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Account URL, name and decoded key for a batch account
#[derive(Clone)]
pub struct BatchCredentials {
    account_url: Url,
    account_name: String,
    account_key: Zeroizing<Vec<u8>>,
}

impl BatchCredentials {
    /// Build credentials from the account URL, name and base64 key
    ///
    /// # Errors
    ///
    /// Returns `BatchError::Configuration` if the URL cannot be parsed or the
    /// key is not valid base64.
    pub fn new(
        account_url: &str,
        account_name: &str,
        account_key: &str,
    ) -> Result<Self, BatchError> {
        let account_url = Url::parse(account_url.trim_end_matches('/')).map_err(|e| {
            BatchError::Configuration {
                message: format!("batch account URL is invalid: {}", e),
            }
        })?;
        if account_name.is_empty() {
            return Err(BatchError::Configuration {
                message: "batch account name is empty".to_string(),
            });
        }
        let decoded = general_purpose::STANDARD
            .decode(account_key.trim())
            .map_err(|_| BatchError::Configuration {
                message: "batch account key is not valid base64".to_string(),
            })?;

        Ok(Self {
            account_url,
            account_name: account_name.to_string(),
            account_key: Zeroizing::new(decoded),
        })
    }

    pub fn account_url(&self) -> &Url {
        &self.account_url
    }

    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    pub(crate) fn string_to_sign(
        &self,
        method: &Method,
        url: &Url,
        ocp_headers: &BTreeMap<String, String>,
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

        for (name, value) in ocp_headers {
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

    /// Compute the `Authorization` header value for a canonical string
    pub(crate) fn authorization(&self, string_to_sign: &str) -> Result<String, BatchError> {
        let mut mac = HmacSha256::new_from_slice(&self.account_key).map_err(|e| {
            BatchError::Configuration {
                message: format!("batch account key rejected: {}", e),
            }
        })?;
        mac.update(string_to_sign.as_bytes());
        let signature = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        Ok(format!("SharedKey {}:{}", self.account_name, signature))
    }
}

impl std::fmt::Debug for BatchCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCredentials")
            .field("account_url", &self.account_url.as_str())
            .field("account_name", &self.account_name)
            .field("account_key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
