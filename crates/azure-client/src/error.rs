//! Azure client errors
//!
//! All knowledge of ARM error text lives here. The rest of the workspace asks
//! an [`AzureError`] what kind of failure it is instead of matching strings.

use thiserror::Error;

/// Message fragment returned when a newer write superseded this one
pub const OPERATION_CANCELED_MESSAGE: &str = "canceledandsupersededduetoanotheroperation";

/// Error code returned when a referenced resource is still provisioning
pub const REFERENCED_RESOURCE_NOT_PROVISIONED_CODE: &str = "ReferencedResourceNotProvisioned";

/// Error code returned when a public IP is still referenced by another resource
pub const CANNOT_DELETE_PUBLIC_IP_CODE: &str = "PublicIPAddressCannotBeDeleted";

/// Errors that can occur when interacting with Azure Resource Manager
#[derive(Debug, Error)]
pub enum AzureError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// ARM returned an error response
    #[error("Azure API error (HTTP {status}) {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request (e.g., malformed resource ID)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl AzureError {
    /// Build an API error from a status and message
    pub fn api(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        AzureError::Api {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// HTTP status code, if the error came from a response
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AzureError::Api { status, .. } => Some(*status),
            AzureError::NotFound(_) => Some(404),
            AzureError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    fn text(&self) -> String {
        match self {
            AzureError::Api { code, message, .. } => format!("{} {}", code, message),
            other => other.to_string(),
        }
    }

    /// 404 from ARM
    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    /// 412: the ETag sent with the write no longer matches
    pub fn is_precondition_failed(&self) -> bool {
        self.status_code() == Some(412)
    }

    /// A newer write canceled this one
    pub fn is_operation_canceled(&self) -> bool {
        self.text().to_lowercase().contains(OPERATION_CANCELED_MESSAGE)
    }

    /// 403 or 409, which teardown treats as already done
    pub fn is_forbidden_or_ignored(&self) -> bool {
        matches!(self.status_code(), Some(403) | Some(409))
    }

    /// Public IP delete refused because something still references it
    pub fn is_cannot_delete_public_ip(&self) -> bool {
        self.text().contains(CANNOT_DELETE_PUBLIC_IP_CODE)
    }

    /// A 4xx error that is not a conflict and will not go away on retry
    pub fn is_bad_request(&self) -> bool {
        matches!(self.status_code(), Some(400) | Some(422))
    }

    /// Whether the same request may succeed if sent again later
    pub fn is_retriable(&self) -> bool {
        match self {
            AzureError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            AzureError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Whether the failed write could have left a cached copy stale
    pub fn invalidates_cache(&self) -> bool {
        self.is_precondition_failed() || self.is_operation_canceled()
    }

    /// For a `ReferencedResourceNotProvisioned` failure, the resource group
    /// and name of the public IP that is still provisioning.
    pub fn referenced_public_ip(&self) -> Option<(String, String)> {
        let text = self.text();
        if !text
            .to_lowercase()
            .contains(&REFERENCED_RESOURCE_NOT_PROVISIONED_CODE.to_lowercase())
        {
            return None;
        }
        parse_resource_reference(&text, "Microsoft.Network/publicIPAddresses/")
    }

    /// For a delete refused because a VM scale set still uses the resource,
    /// the resource group and name of that scale set.
    pub fn referenced_vm_set(&self) -> Option<(String, String)> {
        parse_resource_reference(&self.text(), "Microsoft.Compute/virtualMachineScaleSets/")
    }
}

/// Byte offset of the first ASCII case-insensitive match of `needle`
fn find_ignore_case(text: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    text.as_bytes()
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle.as_bytes()))
}

/// Byte offset of the last ASCII case-insensitive match of `needle`
fn rfind_ignore_case(text: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    text.as_bytes()
        .windows(needle.len())
        .rposition(|w| w.eq_ignore_ascii_case(needle.as_bytes()))
}

/// Find `.../resourceGroups/<rg>/providers/<marker><name>` inside free text.
///
/// Needles are ASCII, so every offset found lies on a char boundary of `text`.
fn parse_resource_reference(text: &str, marker: &str) -> Option<(String, String)> {
    let marker_at = find_ignore_case(text, marker)?;

    let rg_key = "/resourceGroups/";
    let rg_at = rfind_ignore_case(&text[..marker_at], rg_key)? + rg_key.len();
    let rg_end = rg_at + text[rg_at..].find('/')?;
    let resource_group = &text[rg_at..rg_end];

    let name_start = marker_at + marker.len();
    let name: String = text[name_start..]
        .chars()
        .take_while(|c| !c.is_whitespace() && !matches!(c, '/' | '\'' | '"' | ',' | ')'))
        .collect();
    let name = name.trim_end_matches('.');

    if resource_group.is_empty() || name.is_empty() {
        return None;
    }
    Some((resource_group.to_string(), name.to_string()))
}
