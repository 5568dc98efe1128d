//! UUID providers: the upstream sources an allow-set is assembled from.
//!
//! Adding a provider kind means declaring a new variant here — the store
//! is polymorphic over `{name, priority, is_available, fetch_uuids}` only.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

/// Default ceiling on a provider HTTP fetch.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// A source of authorized UUIDs.
#[derive(Debug, Clone)]
pub enum Provider {
    /// Constant list, highest precedence. Used for DEV_MODE single-UUID
    /// setups and fixed fleet credentials.
    Static { name: String, uuids: Vec<String> },
    /// Remnawave-style panel: `GET {api_url}/api/users` with a bearer token.
    Remote {
        name: String,
        api_url: String,
        api_key: String,
    },
    /// Plain endpoint returning a UUID array or `{"uuids": [...]}`.
    GenericHttp { name: String, url: String },
}

impl Provider {
    pub fn static_list(name: impl Into<String>, uuids: Vec<String>) -> Self {
        Self::Static {
            name: name.into(),
            uuids,
        }
    }

    pub fn remnawave(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::Remote {
            name: "remnawave".to_string(),
            api_url: api_url.into(),
            api_key: api_key.into(),
        }
    }

    pub fn generic_http(url: impl Into<String>) -> Self {
        Self::GenericHttp {
            name: "http".to_string(),
            url: url.into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Static { name, .. } => name,
            Self::Remote { name, .. } => name,
            Self::GenericHttp { name, .. } => name,
        }
    }

    /// Merge precedence: lower wins conflicts.
    pub fn priority(&self) -> u32 {
        match self {
            Self::Static { .. } => 0,
            Self::Remote { .. } => 10,
            Self::GenericHttp { .. } => 20,
        }
    }

    pub fn is_available(&self) -> bool {
        match self {
            Self::Static { uuids, .. } => !uuids.is_empty(),
            Self::Remote {
                api_url, api_key, ..
            } => !api_url.is_empty() && !api_key.is_empty(),
            Self::GenericHttp { url, .. } => !url.is_empty(),
        }
    }

    /// Fetch the provider's UUID list, normalized to lowercase hyphenated
    /// form. Invalid entries are dropped, not errors.
    pub async fn fetch_uuids(&self, http: &reqwest::Client) -> anyhow::Result<Vec<String>> {
        match self {
            Self::Static { uuids, .. } => Ok(uuids
                .iter()
                .filter_map(|u| normalize_uuid(u))
                .collect()),
            Self::Remote {
                api_url, api_key, ..
            } => {
                let url = format!("{}/api/users", api_url.trim_end_matches('/'));
                let body: Value = http
                    .get(&url)
                    .bearer_auth(api_key)
                    .timeout(FETCH_TIMEOUT)
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                Ok(parse_panel_users(&body))
            }
            Self::GenericHttp { url, .. } => {
                let body: Value = http
                    .get(url)
                    .timeout(FETCH_TIMEOUT)
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                Ok(parse_uuid_list(&body))
            }
        }
    }
}

/// Canonical lowercase hyphenated form, or None for garbage.
pub fn normalize_uuid(raw: &str) -> Option<String> {
    Uuid::parse_str(raw.trim()).ok().map(|u| u.to_string())
}

/// Extract enabled users' UUIDs from a panel response. Accepts any of
/// `{response:{users:[...]}}`, `{users:[...]}`, `{data:[...]}`, or a bare
/// array.
pub fn parse_panel_users(body: &Value) -> Vec<String> {
    let users = body
        .get("response")
        .and_then(|r| r.get("users"))
        .and_then(Value::as_array)
        .or_else(|| body.get("users").and_then(Value::as_array))
        .or_else(|| body.get("data").and_then(Value::as_array))
        .or_else(|| body.as_array());

    let Some(users) = users else {
        return Vec::new();
    };

    users
        .iter()
        .filter_map(|user| {
            let uuid = normalize_uuid(user.get("vlessUuid")?.as_str()?)?;
            if user.get("enabled").and_then(Value::as_bool) == Some(false) {
                return None;
            }
            if let Some(status) = user.get("status").and_then(Value::as_str) {
                if status.eq_ignore_ascii_case("disabled") {
                    return None;
                }
            }
            Some(uuid)
        })
        .collect()
}

/// Extract UUIDs from a generic endpoint: a bare array or `{"uuids": [...]}`.
pub fn parse_uuid_list(body: &Value) -> Vec<String> {
    let list = body
        .as_array()
        .or_else(|| body.get("uuids").and_then(Value::as_array));
    let Some(list) = list else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|v| normalize_uuid(v.as_str()?))
        .collect()
}

/// Fold per-provider results into `uuid -> provider name`, lowest priority
/// number first; earlier writers win conflicts.
pub fn merge_results(mut results: Vec<(String, u32, Vec<String>)>) -> HashMap<String, String> {
    results.sort_by_key(|(_, priority, _)| *priority);
    let mut merged = HashMap::new();
    for (name, _, uuids) in results {
        for uuid in uuids {
            merged.entry(uuid).or_insert_with(|| name.clone());
        }
    }
    merged
}
