// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde_json::Value;
use tracing::debug;

use crate::event::Event;
use crate::filter::BeforeSendFilter;
use crate::REDACTED;

pub const DEFAULT_SENSITIVE_FIELDS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "auth",
    "credit_card",
    "ccv",
    "ssn",
];

/// Redacts values in a JSON request body whose key contains a sensitive term.
///
/// Matching is a case-insensitive substring match on the key. Nested objects and arrays are
/// walked; a container under a sensitive key is walked rather than replaced wholesale. Bodies
/// that are absent or not JSON pass through untouched.
pub struct SensitiveDataFilter {
    fields: Vec<String>,
}

impl Default for SensitiveDataFilter {
    fn default() -> Self {
        Self::with_fields(DEFAULT_SENSITIVE_FIELDS.iter().copied())
    }
}

impl SensitiveDataFilter {
    #[must_use]
    pub fn with_fields<'a>(fields: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            fields: fields.into_iter().map(str::to_lowercase).collect(),
        }
    }

    fn is_sensitive(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.fields.iter().any(|field| key.contains(field.as_str()))
    }

    fn redact(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, value) in map.iter_mut() {
                    if value.is_object() || value.is_array() {
                        self.redact(value);
                    } else if self.is_sensitive(key) {
                        *value = Value::String(REDACTED.to_string());
                    }
                }
            }
            Value::Array(items) => items.iter_mut().for_each(|item| self.redact(item)),
            _ => {}
        }
    }
}

impl BeforeSendFilter for SensitiveDataFilter {
    fn name(&self) -> &'static str {
        "sensitive_data"
    }

    fn apply(&self, mut event: Event) -> Option<Event> {
        let Some(data) = event.request.as_mut().and_then(|r| r.data.as_mut()) else {
            return Some(event);
        };

        let mut decoded: Value = match serde_json::from_str(data) {
            Ok(decoded) => decoded,
            Err(_) => return Some(event),
        };
        self.redact(&mut decoded);

        match serde_json::to_string(&decoded) {
            Ok(redacted) => *data = redacted,
            Err(e) => debug!("FILTER | Could not re-encode redacted body: {e}"),
        }
        Some(event)
    }
}
