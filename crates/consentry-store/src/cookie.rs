//! Cookie-jar model of the lightweight fallback store.
//!
//! The jar holds URL-encoded values with browser cookie attributes and an
//! expiry, and can render the `Set-Cookie`-style header string a host bridge
//! writes to `document.cookie`. It plugs into the store as a
//! [`StorageBackend`]; values cross the trait as plain JSON and the jar
//! handles encoding.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};

use consentry_core::Result;

use crate::backend::StorageBackend;

/// Attributes applied to every cookie the jar writes.
#[derive(Debug, Clone)]
pub struct CookieAttributes {
    pub path: String,
    pub domain: Option<String>,
    pub secure: bool,
    pub same_site: String,
    pub expire_days: u32,
}

impl Default for CookieAttributes {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            domain: None,
            secure: true,
            same_site: "Lax".to_string(),
            expire_days: 365,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredCookie {
    /// URL-encoded value, as it would appear on the wire.
    encoded: String,
    expires_at: DateTime<Utc>,
}

/// In-process cookie jar keyed by cookie name.
pub struct CookieJar {
    attributes: CookieAttributes,
    cookies: RwLock<HashMap<String, StoredCookie>>,
}

impl CookieJar {
    pub fn new(attributes: CookieAttributes) -> Self {
        Self {
            attributes,
            cookies: RwLock::new(HashMap::new()),
        }
    }

    pub fn attributes(&self) -> &CookieAttributes {
        &self.attributes
    }

    /// Read a cookie value at a given instant, honoring expiry.
    pub fn get_at(&self, name: &str, now: DateTime<Utc>) -> Option<String> {
        let mut cookies = self.cookies.write();
        let cookie = cookies.get(name)?;
        if now > cookie.expires_at {
            cookies.remove(name);
            return None;
        }
        percent_decode_str(&cookie.encoded)
            .decode_utf8()
            .ok()
            .map(|v| v.into_owned())
    }

    /// Write a cookie value at a given instant.
    pub fn set_at(&self, name: &str, value: &str, now: DateTime<Utc>) {
        let encoded = utf8_percent_encode(value, NON_ALPHANUMERIC).to_string();
        let expires_at = now + Duration::days(i64::from(self.attributes.expire_days));
        self.cookies
            .write()
            .insert(name.to_string(), StoredCookie { encoded, expires_at });
    }

    /// The header string a browser bridge would write for this cookie.
    pub fn header_string(&self, name: &str) -> Option<String> {
        let cookies = self.cookies.read();
        let cookie = cookies.get(name)?;
        let mut header = format!("{}={}", name, cookie.encoded);
        header.push_str(&format!("; expires={}", cookie.expires_at.to_rfc2822()));
        header.push_str(&format!("; path={}", self.attributes.path));
        if let Some(domain) = &self.attributes.domain {
            header.push_str(&format!("; domain={domain}"));
        }
        if self.attributes.secure {
            header.push_str("; Secure");
        }
        header.push_str(&format!("; SameSite={}", self.attributes.same_site));
        Some(header)
    }
}

impl StorageBackend for CookieJar {
    fn get(&self, key: &str) -> Option<String> {
        self.get_at(key, Utc::now())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.set_at(key, value, Utc::now());
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.cookies.write().remove(key);
    }
}
