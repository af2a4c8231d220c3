use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Serializable device/session state.
///
/// This is the payload behind the core's opaque credentials blob: dumping and
/// re-loading it on a fresh client resumes the session without a password.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    pub uuid: String,
    pub device_id: String,
    pub phone_id: String,
    pub username: Option<String>,
    pub user_id: Option<String>,
    /// `Bearer IGT:2:...` token echoed back on every request once issued.
    pub authorization: Option<String>,
    pub cookies: HashMap<String, String>,
    /// Transient: set while a two-factor login is pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub two_factor_identifier: Option<String>,
}

impl Settings {
    /// Fresh device identity for a brand-new session.
    pub fn generate() -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            device_id: format!("android-{}", Uuid::new_v4().as_simple()),
            phone_id: Uuid::new_v4().to_string(),
            username: None,
            user_id: None,
            authorization: None,
            cookies: HashMap::new(),
            two_factor_identifier: None,
        }
    }

    /// Store the name/value pair of a `Set-Cookie` header.
    pub fn absorb_cookie(&mut self, raw: &str) {
        let Some(pair) = raw.split(';').next() else {
            return;
        };
        let Some((name, value)) = pair.split_once('=') else {
            return;
        };
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        self.cookies.insert(name.to_string(), value.trim().to_string());
    }

    /// `Cookie:` header value for outgoing requests.
    pub fn cookie_header(&self) -> String {
        let mut pairs: Vec<_> = self
            .cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        pairs.sort();
        pairs.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identities_are_unique() {
        let a = Settings::generate();
        let b = Settings::generate();
        assert_ne!(a.uuid, b.uuid);
        assert_ne!(a.device_id, b.device_id);
        assert!(a.device_id.starts_with("android-"));
    }

    #[test]
    fn cookie_absorption_and_header() {
        let mut s = Settings::generate();
        s.absorb_cookie("sessionid=abc; Path=/; HttpOnly");
        s.absorb_cookie("csrftoken=xyz");
        s.absorb_cookie("malformed");
        assert_eq!(s.cookie_header(), "csrftoken=xyz; sessionid=abc");

        // Later values overwrite earlier ones.
        s.absorb_cookie("csrftoken=updated");
        assert!(s.cookie_header().contains("csrftoken=updated"));
    }
}
