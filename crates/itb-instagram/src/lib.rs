//! Instagram private-API adapter.
//!
//! Implements the `itb-core` `InstagramClient` port against the mobile API
//! (`i.instagram.com/api/v1`). One `InstagramHttp` instance is one device
//! session: the serializable [`Settings`] struct carries the device identity,
//! cookies and bearer token, and is what `dump_settings`/`load_settings`
//! round-trip through the core's encrypted persistence.

mod settings;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Method, StatusCode};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use itb_core::instagram::{
    port::{ClientFactory, InstagramClient},
    types::{ApiError, ApiResult, Media, UserInfo},
};

pub use settings::Settings;

const API_BASE: &str = "https://i.instagram.com/api/v1";
const USER_AGENT: &str =
    "Instagram 269.0.0.18.75 Android (26/8.0.0; 480dpi; 1080x1920; itb; en_US)";

pub struct InstagramHttp {
    http: reqwest::Client,
    state: Mutex<Settings>,
}

impl InstagramHttp {
    pub fn new(proxy: Option<&str>) -> ApiResult<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30));

        if let Some(url) = proxy {
            let proxy = reqwest::Proxy::all(url)
                .map_err(|e| ApiError::Unexpected(format!("bad proxy url: {e}")))?;
            builder = builder.proxy(proxy);
        }

        let http = builder
            .build()
            .map_err(|e| ApiError::Unexpected(format!("http client build: {e}")))?;

        Ok(Self {
            http,
            state: Mutex::new(Settings::generate()),
        })
    }

    /// Fire a request with the session headers, absorb cookies/authorization
    /// from the response, and classify failures into the `ApiError` set.
    async fn call(&self, method: Method, path: &str, form: Option<Value>) -> ApiResult<Value> {
        let url = format!("{API_BASE}/{path}");

        let (cookie_header, authorization) = {
            let st = self.state.lock().await;
            (st.cookie_header(), st.authorization.clone())
        };

        let mut req = self.http.request(method, &url);
        if !cookie_header.is_empty() {
            req = req.header(header::COOKIE, cookie_header);
        }
        if let Some(auth) = authorization {
            req = req.header(header::AUTHORIZATION, auth);
        }
        if let Some(body) = form {
            // The mobile API wants the payload as a "signed" form field; the
            // signature itself has been ignored server-side for years.
            req = req.form(&[
                ("signed_body", format!("SIGNATURE.{body}")),
                ("ig_sig_key_version", "4".to_string()),
            ]);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ApiError::Connection(e.to_string()))?;

        let status = resp.status();
        {
            let mut st = self.state.lock().await;
            for set_cookie in resp.headers().get_all(header::SET_COOKIE) {
                if let Ok(raw) = set_cookie.to_str() {
                    st.absorb_cookie(raw);
                }
            }
            if let Some(auth) = resp.headers().get("ig-set-authorization") {
                if let Ok(v) = auth.to_str() {
                    if !v.is_empty() {
                        st.authorization = Some(v.to_string());
                    }
                }
            }
        }

        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Connection(e.to_string()))?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if status.is_success() && body.get("status").and_then(|s| s.as_str()) != Some("fail") {
            return Ok(body);
        }

        // A two-factor rejection carries the identifier the follow-up login
        // must echo back; stash it before the typed error loses it.
        if let Some(id) = body
            .pointer("/two_factor_info/two_factor_identifier")
            .and_then(|v| v.as_str())
        {
            self.state.lock().await.two_factor_identifier = Some(id.to_string());
        }

        debug!(%status, %path, "instagram api failure: {text}");
        Err(classify_failure(status, &body))
    }

    async fn upload_photo_bytes(&self, path: &Path) -> ApiResult<String> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ApiError::Unexpected(format!("read {}: {e}", path.display())))?;

        let upload_id = chrono::Utc::now().timestamp_millis().to_string();
        let name = format!("{upload_id}_0_{}", uuid::Uuid::new_v4().as_simple());
        let params = json!({
            "upload_id": upload_id,
            "media_type": "1",
            "retry_context": {"num_step_auto_retry": 0, "num_reupload": 0},
            "image_compression": {"lib_name": "moz", "quality": "80"},
        });

        let (cookie_header, authorization) = {
            let st = self.state.lock().await;
            (st.cookie_header(), st.authorization.clone())
        };

        let mut req = self
            .http
            .post(format!(
                "https://i.instagram.com/rupload_igphoto/{name}"
            ))
            .header("X-Instagram-Rupload-Params", params.to_string())
            .header("X-Entity-Name", name.clone())
            .header("X-Entity-Length", bytes.len().to_string())
            .header("Offset", "0")
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes);
        if !cookie_header.is_empty() {
            req = req.header(header::COOKIE, cookie_header);
        }
        if let Some(auth) = authorization {
            req = req.header(header::AUTHORIZATION, auth);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ApiError::Connection(e.to_string()))?;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            return Err(classify_failure(status, &body));
        }
        Ok(upload_id)
    }

    async fn device_payload(&self) -> Value {
        let st = self.state.lock().await;
        json!({
            "_uuid": st.uuid,
            "device_id": st.device_id,
            "phone_id": st.phone_id,
        })
    }
}

#[async_trait]
impl InstagramClient for InstagramHttp {
    async fn login(&self, username: &str, password: &str) -> ApiResult<()> {
        let mut payload = self.device_payload().await;
        let enc_password = format!(
            "#PWD_INSTAGRAM:0:{}:{}",
            chrono::Utc::now().timestamp(),
            password
        );
        payload["username"] = json!(username);
        payload["enc_password"] = json!(enc_password);
        payload["login_attempt_count"] = json!(0);

        // Recorded before the call: a two-factor rejection still needs the
        // username for the follow-up verification request.
        self.state.lock().await.username = Some(username.to_string());

        let body = self
            .call(Method::POST, "accounts/login/", Some(payload))
            .await?;

        let mut st = self.state.lock().await;
        st.user_id = body
            .pointer("/logged_in_user/pk")
            .map(value_to_id)
            .or(st.user_id.take());
        Ok(())
    }

    async fn two_factor_login(&self, code: &str) -> ApiResult<()> {
        let identifier = {
            let st = self.state.lock().await;
            st.two_factor_identifier
                .clone()
                .ok_or_else(|| ApiError::Unexpected("no pending two-factor login".to_string()))?
        };

        let mut payload = self.device_payload().await;
        let username = self.state.lock().await.username.clone().unwrap_or_default();
        payload["username"] = json!(username);
        payload["verification_code"] = json!(code);
        payload["two_factor_identifier"] = json!(identifier);
        payload["verification_method"] = json!("1");

        let body = self
            .call(Method::POST, "accounts/two_factor_login/", Some(payload))
            .await?;

        let mut st = self.state.lock().await;
        st.two_factor_identifier = None;
        st.user_id = body
            .pointer("/logged_in_user/pk")
            .map(value_to_id)
            .or(st.user_id.take());
        Ok(())
    }

    async fn logout(&self) -> ApiResult<()> {
        let payload = self.device_payload().await;
        self.call(Method::POST, "accounts/logout/", Some(payload))
            .await?;

        let mut st = self.state.lock().await;
        st.cookies.clear();
        st.authorization = None;
        st.user_id = None;
        Ok(())
    }

    async fn dump_settings(&self) -> ApiResult<String> {
        let st = self.state.lock().await;
        serde_json::to_string(&*st).map_err(|e| ApiError::Unexpected(e.to_string()))
    }

    async fn load_settings(&self, blob: &str) -> ApiResult<()> {
        let parsed: Settings = serde_json::from_str(blob)
            .map_err(|e| ApiError::Unexpected(format!("bad settings blob: {e}")))?;
        *self.state.lock().await = parsed;
        Ok(())
    }

    async fn user_id_from_username(&self, username: &str) -> ApiResult<String> {
        let body = self
            .call(
                Method::GET,
                &format!("users/{username}/usernameinfo/"),
                None,
            )
            .await?;
        body.pointer("/user/pk")
            .map(value_to_id)
            .ok_or_else(|| ApiError::Unexpected("usernameinfo without pk".to_string()))
    }

    async fn user_info(&self, user_id: &str) -> ApiResult<UserInfo> {
        let body = self
            .call(Method::GET, &format!("users/{user_id}/info/"), None)
            .await?;
        let user = body
            .get("user")
            .ok_or_else(|| ApiError::Unexpected("user info without user".to_string()))?;

        Ok(UserInfo {
            user_id: user.get("pk").map(value_to_id).unwrap_or_default(),
            username: user
                .get("username")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            follower_count: count(user, "follower_count"),
            following_count: count(user, "following_count"),
            media_count: count(user, "media_count"),
        })
    }

    async fn user_medias(&self, user_id: &str, limit: u32) -> ApiResult<Vec<Media>> {
        let mut out = Vec::new();
        let mut max_id = String::new();

        // Page cap keeps a huge feed (limit == 0 means "all") bounded.
        for _ in 0..50 {
            let path = if max_id.is_empty() {
                format!("feed/user/{user_id}/")
            } else {
                format!("feed/user/{user_id}/?max_id={max_id}")
            };
            let body = self.call(Method::GET, &path, None).await?;

            for item in body
                .get("items")
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten()
            {
                out.push(parse_media(item));
                if limit != 0 && out.len() >= limit as usize {
                    return Ok(out);
                }
            }

            if !body
                .get("more_available")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
            {
                break;
            }
            max_id = body
                .get("next_max_id")
                .map(value_to_id)
                .unwrap_or_default();
            if max_id.is_empty() {
                break;
            }
        }

        Ok(out)
    }

    async fn photo_upload(&self, path: &Path, caption: &str) -> ApiResult<()> {
        let upload_id = self.upload_photo_bytes(path).await?;

        let mut payload = self.device_payload().await;
        payload["upload_id"] = json!(upload_id);
        payload["caption"] = json!(caption);
        payload["source_type"] = json!("4");

        self.call(Method::POST, "media/configure/", Some(payload))
            .await?;
        Ok(())
    }

    async fn story_upload(&self, path: &Path) -> ApiResult<()> {
        let upload_id = self.upload_photo_bytes(path).await?;

        let mut payload = self.device_payload().await;
        payload["upload_id"] = json!(upload_id);
        payload["source_type"] = json!("3");
        payload["configure_mode"] = json!(1);

        self.call(Method::POST, "media/configure_to_story/", Some(payload))
            .await?;
        Ok(())
    }
}

/// Map an API failure response onto the typed closed set.
fn classify_failure(status: StatusCode, body: &Value) -> ApiError {
    if body
        .get("two_factor_required")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        return ApiError::TwoFactorRequired;
    }

    let message = body.get("message").and_then(|v| v.as_str()).unwrap_or("");
    let error_type = body
        .get("error_type")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    if message == "challenge_required" || body.get("challenge").is_some() {
        return ApiError::ChallengeRequired;
    }
    if error_type == "bad_password" || error_type == "invalid_user" {
        return ApiError::BadCredentials;
    }
    if status == StatusCode::TOO_MANY_REQUESTS
        || error_type == "rate_limit_error"
        || message.starts_with("Please wait a few minutes")
    {
        return ApiError::Throttled;
    }
    if message == "Private account" || error_type == "private_account" {
        return ApiError::PrivateAccount;
    }
    match status {
        StatusCode::FORBIDDEN => ApiError::Forbidden,
        StatusCode::NOT_FOUND => ApiError::NotFound,
        StatusCode::UNAUTHORIZED => ApiError::BadCredentials,
        _ => ApiError::Unexpected(format!("{status}: {message}")),
    }
}

fn parse_media(item: &Value) -> Media {
    Media {
        media_id: item.get("pk").map(value_to_id).unwrap_or_default(),
        like_count: count(item, "like_count"),
        comment_count: count(item, "comment_count"),
        view_count: count(item, "view_count"),
    }
}

fn count(v: &Value, key: &str) -> u64 {
    v.get(key).and_then(|x| x.as_u64()).unwrap_or(0)
}

/// Instagram serves ids sometimes as numbers, sometimes as strings.
fn value_to_id(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Builds isolated `InstagramHttp` clients; one factory per process.
pub struct InstagramHttpFactory {
    proxy: Option<String>,
}

impl InstagramHttpFactory {
    pub fn new(proxy: Option<String>) -> Self {
        Self { proxy }
    }
}

impl ClientFactory for InstagramHttpFactory {
    fn make(&self) -> Arc<dyn InstagramClient> {
        // Client construction only fails on a malformed proxy url, which is a
        // config problem; fall back to a proxy-less client rather than poison
        // every session.
        let client = InstagramHttp::new(self.proxy.as_deref()).unwrap_or_else(|e| {
            tracing::warn!("instagram client build failed ({e}), retrying without proxy");
            InstagramHttp::new(None).expect("default http client")
        });
        Arc::new(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_two_factor_body() {
        let body = serde_json::json!({
            "status": "fail",
            "two_factor_required": true,
            "two_factor_info": {"two_factor_identifier": "abc"},
        });
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, &body),
            ApiError::TwoFactorRequired
        ));
    }

    #[test]
    fn classify_challenge_and_bad_password() {
        let challenge = serde_json::json!({"status": "fail", "message": "challenge_required"});
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, &challenge),
            ApiError::ChallengeRequired
        ));

        let bad = serde_json::json!({"status": "fail", "error_type": "bad_password"});
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, &bad),
            ApiError::BadCredentials
        ));
    }

    #[test]
    fn classify_throttle_and_http_statuses() {
        let wait = serde_json::json!({"message": "Please wait a few minutes before you try again."});
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, &wait),
            ApiError::Throttled
        ));
        assert!(matches!(
            classify_failure(StatusCode::TOO_MANY_REQUESTS, &Value::Null),
            ApiError::Throttled
        ));
        assert!(matches!(
            classify_failure(StatusCode::FORBIDDEN, &Value::Null),
            ApiError::Forbidden
        ));
        assert!(matches!(
            classify_failure(StatusCode::NOT_FOUND, &Value::Null),
            ApiError::NotFound
        ));
        assert!(matches!(
            classify_failure(StatusCode::INTERNAL_SERVER_ERROR, &Value::Null),
            ApiError::Unexpected(_)
        ));
    }

    #[tokio::test]
    async fn settings_dump_load_round_trip() {
        let a = InstagramHttp::new(None).unwrap();
        {
            let mut st = a.state.lock().await;
            st.username = Some("alice".to_string());
            st.user_id = Some("123".to_string());
            st.absorb_cookie("sessionid=s3cr3t; Path=/; Secure");
            st.authorization = Some("Bearer IGT:2:xyz".to_string());
        }

        let dump = a.dump_settings().await.unwrap();
        assert!(dump.contains("s3cr3t"));

        let b = InstagramHttp::new(None).unwrap();
        b.load_settings(&dump).await.unwrap();
        let st = b.state.lock().await;
        assert_eq!(st.username.as_deref(), Some("alice"));
        assert_eq!(st.cookies.get("sessionid").map(String::as_str), Some("s3cr3t"));
        assert_eq!(st.authorization.as_deref(), Some("Bearer IGT:2:xyz"));
    }

    #[test]
    fn media_ids_accept_numbers_and_strings() {
        let item = serde_json::json!({"pk": 42, "like_count": 3});
        assert_eq!(parse_media(&item).media_id, "42");
        let item = serde_json::json!({"pk": "42", "view_count": 9});
        let media = parse_media(&item);
        assert_eq!(media.media_id, "42");
        assert_eq!(media.view_count, 9);
    }
}
