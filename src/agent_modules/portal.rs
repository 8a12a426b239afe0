//! [`AutomationBackend`] for Dr.COM-style portals driven over plain HTTP.
use async_trait::async_trait;
use encoding_rs::{Encoding, GBK};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, Url};
use tracing::{debug, info};

use super::session::{AuthenticationOutcome, AutomationBackend, BackendError, Credentials, SessionSettings};

/// Page text that means the client already holds a login.
const ALREADY_LOGGED_IN_MARKERS: &[&str] = &[
    "您已登录",
    "成功登录",
    "在线用户",
    "当前在线",
    "注销",
    "登出",
    "already logged in",
    "online user",
    "logout",
];

const SUCCESS_MARKERS: &[&str] = &["登录成功", "认证成功", "login successful", "successfully logged in"];

const FAILURE_MARKERS: &[&str] = &[
    "认证失败",
    "登录失败",
    "用户名或密码错误",
    "账号或密码",
    "用户不存在",
    "密码错误",
    "账户被锁定",
    "网络异常",
    "incorrect",
    "authentication failed",
    "login failed",
    "invalid username or password",
];

/// Field names of the login form.
#[derive(Debug, Clone)]
pub struct PortalForm {
    pub username_field: String,
    pub password_field: String,
    pub carrier_field: String,
    pub submit_field: String,
    pub submit_value: String,
}

impl Default for PortalForm {
    fn default() -> Self {
        Self {
            username_field: "DDDDD".to_string(),
            password_field: "upass".to_string(),
            carrier_field: "ISP_select".to_string(),
            submit_field: "0MKKey".to_string(),
            submit_value: "123456".to_string(),
        }
    }
}

pub struct HttpPortalBackend {
    portal_url: String,
    form: PortalForm,
}

impl HttpPortalBackend {
    pub fn new(portal_url: impl Into<String>) -> Self {
        Self {
            portal_url: portal_url.into(),
            form: PortalForm::default(),
        }
    }
}

/// The portal as last seen by one session.
pub struct PortalPage {
    client: Client,
    url: Url,
    body: String,
    credentials: Credentials,
}

#[async_trait]
impl AutomationBackend for HttpPortalBackend {
    type Handle = PortalPage;

    async fn open(
        &self,
        credentials: &Credentials,
        settings: &SessionSettings,
    ) -> Result<PortalPage, BackendError> {
        let url = Url::parse(&self.portal_url)
            .map_err(|e| BackendError::Navigation(format!("invalid portal url: {e}")))?;
        let client = Client::builder()
            .timeout(settings.timeout)
            .user_agent(settings.user_agent.clone())
            .no_proxy()
            .build()
            .map_err(|e| BackendError::Launch(e.to_string()))?;

        let body = read_page(client.get(url.clone())).await?;
        debug!(url = %url, bytes = body.len(), "Portal page loaded.");
        Ok(PortalPage {
            client,
            url,
            body,
            credentials: credentials.clone(),
        })
    }

    async fn detect_already_authenticated(&self, page: &mut PortalPage) -> bool {
        match find_marker(&page.body, ALREADY_LOGGED_IN_MARKERS) {
            Some(marker) => {
                info!(marker, "Portal reports an active login.");
                true
            }
            None => false,
        }
    }

    async fn submit_credentials(&self, page: &mut PortalPage) -> Result<(), BackendError> {
        let target = form_action(&page.body, &page.url);
        let creds = &page.credentials;
        let mut fields: Vec<(&str, &str)> = vec![
            (self.form.username_field.as_str(), creds.username.as_str()),
            (self.form.password_field.as_str(), creds.password.as_str()),
            (self.form.submit_field.as_str(), self.form.submit_value.as_str()),
        ];
        if !creds.carrier_suffix.trim().is_empty() {
            fields.push((self.form.carrier_field.as_str(), creds.carrier_suffix.trim()));
        }

        debug!(action = %target, username = %creds.username, "Submitting login form.");
        page.body = read_page(page.client.post(target.clone()).form(&fields)).await?;
        page.url = target;
        Ok(())
    }

    async fn interpret_result(&self, page: &mut PortalPage) -> AuthenticationOutcome {
        if let Some(marker) = find_marker(&page.body, SUCCESS_MARKERS)
            .or_else(|| find_marker(&page.body, ALREADY_LOGGED_IN_MARKERS))
        {
            return AuthenticationOutcome::succeeded(format!("portal reported '{marker}'"));
        }
        if let Some(marker) = find_marker(&page.body, FAILURE_MARKERS) {
            return AuthenticationOutcome::failed(format!("login failed: portal reported '{marker}'"));
        }
        AuthenticationOutcome::failed("login failed: no success marker found on the portal page")
    }

    async fn close(&self, page: PortalPage) -> Result<(), BackendError> {
        debug!(url = %page.url, "Closing portal session.");
        drop(page);
        Ok(())
    }
}

async fn read_page(request: RequestBuilder) -> Result<String, BackendError> {
    let response = request.send().await.map_err(request_error)?;
    let status = response.status();
    if !status.is_success() {
        return Err(BackendError::Navigation(format!("portal returned HTTP {status}")));
    }
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = response.bytes().await.map_err(request_error)?;
    Ok(decode_body(&bytes, content_type.as_deref()))
}

fn request_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Navigation("request timeout".to_string())
    } else if e.is_connect() {
        BackendError::Navigation(format!("connection failed: {e}"))
    } else {
        BackendError::Navigation(e.to_string())
    }
}

fn find_marker<'a>(body: &str, markers: &[&'a str]) -> Option<&'a str> {
    let lower = body.to_lowercase();
    markers.iter().copied().find(|m| lower.contains(&m.to_lowercase()))
}

fn charset_of(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"'))
    })
}

/// Decodes a page with its declared charset; undeclared pages that are not
/// valid UTF-8 are read as GBK, which most campus portals serve.
pub fn decode_body(bytes: &[u8], content_type: Option<&str>) -> String {
    let declared = content_type
        .and_then(charset_of)
        .and_then(|label| Encoding::for_label(label.as_bytes()));
    if let Some(encoding) = declared {
        let (text, _, _) = encoding.decode(bytes);
        return text.into_owned();
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let (text, _, _) = GBK.decode(bytes);
            text.into_owned()
        }
    }
}

/// Target of the first `<form>` on the page, resolved against `base`.
fn form_action(body: &str, base: &Url) -> Url {
    // ASCII lowercasing keeps byte offsets aligned with `body`.
    let lower = body.to_ascii_lowercase();
    let Some(form_at) = lower.find("<form") else {
        return base.clone();
    };
    let tag_end = lower[form_at..].find('>').map_or(lower.len(), |i| form_at + i);
    let Some(attr_at) = lower[form_at..tag_end].find("action=") else {
        return base.clone();
    };
    let rest = &body[form_at + attr_at + "action=".len()..tag_end];
    let value = match rest.chars().next() {
        Some(quote @ ('"' | '\'')) => rest[1..].split(quote).next().unwrap_or(""),
        _ => rest.split(|c: char| c.is_whitespace()).next().unwrap_or(""),
    };

    match base.join(value.trim()) {
        Ok(url) if !value.trim().is_empty() && matches!(url.scheme(), "http" | "https") => url,
        _ => base.clone(),
    }
}
