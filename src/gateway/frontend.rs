//! Front-end request handling gated on session validation.
//!
//! HTTP parsing stays outside this crate; the front end sees already-parsed
//! [`WorkUnit`]s and hands back [`Reply`] values.

use std::collections::BTreeMap;

use url::form_urlencoded;

use super::session::{AccessDecision, SessionClient};
use super::Connector;

/// Name of the cookie carrying the session token.
pub const SESSION_COOKIE: &str = "session";

pub const UPSTREAM_UNAVAILABLE: &str = "Auth service not responding";

/// One parsed request. Header names are matched case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkUnit {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl WorkUnit {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.header("cookie")?
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    /// The URL the client asked for, as best it can be rebuilt.
    pub fn original_url(&self) -> String {
        let mut url = match self.header("host") {
            Some(host) => format!("http://{host}{}", self.path),
            None => self.path.clone(),
        };
        if let Some(query) = self.query.as_deref().filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

/// What the transport delivers: a request, or notice the client went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    Unit(WorkUnit),
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            headers: vec![("Content-Type".to_string(), "text/html".to_string())],
            body: body.into(),
        }
    }

    pub fn redirect(location: impl Into<String>) -> Self {
        Self {
            status: 302,
            headers: vec![("Location".to_string(), location.into())],
            body: Vec::new(),
        }
    }

    pub fn forbidden() -> Self {
        Self::text(403, "Forbidden")
    }

    pub fn upstream_unavailable() -> Self {
        Self::text(500, UPSTREAM_UNAVAILABLE)
    }

    fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// `{login}?redirect={original}` with the original URL form-encoded.
pub fn redirect_location(login_url: &str, original_url: &str) -> String {
    let encoded: String = form_urlencoded::byte_serialize(original_url.as_bytes()).collect();
    format!("{login_url}?redirect={encoded}")
}

/// Serves authenticated requests.
pub trait App {
    fn respond(&mut self, unit: &WorkUnit) -> Reply;
}

impl<F> App for F
where
    F: FnMut(&WorkUnit) -> Reply,
{
    fn respond(&mut self, unit: &WorkUnit) -> Reply {
        self(unit)
    }
}

pub struct Frontend<C: Connector, A: App> {
    sessions: SessionClient<C>,
    app: A,
}

impl<C: Connector, A: App> Frontend<C, A> {
    pub fn new(sessions: SessionClient<C>, app: A) -> Self {
        Self { sessions, app }
    }

    /// Handle one item. A disconnect produces no reply.
    pub fn handle(&mut self, item: WorkItem) -> Option<Reply> {
        let unit = match item {
            WorkItem::Unit(unit) => unit,
            WorkItem::Disconnect => return None,
        };

        let token = unit.cookie(SESSION_COOKIE).unwrap_or_default();
        let reply = match self.sessions.check(token) {
            AccessDecision::Allow => self.app.respond(&unit),
            AccessDecision::Redirect(login) => {
                Reply::redirect(redirect_location(&login, &unit.original_url()))
            }
            AccessDecision::Denied => Reply::forbidden(),
            AccessDecision::UpstreamUnavailable => Reply::upstream_unavailable(),
        };
        Some(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work_unit(headers: &[(&str, &str)]) -> WorkUnit {
        WorkUnit {
            method: "GET".to_string(),
            path: "/admin/hosts".to_string(),
            query: Some("page=2&q=a b".to_string()),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: Vec::new(),
        }
    }

    #[test]
    fn test_cookie_extraction() {
        let unit = work_unit(&[("Cookie", "theme=dark; session=abc123; x=y")]);
        assert_eq!(unit.cookie("session"), Some("abc123"));
        assert_eq!(unit.cookie("missing"), None);
        assert_eq!(work_unit(&[]).cookie("session"), None);
    }

    #[test]
    fn test_original_url_and_redirect_location() {
        let unit = work_unit(&[("Host", "example.test")]);
        assert_eq!(unit.original_url(), "http://example.test/admin/hosts?page=2&q=a b");

        let location = redirect_location("/login", &unit.original_url());
        assert_eq!(
            location,
            "/login?redirect=http%3A%2F%2Fexample.test%2Fadmin%2Fhosts%3Fpage%3D2%26q%3Da+b"
        );
    }

    #[test]
    fn test_reply_constructors() {
        let reply = Reply::redirect("/login?redirect=x");
        assert_eq!(reply.status, 302);
        assert_eq!(reply.header("location"), Some("/login?redirect=x"));

        let reply = Reply::upstream_unavailable();
        assert_eq!(reply.status, 500);
        assert_eq!(reply.body, UPSTREAM_UNAVAILABLE.as_bytes());
    }
}
