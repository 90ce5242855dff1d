/// Blocking JSON transport used by the REST client.
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;

use crate::error::FetchError;

/// One outbound JSON call. Implementations block; the client runs them on
/// the blocking pool.
pub trait Transport: Send + Sync + 'static {
    fn get_json(&self, url: &str) -> Result<Value, FetchError>;
    fn post_json(&self, url: &str, body: &Value) -> Result<Value, FetchError>;
}

/// `Authorization` header value for a personal access token.
pub fn basic_auth_header(token: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!(":{}", token)))
}

/// Production transport on `ureq`.
pub struct UreqTransport {
    agent: ureq::Agent,
    authorization: String,
}

impl UreqTransport {
    pub fn new(token: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(concat!("wits/", env!("CARGO_PKG_VERSION")))
            .build();
        Self {
            agent,
            authorization: basic_auth_header(token),
        }
    }

    fn finish(url: &str, result: Result<ureq::Response, ureq::Error>) -> Result<Value, FetchError> {
        match result {
            Ok(response) => response.into_json::<Value>().map_err(|e| FetchError::Decode {
                url: url.to_string(),
                message: e.to_string(),
            }),
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(FetchError::Status {
                    url: url.to_string(),
                    status,
                    body: body.chars().take(500).collect(),
                })
            }
            Err(ureq::Error::Transport(transport)) => Err(FetchError::Transport {
                url: url.to_string(),
                message: transport.to_string(),
            }),
        }
    }
}

impl Transport for UreqTransport {
    fn get_json(&self, url: &str) -> Result<Value, FetchError> {
        let result = self
            .agent
            .get(url)
            .set("Accept", "application/json")
            .set("Authorization", &self.authorization)
            .call();
        Self::finish(url, result)
    }

    fn post_json(&self, url: &str, body: &Value) -> Result<Value, FetchError> {
        let result = self
            .agent
            .post(url)
            .set("Accept", "application/json")
            .set("Authorization", &self.authorization)
            .send_json(body);
        Self::finish(url, result)
    }
}

/// A call seen by [`ScriptedTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: &'static str,
    pub url: String,
    pub body: Option<Value>,
}

struct Route {
    fragment: String,
    responses: VecDeque<Result<Value, u16>>,
}

/// In-memory transport for tests.
///
/// Responses are registered against a URL fragment; the first route whose
/// fragment occurs in the requested URL answers. A route with several queued
/// responses hands them out in order and repeats the last one. Unmatched URLs
/// answer HTTP 404.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer URLs containing `fragment` with `body`.
    pub fn respond(self, fragment: &str, body: Value) -> Self {
        self.push(fragment, Ok(body));
        self
    }

    /// Answer URLs containing `fragment` with an HTTP error status.
    pub fn fail(self, fragment: &str, status: u16) -> Self {
        self.push(fragment, Err(status));
        self
    }

    fn push(&self, fragment: &str, response: Result<Value, u16>) {
        let mut routes = self.routes.lock();
        if let Some(route) = routes.iter_mut().find(|r| r.fragment == fragment) {
            route.responses.push_back(response);
        } else {
            routes.push(Route {
                fragment: fragment.to_string(),
                responses: VecDeque::from([response]),
            });
        }
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Number of calls whose URL contains `fragment`.
    pub fn call_count(&self, fragment: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.url.contains(fragment))
            .count()
    }

    fn answer(&self, method: &'static str, url: &str, body: Option<&Value>) -> Result<Value, FetchError> {
        self.calls.lock().push(RecordedCall {
            method,
            url: url.to_string(),
            body: body.cloned(),
        });

        let mut routes = self.routes.lock();
        let response = routes
            .iter_mut()
            .find(|r| url.contains(&r.fragment))
            .and_then(|route| {
                if route.responses.len() > 1 {
                    route.responses.pop_front()
                } else {
                    route.responses.front().cloned()
                }
            });

        match response {
            Some(Ok(value)) => Ok(value),
            Some(Err(status)) => Err(FetchError::Status {
                url: url.to_string(),
                status,
                body: String::new(),
            }),
            None => Err(FetchError::Status {
                url: url.to_string(),
                status: 404,
                body: "no scripted response".to_string(),
            }),
        }
    }
}

impl Transport for ScriptedTransport {
    fn get_json(&self, url: &str) -> Result<Value, FetchError> {
        self.answer("GET", url, None)
    }

    fn post_json(&self, url: &str, body: &Value) -> Result<Value, FetchError> {
        self.answer("POST", url, Some(body))
    }
}
