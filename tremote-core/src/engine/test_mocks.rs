//! In-process HTTP clients for tests.
//!
//! `ScriptedClient` replays a queue of canned replies and records what was
//! sent. `FakeDaemon` answers the RPC methods the engine issues from an
//! in-memory torrent list, enforcing the session token like the real
//! daemon does.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Value, json};
use url::Url;

use crate::model::JsonObject;
use crate::rpc::{
    HttpClient, HttpReply, HttpRequest, NetworkError, NetworkErrorKind, SESSION_ID_HEADER,
};

/// Builds a reply with the given status line and body.
pub fn reply(status: u16, reason: &str, body: &str) -> HttpReply {
    HttpReply {
        url: Url::parse("http://localhost:9091/transmission/rpc").expect("static URL is valid"),
        status,
        reason: reason.to_string(),
        encrypted: false,
        headers: Vec::new(),
        body: Bytes::from(body.to_string()),
        tls_errors: Vec::new(),
    }
}

/// A 200 reply carrying `{"result": "success", "arguments": arguments}`.
pub fn rpc_success(arguments: Value) -> HttpReply {
    let body = json!({"result": "success", "arguments": arguments});
    reply(200, "OK", &body.to_string())
}

/// A 409 reply handing out `token`.
pub fn conflict(token: &str) -> HttpReply {
    let mut conflict = reply(409, "Conflict", "");
    conflict
        .headers
        .push((SESSION_ID_HEADER.to_string(), token.to_string()));
    conflict
}

pub fn network_error(kind: NetworkErrorKind) -> NetworkError {
    NetworkError::new(kind, format!("Simulated {kind:?} error"))
}

/// Replays queued results in order, one per request.
#[derive(Default)]
pub struct ScriptedClient {
    replies: Mutex<VecDeque<Result<HttpReply, NetworkError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: Result<HttpReply, NetworkError>) {
        self.replies.lock().push_back(result);
    }

    /// Session token of every request sent so far.
    pub fn session_ids(&self) -> Vec<Option<String>> {
        self.requests
            .lock()
            .iter()
            .map(|request| request.session_id.clone())
            .collect()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl HttpClient for ScriptedClient {
    async fn post(&self, request: HttpRequest) -> Result<HttpReply, NetworkError> {
        let url = request.url.clone();
        self.requests.lock().push(request);

        let next = self.replies.lock().pop_front();
        match next {
            Some(Ok(mut reply)) => {
                reply.url = url;
                Ok(reply)
            }
            Some(Err(error)) => Err(error),
            None => Err(NetworkError::new(
                NetworkErrorKind::Connection,
                "No scripted reply left",
            )),
        }
    }
}

type HoldPredicate = Box<dyn Fn(&str, &JsonObject) -> bool + Send>;

struct DaemonState {
    session_id: String,
    rpc_version: i64,
    minimum_rpc_version: i64,
    torrents: Vec<Value>,
    download_dir_free_space: i64,
    /// Whole reply bodies replacing the default answer of a method
    overrides: HashMap<String, Value>,
    held: Option<HoldPredicate>,
    requests: Vec<(String, JsonObject)>,
}

/// Answers RPC methods from memory.
pub struct FakeDaemon {
    state: Mutex<DaemonState>,
}

impl Default for FakeDaemon {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDaemon {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DaemonState {
                session_id: "fake-session".to_string(),
                rpc_version: 17,
                minimum_rpc_version: 14,
                torrents: Vec::new(),
                download_dir_free_space: 1 << 30,
                overrides: HashMap::new(),
                held: None,
                requests: Vec::new(),
            }),
        }
    }

    pub fn with_rpc_version(self, rpc_version: i64, minimum_rpc_version: i64) -> Self {
        {
            let mut state = self.state.lock();
            state.rpc_version = rpc_version;
            state.minimum_rpc_version = minimum_rpc_version;
        }
        self
    }

    /// Replaces the torrent list. Entries are returned as they are by
    /// `torrent-get`, whatever fields were asked for.
    pub fn set_torrents(&self, torrents: Vec<Value>) {
        self.state.lock().torrents = torrents;
    }

    /// Forces every client to rotate its token.
    pub fn set_session_id(&self, session_id: &str) {
        self.state.lock().session_id = session_id.to_string();
    }

    /// Replies to `method` with `body` instead of the default answer.
    pub fn set_reply(&self, method: &str, body: Value) {
        self.state.lock().overrides.insert(method.to_string(), body);
    }

    /// Requests for which `predicate(method, arguments)` holds are never answered.
    pub fn hold_requests(&self, predicate: impl Fn(&str, &JsonObject) -> bool + Send + 'static) {
        self.state.lock().held = Some(Box::new(predicate));
    }

    pub fn release_requests(&self) {
        self.state.lock().held = None;
    }

    /// Methods of the requests that passed the session check, in order.
    pub fn methods(&self) -> Vec<String> {
        self.state
            .lock()
            .requests
            .iter()
            .map(|(method, _)| method.clone())
            .collect()
    }

    /// Arguments of every accepted request of `method`.
    pub fn arguments_of(&self, method: &str) -> Vec<JsonObject> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(name, _)| name == method)
            .map(|(_, arguments)| arguments.clone())
            .collect()
    }

    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }

    fn answer(state: &DaemonState, method: &str, arguments: &JsonObject) -> Value {
        if let Some(body) = state.overrides.get(method) {
            return body.clone();
        }

        let arguments = match method {
            "session-get" => {
                let wants_free_space = arguments
                    .get("fields")
                    .and_then(Value::as_array)
                    .is_some_and(|fields| fields.contains(&json!("download-dir-free-space")));
                if wants_free_space {
                    json!({"download-dir-free-space": state.download_dir_free_space})
                } else {
                    json!({
                        "rpc-version": state.rpc_version,
                        "rpc-version-minimum": state.minimum_rpc_version,
                        "download-dir": "/downloads",
                        "units": {"speed-bytes": 1000},
                    })
                }
            }
            "torrent-get" => {
                let ids: Option<Vec<i64>> = arguments
                    .get("ids")
                    .and_then(Value::as_array)
                    .map(|ids| ids.iter().filter_map(Value::as_i64).collect());
                let torrents: Vec<&Value> = state
                    .torrents
                    .iter()
                    .filter(|torrent| {
                        ids.as_ref().is_none_or(|ids| {
                            torrent
                                .get("id")
                                .and_then(Value::as_i64)
                                .is_some_and(|id| ids.contains(&id))
                        })
                    })
                    .collect();
                json!({"torrents": torrents})
            }
            "session-stats" => json!({
                "downloadSpeed": 2048,
                "uploadSpeed": 1024,
                "current-stats": {"downloadedBytes": 100, "uploadedBytes": 50},
                "cumulative-stats": {"downloadedBytes": 1000, "uploadedBytes": 500},
            }),
            "torrent-add" => json!({"torrent-added": {"id": 100, "name": "added"}}),
            "free-space" => json!({
                "path": arguments.get("path").cloned().unwrap_or(Value::Null),
                "size-bytes": state.download_dir_free_space,
            }),
            "torrent-rename-path" => json!({
                "path": arguments.get("path").cloned().unwrap_or(Value::Null),
                "name": arguments.get("name").cloned().unwrap_or(Value::Null),
            }),
            _ => json!({}),
        };
        json!({"result": "success", "arguments": arguments})
    }
}

#[async_trait]
impl HttpClient for FakeDaemon {
    async fn post(&self, request: HttpRequest) -> Result<HttpReply, NetworkError> {
        let envelope: Value = serde_json::from_slice(&request.body)
            .map_err(|e| NetworkError::new(NetworkErrorKind::Other, e.to_string()))?;
        let method = envelope
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let arguments = envelope
            .get("arguments")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let answer = {
            let mut state = self.state.lock();
            if request.session_id.as_deref() != Some(state.session_id.as_str()) {
                let mut reply = conflict(&state.session_id);
                reply.url = request.url;
                return Ok(reply);
            }
            state.requests.push((method.clone(), arguments.clone()));
            if state.held.as_ref().is_some_and(|held| held(&method, &arguments)) {
                None
            } else {
                Some(Self::answer(&state, &method, &arguments))
            }
        };

        let Some(answer) = answer else {
            return futures::future::pending().await;
        };

        let mut reply = reply(200, "OK", &answer.to_string());
        reply.url = request.url;
        Ok(reply)
    }
}
