//! Minimal Transmission daemon served over real HTTP.
//!
//! Enforces the session token handshake and optional basic
//! authentication, answers the methods the engine uses and records
//! every accepted request.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tremote_core::TremoteConfig;
use tremote_core::config::Credentials;
use tremote_core::rpc::SESSION_ID_HEADER;

pub const API_PATH: &str = "/transmission/rpc";

#[derive(Default)]
struct DaemonState {
    session_id: String,
    credentials: Option<(String, String)>,
    torrents: Vec<Value>,
    next_id: i64,
    requests: Vec<(String, Value)>,
    conflicts: usize,
}

/// Handle to a running fake daemon. The server stops when dropped.
pub struct HttpDaemon {
    address: SocketAddr,
    state: Arc<Mutex<DaemonState>>,
    server: JoinHandle<()>,
}

impl HttpDaemon {
    pub async fn start() -> Self {
        Self::start_with_credentials(None).await
    }

    pub async fn start_with_credentials(credentials: Option<(&str, &str)>) -> Self {
        let state = Arc::new(Mutex::new(DaemonState {
            session_id: "first-token".to_string(),
            credentials: credentials.map(|(user, password)| (user.to_string(), password.to_string())),
            next_id: 1,
            ..Default::default()
        }));

        let app = Router::new()
            .route(API_PATH, post(handle_rpc))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind fake daemon");
        let address = listener.local_addr().expect("Listener has no address");
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Fake daemon stopped: {}", e);
            }
        });

        Self {
            address,
            state,
            server,
        }
    }

    /// Engine configuration pointing at this daemon.
    pub fn config(&self) -> TremoteConfig {
        TremoteConfig::for_testing("127.0.0.1", self.address.port())
    }

    pub fn config_with_credentials(&self, username: &str, password: &str) -> TremoteConfig {
        let mut config = self.config();
        config.server.authentication = Some(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        });
        config
    }

    /// Adds a torrent and returns its id.
    pub fn add_torrent(&self, name: &str, percent_done: f64) -> i64 {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.torrents.push(torrent_json(id, name, percent_done));
        id
    }

    pub fn set_percent_done(&self, id: i64, percent_done: f64) {
        let mut state = self.state.lock();
        if let Some(torrent) = state
            .torrents
            .iter_mut()
            .find(|torrent| torrent["id"] == json!(id))
        {
            torrent["percentDone"] = json!(percent_done);
            torrent["leftUntilDone"] = json!(if percent_done >= 1.0 { 0 } else { 1000 });
        }
    }

    /// Invalidates the current session token.
    pub fn rotate_session(&self, session_id: &str) {
        self.state.lock().session_id = session_id.to_string();
    }

    pub fn conflicts(&self) -> usize {
        self.state.lock().conflicts
    }

    pub fn methods(&self) -> Vec<String> {
        self.state
            .lock()
            .requests
            .iter()
            .map(|(method, _)| method.clone())
            .collect()
    }

    pub fn arguments_of(&self, method: &str) -> Vec<Value> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(name, _)| name == method)
            .map(|(_, arguments)| arguments.clone())
            .collect()
    }
}

impl Drop for HttpDaemon {
    fn drop(&mut self) {
        self.server.abort();
    }
}

pub fn torrent_json(id: i64, name: &str, percent_done: f64) -> Value {
    json!({
        "id": id,
        "hashString": format!("{id:040x}"),
        "name": name,
        "status": 4,
        "percentDone": percent_done,
        "leftUntilDone": if percent_done >= 1.0 { 0 } else { 1000 },
        "totalSize": 1000,
        "rateDownload": 0,
        "rateUpload": 0,
        "eta": -1,
        "uploadRatio": 0.0,
    })
}

async fn handle_rpc(
    State(state): State<Arc<Mutex<DaemonState>>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let mut state = state.lock();

    if let Some((user, password)) = &state.credentials {
        let expected = format!("Basic {}", STANDARD.encode(format!("{user}:{password}")));
        let authorized = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == expected);
        if !authorized {
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    }

    let token = headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok());
    if token != Some(state.session_id.as_str()) {
        state.conflicts += 1;
        let mut response = (StatusCode::CONFLICT, "Conflict").into_response();
        if let Ok(value) = HeaderValue::from_str(&state.session_id) {
            response.headers_mut().insert(SESSION_ID_HEADER, value);
        }
        return response;
    }

    let Ok(request) = serde_json::from_str::<Value>(&body) else {
        return (StatusCode::BAD_REQUEST, "Bad request").into_response();
    };
    let method = request["method"].as_str().unwrap_or_default().to_string();
    let arguments = request
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| json!({}));
    state.requests.push((method.clone(), arguments.clone()));

    let reply = answer(&mut state, &method, &arguments);
    (StatusCode::OK, reply.to_string()).into_response()
}

fn answer(state: &mut DaemonState, method: &str, arguments: &Value) -> Value {
    let arguments = match method {
        "session-get" => {
            let wants_free_space = arguments["fields"]
                .as_array()
                .is_some_and(|fields| fields.contains(&json!("download-dir-free-space")));
            if wants_free_space {
                json!({"download-dir-free-space": 5_000_000_000_i64})
            } else {
                json!({
                    "rpc-version": 17,
                    "rpc-version-minimum": 14,
                    "download-dir": "/downloads",
                    "units": {"speed-bytes": 1000},
                })
            }
        }
        "session-stats" => json!({
            "downloadSpeed": 4096,
            "uploadSpeed": 512,
            "current-stats": {"downloadedBytes": 10, "uploadedBytes": 5},
            "cumulative-stats": {"downloadedBytes": 100, "uploadedBytes": 50},
        }),
        "torrent-get" => {
            let ids: Option<Vec<i64>> = arguments["ids"]
                .as_array()
                .map(|ids| ids.iter().filter_map(Value::as_i64).collect());
            let torrents: Vec<&Value> = state
                .torrents
                .iter()
                .filter(|torrent| {
                    ids.as_ref()
                        .is_none_or(|ids| torrent["id"].as_i64().is_some_and(|id| ids.contains(&id)))
                })
                .collect();
            json!({"torrents": torrents})
        }
        "torrent-add" => {
            let id = state.next_id;
            state.next_id += 1;
            let name = format!("added-{id}");
            state.torrents.push(torrent_json(id, &name, 0.0));
            json!({"torrent-added": {"id": id, "name": name}})
        }
        "torrent-remove" => {
            let ids: Vec<i64> = arguments["ids"]
                .as_array()
                .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
                .unwrap_or_default();
            state
                .torrents
                .retain(|torrent| !torrent["id"].as_i64().is_some_and(|id| ids.contains(&id)));
            json!({})
        }
        "torrent-stop" => {
            set_status(state, arguments, 0);
            json!({})
        }
        "torrent-start" | "torrent-start-now" => {
            set_status(state, arguments, 4);
            json!({})
        }
        "free-space" => json!({
            "path": arguments["path"].clone(),
            "size-bytes": 1_000_000,
        }),
        _ => json!({}),
    };
    json!({"result": "success", "arguments": arguments})
}

fn set_status(state: &mut DaemonState, arguments: &Value, status: i64) {
    let ids: Vec<i64> = arguments["ids"]
        .as_array()
        .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default();
    for torrent in &mut state.torrents {
        if torrent["id"].as_i64().is_some_and(|id| ids.contains(&id)) {
            torrent["status"] = json!(status);
        }
    }
}
