//! Request routing: retries, session token rotation and reply parsing
//!
//! `RequestRouter` owns every in-flight request. Network round-trips run
//! as tokio tasks and JSON parsing runs on the blocking pool; both report
//! back through a single `TransportEvent` channel that the owner drains
//! and feeds into `on_event`. An event whose request is no longer in the
//! registry belongs to a cancelled request and is dropped.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use super::client::{HttpClient, HttpReply, HttpRequest, NetworkError, NetworkErrorKind};
use super::tls::{ExpectedTlsErrors, TlsError};
use super::{RequestFailure, Response, RpcErrorKind, SESSION_ID_HEADER, encode_request, parse_response};
use crate::config::{ConfigError, ConnectionConfig, ProxyConfig, ServerConfig};
use crate::model::JsonObject;

/// Identifies a request for the whole of its life, retries included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

/// Completion of a background step of some request.
#[derive(Debug)]
pub enum TransportEvent {
    Finished {
        id: RequestId,
        result: Result<HttpReply, NetworkError>,
    },
    Parsed {
        id: RequestId,
        result: Result<Response, String>,
    },
}

/// What a processed event means for the caller.
#[derive(Debug)]
pub enum RouterOutput<T> {
    /// The daemon answered; `response.success` tells whether the call worked
    Response {
        tag: T,
        method: String,
        response: Response,
    },
    /// The request failed for good
    Failed {
        tag: T,
        method: String,
        failure: RequestFailure,
    },
}

struct Endpoint {
    url: Url,
    client: Arc<dyn HttpClient>,
    retry_attempts: u32,
    expected_tls_errors: ExpectedTlsErrors,
}

struct PendingRequest<T> {
    method: String,
    body: Bytes,
    tag: T,
    retry_attempts: u32,
    /// Token the current attempt was sent with
    session_id: Option<String>,
    task: JoinHandle<()>,
}

struct PendingParse<T> {
    method: String,
    tag: T,
    task: JoinHandle<()>,
}

/// Submits RPC requests and turns their completions into typed results.
///
/// `T` is an opaque tag returned with the outcome, telling the caller
/// what to do with it.
pub struct RequestRouter<T> {
    endpoint: Option<Endpoint>,
    session_id: Option<String>,
    next_id: u64,
    pending_requests: HashMap<RequestId, PendingRequest<T>>,
    pending_parses: HashMap<RequestId, PendingParse<T>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl<T> RequestRouter<T> {
    /// Creates an unconfigured router and the receiver of its events.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let router = Self {
            endpoint: None,
            session_id: None,
            next_id: 0,
            pending_requests: HashMap::new(),
            pending_parses: HashMap::new(),
            events,
        };
        (router, receiver)
    }

    /// Points the router at a daemon. Cancels everything in flight.
    ///
    /// # Errors
    /// - `ConfigError::InvalidServerUrl` - Address does not form a valid URL
    /// - `ConfigError::InvalidCertificate` - Pinned chain is not valid PEM
    pub fn set_configuration(
        &mut self,
        server: &ServerConfig,
        connection: &ConnectionConfig,
        client: Arc<dyn HttpClient>,
    ) -> Result<(), ConfigError> {
        self.cancel_all();

        let url = server.url()?;
        let expected_tls_errors = if server.https {
            ExpectedTlsErrors::from_pinned_chain(&server.server_certificate_chain)?
        } else {
            ExpectedTlsErrors::default()
        };

        tracing::debug!("Connection configuration:");
        tracing::debug!(" - Server url: {url}");
        if server.proxy != ProxyConfig::Default {
            tracing::debug!(" - Proxy: {:?}", server.proxy);
        }
        tracing::debug!(" - Timeout: {:?}", connection.timeout);
        tracing::debug!(
            " - HTTP Basic access authentication: {}",
            server.authentication.is_some()
        );
        if server.https {
            tracing::debug!(
                " - Manually validating server's certificate chain: {}",
                !server.server_certificate_chain.is_empty()
            );
            tracing::debug!(
                " - Client certificate authentication: {}",
                server.client_identity.is_some()
            );
        }

        self.endpoint = Some(Endpoint {
            url,
            client,
            retry_attempts: connection.retry_attempts,
            expected_tls_errors,
        });
        Ok(())
    }

    pub fn reset_configuration(&mut self) {
        self.cancel_all();
        self.endpoint = None;
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn url(&self) -> Option<&Url> {
        self.endpoint.as_ref().map(|endpoint| &endpoint.url)
    }

    /// Current session token, if the daemon issued one.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn has_pending_requests(&self) -> bool {
        !self.pending_requests.is_empty() || !self.pending_parses.is_empty()
    }

    /// Issues `method` with `arguments`. Returns `None` when unconfigured.
    pub fn post_request(&mut self, method: &str, arguments: JsonObject, tag: T) -> Option<RequestId> {
        let Some(endpoint) = &self.endpoint else {
            tracing::warn!("Dropping '{method}' request: no server configured");
            return None;
        };

        let body = match encode_request(method, &arguments) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                tracing::error!("Failed to serialize '{method}' request: {e}");
                return None;
            }
        };

        let id = RequestId(self.next_id);
        self.next_id += 1;

        tracing::trace!("Posting '{method}' request {id:?}");
        let task = spawn_attempt(endpoint, &self.events, id, body.clone(), self.session_id.clone());
        self.pending_requests.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                body,
                tag,
                retry_attempts: 0,
                session_id: self.session_id.clone(),
                task,
            },
        );
        Some(id)
    }

    /// Aborts every pending request and parse, and forgets the session token.
    pub fn cancel_all(&mut self) {
        for (_, pending) in self.pending_requests.drain() {
            pending.task.abort();
        }
        for (_, parse) in self.pending_parses.drain() {
            parse.task.abort();
        }
        self.session_id = None;
    }

    /// Advances the request an event belongs to.
    ///
    /// Returns an output once the request produced its final outcome.
    pub fn on_event(&mut self, event: TransportEvent) -> Option<RouterOutput<T>> {
        match event {
            TransportEvent::Finished { id, result } => {
                let Some(pending) = self.pending_requests.remove(&id) else {
                    tracing::trace!("Ignoring completion of cancelled request {id:?}");
                    return None;
                };
                self.on_request_finished(id, pending, result)
            }
            TransportEvent::Parsed { id, result } => {
                let Some(parse) = self.pending_parses.remove(&id) else {
                    tracing::trace!("Ignoring parse result of cancelled request {id:?}");
                    return None;
                };
                match result {
                    Ok(response) => {
                        if !response.success {
                            tracing::warn!(
                                "method '{}' failed, result: {}",
                                parse.method,
                                response.result
                            );
                        }
                        Some(RouterOutput::Response {
                            tag: parse.tag,
                            method: parse.method,
                            response,
                        })
                    }
                    Err(error) => {
                        tracing::warn!("{error}");
                        Some(RouterOutput::Failed {
                            tag: parse.tag,
                            method: parse.method,
                            failure: RequestFailure {
                                kind: RpcErrorKind::ParseError,
                                message: "Failed to parse server response".to_string(),
                                detailed_message: error,
                            },
                        })
                    }
                }
            }
        }
    }

    fn on_request_finished(
        &mut self,
        id: RequestId,
        pending: PendingRequest<T>,
        result: Result<HttpReply, NetworkError>,
    ) -> Option<RouterOutput<T>> {
        let endpoint = self.endpoint.as_ref()?;

        match result {
            Ok(reply) if reply.is_success() => {
                tracing::debug!(
                    "HTTP request for method '{}' succeeded, HTTP status code: {} {}",
                    pending.method,
                    reply.status,
                    reply.reason
                );
                log_unexpected_tls_errors(endpoint, &reply.tls_errors);

                let events = self.events.clone();
                let body = reply.body;
                let task = tokio::task::spawn_blocking(move || {
                    let result = parse_response(&body).map_err(|e| {
                        format!(
                            "Failed to parse JSON reply from server:\n{}\nError '{e}' at line {}, column {}",
                            String::from_utf8_lossy(&body),
                            e.line(),
                            e.column()
                        )
                    });
                    let _ = events.send(TransportEvent::Parsed { id, result });
                });
                self.pending_parses.insert(
                    id,
                    PendingParse {
                        method: pending.method,
                        tag: pending.tag,
                        task,
                    },
                );
                None
            }
            Ok(reply) => {
                if reply.status == 409 {
                    if let Some(new_session_id) = reply.header(SESSION_ID_HEADER) {
                        // Compared against the token of this request, the current one
                        // may already have been replaced by another conflicting request
                        if Some(new_session_id) != pending.session_id.as_deref() {
                            if self.session_id.is_some() {
                                tracing::info!("Session id changed");
                            }
                            tracing::debug!(
                                "Session id is {new_session_id}, retrying '{}' request",
                                pending.method
                            );
                            self.session_id = Some(new_session_id.to_string());
                            self.resubmit(id, pending);
                            return None;
                        }
                    }
                }

                let tls_errors = log_unexpected_tls_errors(endpoint, &reply.tls_errors);
                let message = format!("Server replied {} {}", reply.status, reply.reason);
                let detailed_message =
                    detailed_error_message("HTTP error", &message, &endpoint.url, Some(&reply), &tls_errors);
                tracing::warn!(
                    "HTTP request for method '{}' failed:\n{detailed_message}",
                    pending.method
                );

                if reply.status == 401 {
                    tracing::warn!("Authentication error");
                    return Some(RouterOutput::Failed {
                        tag: pending.tag,
                        method: pending.method,
                        failure: RequestFailure {
                            kind: RpcErrorKind::AuthenticationError,
                            message,
                            detailed_message,
                        },
                    });
                }
                self.retry_or_fail(id, pending, RpcErrorKind::ConnectionError, message, detailed_message)
            }
            Err(error) => {
                let tls_errors = log_unexpected_tls_errors(endpoint, &error.tls_errors);
                let detailed_message = detailed_error_message(
                    &format!("{:?}", error.kind),
                    &error.description,
                    &endpoint.url,
                    None,
                    &tls_errors,
                );
                tracing::warn!(
                    "HTTP request for method '{}' failed:\n{detailed_message}",
                    pending.method
                );

                let kind = match error.kind {
                    NetworkErrorKind::TimedOut | NetworkErrorKind::Cancelled => {
                        tracing::warn!("Timed out");
                        RpcErrorKind::TimedOut
                    }
                    _ => RpcErrorKind::ConnectionError,
                };
                self.retry_or_fail(id, pending, kind, error.description, detailed_message)
            }
        }
    }

    fn retry_or_fail(
        &mut self,
        id: RequestId,
        mut pending: PendingRequest<T>,
        kind: RpcErrorKind,
        message: String,
        detailed_message: String,
    ) -> Option<RouterOutput<T>> {
        let budget = self.endpoint.as_ref()?.retry_attempts;

        pending.retry_attempts += 1;
        if pending.retry_attempts > budget {
            return Some(RouterOutput::Failed {
                tag: pending.tag,
                method: pending.method,
                failure: RequestFailure {
                    kind,
                    message,
                    detailed_message,
                },
            });
        }

        tracing::warn!(
            "Retrying '{}' request, retry attempts = {}",
            pending.method,
            pending.retry_attempts
        );
        self.resubmit(id, pending);
        None
    }

    /// Sends another attempt of `pending` with the current session token.
    fn resubmit(&mut self, id: RequestId, mut pending: PendingRequest<T>) {
        let Some(endpoint) = &self.endpoint else {
            return;
        };
        pending.session_id = self.session_id.clone();
        pending.task = spawn_attempt(
            endpoint,
            &self.events,
            id,
            pending.body.clone(),
            pending.session_id.clone(),
        );
        self.pending_requests.insert(id, pending);
    }

    #[cfg(test)]
    pub(crate) fn pending_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .pending_requests
            .values()
            .map(|pending| pending.method.clone())
            .chain(self.pending_parses.values().map(|parse| parse.method.clone()))
            .collect();
        methods.sort();
        methods
    }
}

fn spawn_attempt(
    endpoint: &Endpoint,
    events: &mpsc::UnboundedSender<TransportEvent>,
    id: RequestId,
    body: Bytes,
    session_id: Option<String>,
) -> JoinHandle<()> {
    let client = Arc::clone(&endpoint.client);
    let events = events.clone();
    let request = HttpRequest {
        url: endpoint.url.clone(),
        session_id,
        body,
    };
    tokio::spawn(async move {
        let result = client.post(request).await;
        let _ = events.send(TransportEvent::Finished { id, result });
    })
}

fn log_unexpected_tls_errors(endpoint: &Endpoint, errors: &[TlsError]) -> Vec<TlsError> {
    let unexpected = endpoint.expected_tls_errors.unexpected(errors);
    for error in &unexpected {
        tracing::warn!("TLS error {error}");
    }
    unexpected
}

/// Diagnostic dump of a failed exchange.
pub(crate) fn detailed_error_message(
    error: &str,
    description: &str,
    request_url: &Url,
    reply: Option<&HttpReply>,
    tls_errors: &[TlsError],
) -> String {
    let mut message = format!("{error}: {description}");

    match reply {
        Some(reply) if reply.url != *request_url => {
            let _ = write!(
                message,
                "\nOriginal URL: {request_url}\nRedirected URL: {}",
                reply.url
            );
        }
        _ => {
            let _ = write!(message, "\nURL: {request_url}");
        }
    }

    match reply {
        Some(reply) => {
            let _ = write!(
                message,
                "\nHTTP status code: {} {}\nConnection was encrypted: {}",
                reply.status, reply.reason, reply.encrypted
            );
            if !reply.headers.is_empty() {
                message.push_str("\nReply headers:");
                for (name, value) in &reply.headers {
                    let _ = write!(message, "\n  {name}: {value}");
                }
            }
        }
        None => message.push_str("\nDid not establish HTTP connection"),
    }

    if !tls_errors.is_empty() {
        let _ = write!(message, "\n\n{} TLS errors:", tls_errors.len());
        for (i, error) in tls_errors.iter().enumerate() {
            let _ = write!(message, "\n\n {}. {error}", i + 1);
        }
    }

    message
}
