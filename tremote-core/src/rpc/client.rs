//! HTTP client seam and its reqwest implementation

use std::error::Error as StdError;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Identity, Proxy};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use url::Url;

use super::SESSION_ID_HEADER;
use super::tls::{PinnedCertificateVerifier, TlsError, pem_blocks, tls_rejection};
use crate::config::{
    ClientIdentity, ConfigError, ConnectionConfig, ProxyConfig, ProxyEndpoint, ServerConfig,
};

/// One RPC POST.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: Url,
    /// Session token the request is sent with
    pub session_id: Option<String>,
    pub body: Bytes,
}

/// Any HTTP response, whatever its status.
#[derive(Debug, Clone)]
pub struct HttpReply {
    /// Final URL, after redirects
    pub url: Url,
    pub status: u16,
    pub reason: String,
    pub encrypted: bool,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub tls_errors: Vec<TlsError>,
}

impl HttpReply {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    TimedOut,
    Cancelled,
    Tls,
    Connection,
    Other,
}

/// Failure to obtain any HTTP response.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {description}")]
pub struct NetworkError {
    pub kind: NetworkErrorKind,
    pub description: String,
    pub tls_errors: Vec<TlsError>,
}

impl NetworkError {
    pub fn new(kind: NetworkErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            tls_errors: Vec::new(),
        }
    }
}

/// Sends RPC requests to the daemon.
///
/// Non-2xx statuses are successful exchanges at this level; only the
/// absence of a response is an error.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn post(&self, request: HttpRequest) -> Result<HttpReply, NetworkError>;
}

/// `HttpClient` backed by a pooled `reqwest::Client`.
pub struct ReqwestClient {
    client: reqwest::Client,
    credentials: Option<(String, String)>,
}

impl ReqwestClient {
    /// Builds a client for the given daemon.
    ///
    /// With a pinned certificate chain the daemon is verified by
    /// `PinnedCertificateVerifier` alone; otherwise the bundled web roots
    /// apply.
    ///
    /// # Errors
    /// - `ConfigError::InvalidProxy` - Proxy address cannot be parsed
    /// - `ConfigError::InvalidCertificate` - Pinned chain or client identity is not valid PEM
    /// - `ConfigError::ClientConstruction` - TLS backend failed to initialize
    pub fn new(server: &ServerConfig, connection: &ConnectionConfig) -> Result<Self, ConfigError> {
        let mut builder = reqwest::Client::builder()
            .timeout(connection.timeout)
            .user_agent(connection.user_agent)
            .redirect(reqwest::redirect::Policy::limited(3));

        match &server.proxy {
            ProxyConfig::Default => {}
            ProxyConfig::Http(endpoint) => builder = builder.proxy(proxy("http", endpoint)?),
            ProxyConfig::Socks5(endpoint) => builder = builder.proxy(proxy("socks5", endpoint)?),
        }

        if server.server_certificate_chain.is_empty() {
            if let Some(identity) = &server.client_identity {
                let pem = format!("{}\n{}", identity.certificate_pem, identity.private_key_pem);
                let identity =
                    Identity::from_pem(pem.as_bytes()).map_err(|e| ConfigError::InvalidCertificate {
                        reason: e.to_string(),
                    })?;
                builder = builder.identity(identity);
            }
        } else {
            builder = builder.use_preconfigured_tls(pinned_tls_config(
                &server.server_certificate_chain,
                server.client_identity.as_ref(),
            )?);
        }

        let client = builder
            .build()
            .map_err(|e| ConfigError::ClientConstruction {
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            credentials: server
                .authentication
                .as_ref()
                .map(|c| (c.username.clone(), c.password.clone())),
        })
    }
}

fn pinned_tls_config(
    chain: &[String],
    identity: Option<&ClientIdentity>,
) -> Result<rustls::ClientConfig, ConfigError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = PinnedCertificateVerifier::new(chain, provider.clone())?;
    let invalid = |reason: String| ConfigError::InvalidCertificate { reason };

    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigError::ClientConstruction {
            reason: e.to_string(),
        })?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier));

    let Some(identity) = identity else {
        return Ok(builder.with_no_client_auth());
    };
    let certificates: Vec<CertificateDer<'static>> = pem_blocks(&identity.certificate_pem)?
        .into_iter()
        .map(CertificateDer::from)
        .collect();
    let key_der = pem_blocks(&identity.private_key_pem)?
        .into_iter()
        .next()
        .ok_or_else(|| invalid("no private key found".to_string()))?;
    let key = PrivateKeyDer::try_from(key_der).map_err(|e| invalid(e.to_string()))?;
    builder
        .with_client_auth_cert(certificates, key)
        .map_err(|e| invalid(e.to_string()))
}

fn proxy(scheme: &str, endpoint: &ProxyEndpoint) -> Result<Proxy, ConfigError> {
    let url = format!("{scheme}://{}:{}", endpoint.hostname, endpoint.port);
    let proxy = Proxy::all(&url).map_err(|e| ConfigError::InvalidProxy {
        reason: format!("{url}: {e}"),
    })?;
    Ok(match &endpoint.user {
        Some(user) => proxy.basic_auth(user, endpoint.password.as_deref().unwrap_or_default()),
        None => proxy,
    })
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn post(&self, request: HttpRequest) -> Result<HttpReply, NetworkError> {
        let mut builder = self
            .client
            .post(request.url)
            .header(CONTENT_TYPE, "application/json")
            .body(request.body);
        if let Some(session_id) = &request.session_id {
            builder = builder.header(SESSION_ID_HEADER, session_id);
        }
        if let Some((username, password)) = &self.credentials {
            builder = builder.basic_auth(username, Some(password));
        }

        let response = builder.send().await.map_err(|e| classify_error(&e))?;

        let url = response.url().clone();
        let encrypted = url.scheme() == "https";
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.bytes().await.map_err(|e| classify_error(&e))?;

        Ok(HttpReply {
            url,
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            encrypted,
            headers,
            body,
            tls_errors: Vec::new(),
        })
    }
}

/// Maps a reqwest error onto the categories the transport retries on.
fn classify_error(error: &reqwest::Error) -> NetworkError {
    let mut chain = Vec::new();
    let mut rejection = None;
    let mut source: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(current) = source {
        chain.push(current.to_string());
        rejection = rejection.or_else(|| tls_rejection(current));
        source = current.source();
    }
    let description = chain.join(": ");

    if error.is_timeout() {
        return NetworkError::new(NetworkErrorKind::TimedOut, description);
    }

    if let Some(rejection) = rejection {
        let mut network_error = NetworkError::new(NetworkErrorKind::Tls, description);
        network_error.tls_errors = vec![rejection];
        return network_error;
    }

    let tls_messages: Vec<&String> = chain
        .iter()
        .filter(|message| {
            let lowered = message.to_lowercase();
            lowered.contains("certificate") || lowered.contains("ssl") || lowered.contains("tls")
        })
        .collect();
    if !tls_messages.is_empty() {
        let mut network_error = NetworkError::new(NetworkErrorKind::Tls, description);
        network_error.tls_errors = tls_messages
            .into_iter()
            .map(|message| TlsError::from_description(message.as_str()))
            .collect();
        return network_error;
    }

    let kind = if error.is_connect() {
        NetworkErrorKind::Connection
    } else {
        NetworkErrorKind::Other
    };
    NetworkError::new(kind, description)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientIdentity, Credentials};

    #[test]
    fn test_reply_header_lookup_ignores_case() {
        let reply = HttpReply {
            url: Url::parse("http://localhost:9091/transmission/rpc").unwrap(),
            status: 409,
            reason: "Conflict".to_string(),
            encrypted: false,
            headers: vec![("x-transmission-session-id".to_string(), "abc".to_string())],
            body: Bytes::new(),
            tls_errors: Vec::new(),
        };

        assert_eq!(reply.header(SESSION_ID_HEADER), Some("abc"));
        assert!(!reply.is_success());
    }

    #[test]
    fn test_client_construction() {
        let mut server = ServerConfig::new("localhost", 9091);
        server.authentication = Some(Credentials {
            username: "user".to_string(),
            password: "secret".to_string(),
        });
        server.proxy = ProxyConfig::Socks5(ProxyEndpoint {
            hostname: "proxy.lan".to_string(),
            port: 1080,
            user: Some("proxy-user".to_string()),
            password: None,
        });

        let client = ReqwestClient::new(&server, &ConnectionConfig::default()).unwrap();
        assert_eq!(
            client.credentials,
            Some(("user".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn test_invalid_pem_is_rejected() {
        let mut server = ServerConfig::new("localhost", 9091);
        server.client_identity = Some(ClientIdentity {
            certificate_pem: "garbage".to_string(),
            private_key_pem: "garbage".to_string(),
        });

        assert!(matches!(
            ReqwestClient::new(&server, &ConnectionConfig::default()),
            Err(ConfigError::InvalidCertificate { .. })
        ));
    }

    #[test]
    fn test_pinned_chain_with_client_identity() {
        let daemon = rcgen::generate_simple_self_signed(vec!["seedbox.lan".to_string()]).unwrap();
        let client = rcgen::generate_simple_self_signed(vec!["tremote".to_string()]).unwrap();
        let mut server = ServerConfig::new("seedbox.lan", 9091);
        server.https = true;
        server.server_certificate_chain = vec![daemon.cert.pem()];
        server.client_identity = Some(ClientIdentity {
            certificate_pem: client.cert.pem(),
            private_key_pem: client.key_pair.serialize_pem(),
        });

        assert!(ReqwestClient::new(&server, &ConnectionConfig::default()).is_ok());

        server.server_certificate_chain = vec!["-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----".to_string()];
        assert!(ReqwestClient::new(&server, &ConnectionConfig::default()).is_err());
    }

    /// Answers one request on `listener` with `response` once the request body arrived.
    async fn answer_once(listener: &tokio::net::TcpListener, response: String) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buffer = [0u8; 1024];
        while !request.ends_with(b"{}") {
            let read = stream.read(&mut buffer).await.unwrap();
            assert!(read > 0, "Client closed before sending its body");
            request.extend_from_slice(&buffer[..read]);
        }
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_describes_the_redirected_endpoint() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let daemon = tokio::spawn(async move {
            answer_once(
                &listener,
                "HTTP/1.1 307 Temporary Redirect\r\nLocation: /moved/rpc\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
            )
            .await;
            answer_once(
                &listener,
                "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}".to_string(),
            )
            .await;
        });

        let server = ServerConfig::new("127.0.0.1", port);
        let client = ReqwestClient::new(&server, &ConnectionConfig::default()).unwrap();
        let reply = client
            .post(HttpRequest {
                url: server.url().unwrap(),
                session_id: None,
                body: Bytes::from_static(b"{}"),
            })
            .await
            .unwrap();
        daemon.await.unwrap();

        assert_eq!(reply.status, 200);
        assert_eq!(reply.url.path(), "/moved/rpc");
        assert!(!reply.encrypted);
    }

    #[tokio::test]
    async fn test_refused_connection_is_a_network_error() {
        // Bind then drop to obtain a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let server = ServerConfig::new("127.0.0.1", port);
        let client = ReqwestClient::new(&server, &ConnectionConfig::default()).unwrap();

        let error = client
            .post(HttpRequest {
                url: server.url().unwrap(),
                session_id: None,
                body: Bytes::from_static(b"{}"),
            })
            .await
            .unwrap_err();

        assert!(matches!(
            error.kind,
            NetworkErrorKind::Connection | NetworkErrorKind::Other
        ));
    }
}
