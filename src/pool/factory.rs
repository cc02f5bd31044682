//! Establishing, probing and closing transport connections.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::{OrchestratorError, Result};
use crate::pool::connection::{Endpoint, Protocol};

/// Creates and probes the connections a pool hands out.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new connection to `endpoint`.
    fn connect(&self, endpoint: &Endpoint) -> BoxFuture<'static, Result<Self::Connection>>;

    /// Cheap liveness probe on an idle connection.
    fn ping<'a>(&'a self, conn: &'a mut Self::Connection) -> BoxFuture<'a, Result<()>>;

    /// Close a connection that is leaving the pool.
    fn close(&self, conn: Self::Connection) -> BoxFuture<'static, ()> {
        Box::pin(async move { drop(conn) })
    }
}

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// HTTP client bound to one backend URL, reusing a keep-alive connection.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    pub client: reqwest::Client,
    pub url: Url,
}

/// A live transport of one of the supported protocols.
pub enum Transport {
    Http(HttpTransport),
    Tcp(TcpStream),
    WebSocket(Box<WsStream>),
}

impl Transport {
    pub fn protocol(&self) -> Protocol {
        match self {
            Transport::Http(_) => Protocol::Http,
            Transport::Tcp(_) => Protocol::Tcp,
            Transport::WebSocket(_) => Protocol::WebSocket,
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Http(http) => write!(f, "Transport::Http({})", http.url),
            Transport::Tcp(stream) => write!(f, "Transport::Tcp({:?})", stream.peer_addr().ok()),
            Transport::WebSocket(_) => write!(f, "Transport::WebSocket"),
        }
    }
}

/// Default factory covering HTTP, raw TCP and WebSocket endpoints.
#[derive(Debug, Clone)]
pub struct TransportConnector {
    connect_timeout: Duration,
}

impl TransportConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TransportConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

fn parse_url(endpoint: &Endpoint) -> Result<Url> {
    Url::parse(&endpoint.url).map_err(|e| {
        OrchestratorError::Configuration(format!("invalid endpoint '{}': {}", endpoint.url, e))
    })
}

fn tcp_address(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| OrchestratorError::Configuration(format!("endpoint '{}' has no host", url)))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| OrchestratorError::Configuration(format!("endpoint '{}' has no port", url)))?;
    Ok(format!("{}:{}", host, port))
}

impl ConnectionFactory for TransportConnector {
    type Connection = Transport;

    fn connect(&self, endpoint: &Endpoint) -> BoxFuture<'static, Result<Transport>> {
        let endpoint = endpoint.clone();
        let connect_timeout = self.connect_timeout;
        Box::pin(async move {
            let url = parse_url(&endpoint)?;
            match endpoint.protocol {
                Protocol::Http => {
                    let client = reqwest::Client::builder()
                        .connect_timeout(connect_timeout)
                        .pool_max_idle_per_host(1)
                        .build()?;
                    Ok(Transport::Http(HttpTransport { client, url }))
                }
                Protocol::Tcp => {
                    let address = tcp_address(&url)?;
                    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&address))
                        .await
                        .map_err(|_| OrchestratorError::Timeout(format!("connect to {}", address)))??;
                    stream.set_nodelay(true)?;
                    Ok(Transport::Tcp(stream))
                }
                Protocol::WebSocket => {
                    let (ws, _) = tokio::time::timeout(
                        connect_timeout,
                        tokio_tungstenite::connect_async(url.as_str()),
                    )
                    .await
                    .map_err(|_| OrchestratorError::Timeout(format!("connect to {}", url)))?
                    .map_err(|e| OrchestratorError::Network(e.to_string()))?;
                    Ok(Transport::WebSocket(Box::new(ws)))
                }
            }
        })
    }

    fn ping<'a>(&'a self, conn: &'a mut Transport) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match conn {
                Transport::Http(http) => {
                    // Any HTTP answer proves the connection; only transport errors fail.
                    http.client.head(http.url.clone()).send().await?;
                    Ok(())
                }
                Transport::Tcp(stream) => {
                    let mut buf = [0u8; 1];
                    match tokio::time::timeout(Duration::from_millis(1), stream.peek(&mut buf)).await {
                        Err(_) => Ok(()),
                        Ok(Ok(0)) => Err(OrchestratorError::Network("peer closed connection".into())),
                        Ok(Ok(_)) => Ok(()),
                        Ok(Err(e)) => Err(e.into()),
                    }
                }
                Transport::WebSocket(ws) => ws
                    .send(Message::Ping(Vec::new().into()))
                    .await
                    .map_err(|e| OrchestratorError::Network(e.to_string())),
            }
        })
    }

    fn close(&self, conn: Transport) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if let Transport::WebSocket(mut ws) = conn {
                let _ = (*ws).close(None).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_connect_and_ping() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let connector = TransportConnector::default();
        let endpoint = Endpoint::new(format!("tcp://{}", addr), Protocol::Tcp);
        let mut conn = connector.connect(&endpoint).await.unwrap();
        let (server_side, _) = accept.await.unwrap();

        assert_eq!(conn.protocol(), Protocol::Tcp);
        assert!(connector.ping(&mut conn).await.is_ok());

        drop(server_side);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(connector.ping(&mut conn).await.is_err());
    }

    #[tokio::test]
    async fn http_connect_builds_client() {
        let connector = TransportConnector::default();
        let endpoint = Endpoint::new("http://127.0.0.1:9/mcp", Protocol::Http);
        let conn = connector.connect(&endpoint).await.unwrap();
        match conn {
            Transport::Http(http) => assert_eq!(http.url.path(), "/mcp"),
            other => panic!("unexpected transport {:?}", other),
        }
    }

    #[tokio::test]
    async fn invalid_endpoint_is_configuration_error() {
        let connector = TransportConnector::default();
        let err = connector
            .connect(&Endpoint::new("not a url", Protocol::Tcp))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Configuration(_)));
    }
}
