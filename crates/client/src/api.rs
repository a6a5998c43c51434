//! HTTP calls to a tunnel server

use std::time::Duration;

use reqwest::{StatusCode, Url};
use tracing::debug;

use sohtunnel_core::{ConnectionConfig, HEADER_CONNECTION_ID};

use crate::{ClientError, Result};

/// Timeout for establishing the HTTP connection (not the long-poll itself)
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for one tunnel server
#[derive(Debug, Clone)]
pub struct TunnelApi {
    http: reqwest::Client,
    base_url: Url,
}

impl TunnelApi {
    /// Create an API client for `tunnel_url`, optionally through an HTTP proxy
    pub fn new(tunnel_url: &str, proxy_url: Option<&str>) -> Result<Self> {
        let mut base_url =
            Url::parse(tunnel_url).map_err(|e| ClientError::InvalidUrl(format!("{tunnel_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(tunnel_url.to_string()));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let mut builder = reqwest::Client::builder().connect_timeout(HTTP_CONNECT_TIMEOUT);
        if let Some(proxy_url) = proxy_url.filter(|p| !p.trim().is_empty()) {
            debug!("Using HTTP proxy {}", proxy_url);
            builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }

        Ok(Self {
            http: builder.build()?,
            base_url,
        })
    }

    fn url(&self, route: &str) -> Result<Url> {
        self.base_url
            .join(route)
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))
    }

    fn check(operation: &'static str, status: StatusCode) -> Result<()> {
        if status == StatusCode::OK {
            Ok(())
        } else {
            Err(ClientError::Status {
                operation,
                status: status.as_u16(),
            })
        }
    }

    /// Open a tunnel and return its connection id
    pub async fn open(&self, config: &ConnectionConfig) -> Result<String> {
        let response = self
            .http
            .post(self.url("connect")?)
            .json(config)
            .send()
            .await?;
        Self::check("connect", response.status())?;

        let id = response.text().await?.trim().to_string();
        if id.is_empty() {
            return Err(ClientError::Status {
                operation: "connect",
                status: StatusCode::OK.as_u16(),
            });
        }
        Ok(id)
    }

    /// Send one chunk of (already encoded) payload
    pub async fn write(&self, id: &str, body: Vec<u8>) -> Result<()> {
        let response = self
            .http
            .post(self.url("write")?)
            .header(HEADER_CONNECTION_ID, id)
            .body(body)
            .send()
            .await?;
        Self::check("write", response.status())?;
        response.bytes().await?;
        Ok(())
    }

    /// Long-poll for target bytes (still encoded, possibly empty)
    pub async fn read(&self, id: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(self.url("read")?)
            .header(HEADER_CONNECTION_ID, id)
            .send()
            .await?;
        if response.status() == StatusCode::PRECONDITION_FAILED {
            return Err(ClientError::EndOfStream);
        }
        Self::check("read", response.status())?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Close a tunnel
    pub async fn close(&self, id: &str) -> Result<()> {
        let response = self
            .http
            .get(self.url("close")?)
            .header(HEADER_CONNECTION_ID, id)
            .send()
            .await?;
        Self::check("close", response.status())?;
        response.bytes().await?;
        Ok(())
    }

    /// Close every tunnel on the server and return its summary
    pub async fn clean(&self) -> Result<String> {
        let response = self.http.get(self.url("clean")?).send().await?;
        Self::check("clean", response.status())?;
        Ok(response.text().await?)
    }

    /// Fetch the server's info text
    pub async fn info(&self) -> Result<String> {
        let response = self.http.get(self.url("")?).send().await?;
        Self::check("info", response.status())?;
        Ok(response.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_bytes, body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_base_url_normalization() {
        let api = TunnelApi::new("http://tunnel.example:8080", None).unwrap();
        assert_eq!(api.url("read").unwrap().as_str(), "http://tunnel.example:8080/read");

        let api = TunnelApi::new("http://tunnel.example/soh", None).unwrap();
        assert_eq!(api.url("connect").unwrap().as_str(), "http://tunnel.example/soh/connect");
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            TunnelApi::new("not a url", None),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_open() {
        let server = MockServer::start().await;
        let config = ConnectionConfig::new("db.internal", 5432).with_base64_encoding(true);

        Mock::given(method("POST"))
            .and(path("/connect"))
            .and(body_json(&config))
            .respond_with(ResponseTemplate::new(200).set_body_string("tunnel-1\n"))
            .expect(1)
            .mount(&server)
            .await;

        let api = TunnelApi::new(&server.uri(), None).unwrap();
        assert_eq!(api.open(&config).await.unwrap(), "tunnel-1");
    }

    #[tokio::test]
    async fn test_open_connect_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/connect"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let api = TunnelApi::new(&server.uri(), None).unwrap();
        let err = api
            .open(&ConnectionConfig::new("example", 9999))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Status {
                operation: "connect",
                status: 502
            }
        ));
    }

    #[tokio::test]
    async fn test_write_sends_header_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/write"))
            .and(header(HEADER_CONNECTION_ID, "abc"))
            .and(body_bytes(b"QUI=".to_vec()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let api = TunnelApi::new(&server.uri(), None).unwrap();
        api.write("abc", b"QUI=".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_forbidden() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/write"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let api = TunnelApi::new(&server.uri(), None).unwrap();
        let err = api.write("abc", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, ClientError::Status { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_read_outcomes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/read"))
            .and(header(HEADER_CONNECTION_ID, "data"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"AB".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/read"))
            .and(header(HEADER_CONNECTION_ID, "idle"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/read"))
            .and(header(HEADER_CONNECTION_ID, "eof"))
            .respond_with(ResponseTemplate::new(412))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/read"))
            .and(header(HEADER_CONNECTION_ID, "gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let api = TunnelApi::new(&server.uri(), None).unwrap();
        assert_eq!(api.read("data").await.unwrap(), b"AB");
        assert!(api.read("idle").await.unwrap().is_empty());
        assert!(matches!(api.read("eof").await, Err(ClientError::EndOfStream)));
        assert!(matches!(
            api.read("gone").await,
            Err(ClientError::Status { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_close_clean_info() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/close"))
            .and(header(HEADER_CONNECTION_ID, "abc"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/clean"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("2 connection(s) closed (1 with error)"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("sohtunnel"))
            .mount(&server)
            .await;

        let api = TunnelApi::new(&server.uri(), None).unwrap();
        api.close("abc").await.unwrap();
        assert_eq!(api.clean().await.unwrap(), "2 connection(s) closed (1 with error)");
        assert_eq!(api.info().await.unwrap(), "sohtunnel");
    }

    #[tokio::test]
    async fn test_transport_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let api = TunnelApi::new(&format!("http://{addr}"), None).unwrap();
        assert!(matches!(api.read("abc").await, Err(ClientError::Transport(_))));
    }
}
