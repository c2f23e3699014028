//! HTTP client for the managed service API.

use std::time::Duration;

use reqwest::{Client, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{StackError, StackResult};
use crate::config::EssConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Authenticated client for `{base_url}/api/v1`.
#[derive(Clone)]
pub struct EssClient {
    base_url: String,
    api_key: String,
    http: Client,
}

impl EssClient {
    pub fn new(config: &EssConfig) -> StackResult<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends an API request and decodes the JSON answer.
    pub async fn request<B, R>(&self, method: Method, path: &str, body: Option<&B>) -> StackResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if self.api_key.is_empty() {
            return Err(StackError::MissingApiKey);
        }
        let url = format!("{}{}", self.base_url, path);
        debug!("ESS request: {} {}", method, url);

        let mut request = self
            .http
            .request(method, &url)
            .header("Authorization", format!("ApiKey {}", self.api_key));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            warn!("ESS request {} failed: {} {}", url, status, body);
            return Err(StackError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        if text.trim().is_empty() {
            return serde_json::from_str("null").map_err(|e| StackError::Parse(e.to_string()));
        }
        serde_json::from_str(&text).map_err(|e| StackError::Parse(format!("{}: {}", url, e)))
    }

    /// Status code of a basic-auth GET against a service endpoint.
    pub async fn status_of(&self, url: &str, username: &str, password: &str) -> StackResult<u16> {
        let response = self
            .http
            .get(url)
            .basic_auth(username, Some(password))
            .send()
            .await?;
        Ok(response.status().as_u16())
    }
}

/// A throwaway HTTP server answering with canned responses, one per
/// connection, in order.
#[cfg(test)]
pub(crate) mod mock {
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::config::EssConfig;

    pub(crate) struct MockApi {
        pub(crate) url: String,
        listener: Option<TcpListener>,
        requests: Arc<Mutex<Vec<String>>>,
    }

    impl MockApi {
        pub(crate) async fn bind() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("http://{}", listener.local_addr().unwrap());
            Self {
                url,
                listener: Some(listener),
                requests: Arc::default(),
            }
        }

        /// Settings pointing at this server, polling without delay.
        pub(crate) fn config(&self) -> EssConfig {
            EssConfig {
                base_url: self.url.clone(),
                api_key: "secret".to_string(),
                poll_interval_secs: 0,
                ready_timeout_secs: 10,
                ..Default::default()
            }
        }

        pub(crate) fn serve(&mut self, replies: Vec<(u16, String)>) {
            let listener = self.listener.take().unwrap();
            let requests = self.requests.clone();
            tokio::spawn(async move {
                for (status, body) in replies {
                    let Ok((mut socket, _)) = listener.accept().await else {
                        return;
                    };
                    let request = read_request(&mut socket).await;
                    requests.lock().unwrap().push(request);
                    let response = format!(
                        "HTTP/1.1 {} Mock\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                }
            });
        }

        /// Raw text of every request served so far.
        pub(crate) fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }

        /// `METHOD /path` of every request served so far.
        pub(crate) fn request_lines(&self) -> Vec<String> {
            self.requests()
                .iter()
                .map(|r| {
                    let line = r.lines().next().unwrap_or_default();
                    line.rsplit_once(' ').map_or(line, |(head, _)| head).to_string()
                })
                .collect()
        }
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    return text;
                }
            }
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return String::from_utf8_lossy(&buf).to_string(),
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
    }
}
