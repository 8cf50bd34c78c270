use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::CONTENT_TYPE;
use url::Url;

use super::{Request, Response, Transport};
use crate::config::Config;
use crate::error::NetworkError;

/// HTTP transport to the platform origin
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpTransport {
  pub fn new(config: &Config) -> Result<Self> {
    let base_url = Url::parse(&config.server.base_url)
      .map_err(|e| eyre!("Invalid server URL {}: {}", config.server.base_url, e))?;

    let client = reqwest::Client::builder()
      .gzip(true)
      .deflate(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token: Config::get_api_token(),
    })
  }

  fn url_for(&self, path: &str) -> Result<Url, NetworkError> {
    self
      .base_url
      .join(path)
      .map_err(|e| NetworkError::Request(format!("invalid path {}: {}", path, e)))
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: &Request) -> Result<Response, NetworkError> {
    let url = self.url_for(&request.path)?;

    let mut builder = self.client.request(request.method.clone(), url);
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(|e| {
      if e.is_timeout() {
        NetworkError::Request(format!("timed out: {}", e))
      } else if e.is_connect() {
        NetworkError::Connect(e.to_string())
      } else {
        NetworkError::Request(e.to_string())
      }
    })?;

    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);

    let body = response
      .bytes()
      .await
      .map_err(|e| NetworkError::Request(format!("failed to read body: {}", e)))?;

    Ok(Response {
      status,
      content_type,
      body: body.to_vec(),
    })
  }
}
