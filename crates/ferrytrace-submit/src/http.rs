//! HTTP transport
//!
//! Default [`ITransport`] built on `reqwest`. Every stream posts to its own
//! URL with the access token as a query parameter:
//!
//! - reports without attachments go out as a JSON body
//! - reports with attachments go out as a multipart form (`upload_file`
//!   plus one `attachment_<name>` part per file)
//! - event batches go out as a JSON body
//!
//! The transport never retries; an error means no status was received.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ferrytrace_core::config::EndpointsConfig;
use ferrytrace_core::ports::{ITransport, StreamKind, SubmitRequest, TransportResponse};
use reqwest::multipart::{Form, Part};
use reqwest::{header, Client, RequestBuilder};
use tracing::{debug, warn};

use crate::error::SubmitError;

/// Per-stream collector URLs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoints {
    pub reports: Option<String>,
    pub unique_events: Option<String>,
    pub summed_events: Option<String>,
    pub token: Option<String>,
}

impl Endpoints {
    /// Derives the event URLs from the events base URL
    /// (`<base>/unique-events/submit`, `<base>/summed-events/submit`).
    pub fn from_config(config: &EndpointsConfig) -> Self {
        let events = config
            .events_url
            .as_deref()
            .map(|base| base.trim_end_matches('/'));
        Self {
            reports: config.reports_url.clone(),
            unique_events: events.map(|base| format!("{base}/unique-events/submit")),
            summed_events: events.map(|base| format!("{base}/summed-events/submit")),
            token: config.token.clone(),
        }
    }

    pub fn url_for(&self, stream: StreamKind) -> Option<&str> {
        match stream {
            StreamKind::Reports => self.reports.as_deref(),
            StreamKind::UniqueEvents => self.unique_events.as_deref(),
            StreamKind::SummedEvents => self.summed_events.as_deref(),
        }
    }
}

/// reqwest-backed [`ITransport`]
pub struct HttpTransport {
    client: Client,
    endpoints: Endpoints,
}

impl HttpTransport {
    pub fn new(endpoints: Endpoints, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder().user_agent(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION")
        ));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("Failed to build HTTP client")?;
        Ok(Self { client, endpoints })
    }

    pub fn from_config(config: &EndpointsConfig) -> Result<Self> {
        Self::new(
            Endpoints::from_config(config),
            config.timeout_secs.map(Duration::from_secs),
        )
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn request(&self, url: &str) -> RequestBuilder {
        let builder = self.client.post(url);
        match &self.endpoints.token {
            Some(token) => builder.query(&[("token", token.as_str())]),
            None => builder,
        }
    }

    async fn multipart(request: &SubmitRequest) -> Result<Form> {
        let report = Part::bytes(request.payload.clone())
            .file_name("upload_file.json")
            .mime_str("application/json")?;
        let mut form = Form::new().part("upload_file", report);

        for path in &request.attachments {
            let bytes = match tokio::fs::read(path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable attachment");
                    continue;
                }
            };
            let name = attachment_name(path);
            form = form.part(
                format!("attachment_{name}"),
                Part::bytes(bytes).file_name(name),
            );
        }
        Ok(form)
    }
}

/// File name of a stored attachment copy with its record prefix removed.
fn attachment_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    // <id>-attachment-<n>-<original name>
    match name.split_once("-attachment-") {
        Some((_, rest)) => rest
            .split_once('-')
            .map(|(_, original)| original.to_string())
            .unwrap_or(name.clone()),
        None => name,
    }
}

#[async_trait]
impl ITransport for HttpTransport {
    async fn submit(&self, request: SubmitRequest) -> Result<TransportResponse> {
        let url = self
            .endpoints
            .url_for(request.stream)
            .ok_or(SubmitError::MissingEndpoint(request.stream))?;

        let builder = self.request(url);
        let builder = if request.attachments.is_empty() {
            builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(request.payload)
        } else {
            builder.multipart(Self::multipart(&request).await?)
        };

        debug!(
            stream = %request.stream,
            batch_id = %request.batch_id,
            attempt = request.attempt,
            "Posting batch"
        );
        let response = builder
            .send()
            .await
            .with_context(|| format!("Failed to reach {} collector", request.stream))?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(TransportResponse::new(status, body))
    }
}
