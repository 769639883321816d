use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Data section of an upstream fetch. The SDMX proxy either wraps the XML in
/// a status envelope or hands back the raw document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FetchData {
    Payload {
        status: String,
        content: Option<String>,
        size: u64,
    },
    Raw(String),
}

/// Upstream response shape. Anything that doesn't match one of the two
/// documented variants is treated as a failure by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Option<FetchData>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl FetchResponse {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error_message: Some(message.into()),
        }
    }

    pub fn with_content(content: String) -> Self {
        Self {
            success: true,
            data: Some(FetchData::Payload {
                status: "success".to_string(),
                size: content.len() as u64,
                content: Some(content),
            }),
            error_message: None,
        }
    }
}

/// Boundary to the upstream SDMX REST API. The pipeline only needs XML bytes
/// and a success flag; everything else about the client is out of scope.
#[async_trait]
pub trait SdmxClient: Send + Sync {
    async fn fetch_dataset(&self, dataset_id: &str) -> FetchResponse;
}

/// ISTAT SDMX client over HTTP.
pub struct IstatSdmxClient {
    http: reqwest::Client,
    base_url: String,
}

impl IstatSdmxClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SdmxClient for IstatSdmxClient {
    async fn fetch_dataset(&self, dataset_id: &str) -> FetchResponse {
        let url = format!("{}/data/{dataset_id}", self.base_url);
        let response = match self
            .http
            .get(&url)
            .header("Accept", "application/xml")
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("SDMX fetch failed for {dataset_id}: {e}");
                return FetchResponse::failure(format!("request failed: {e}"));
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::warn!("SDMX fetch for {dataset_id} returned {status}");
            return FetchResponse::failure(format!("upstream returned {status}"));
        }

        match response.text().await {
            Ok(content) => {
                tracing::debug!("fetched {} bytes for {dataset_id}", content.len());
                FetchResponse::with_content(content)
            }
            Err(e) => FetchResponse::failure(format!("body read failed: {e}")),
        }
    }
}
