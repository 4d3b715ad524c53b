//! Client for the upload service's file API.
//!
//! Documents reference uploaded attachments by file key; when a drained room
//! is cleaned up, the relay asks the upload service to delete those files.

use futures_util::future::BoxFuture;
use reqwest::Client;
use serde::Serialize;
use tracing::info;

use crate::persistence::{ResourceError, ResourceStore};

#[derive(Debug)]
pub struct UploadsClient {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct DeleteFilesRequest<'a> {
    #[serde(rename = "fileKeys")]
    file_keys: &'a [String],
}

impl UploadsClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("Failed to build reqwest client");

        Self {
            client,
            base_url,
            api_key,
        }
    }

    async fn delete_files(&self, keys: &[String]) -> Result<(), ResourceError> {
        let url = format!("{}/v6/deleteFiles", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-uploadthing-api-key", &self.api_key)
            .json(&DeleteFilesRequest { file_keys: keys })
            .send()
            .await
            .map_err(|e| ResourceError::Release(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ResourceError::Release(format!(
                "upload service returned {}",
                response.status()
            )));
        }
        info!("Deleted {} uploaded files", keys.len());
        Ok(())
    }
}

impl ResourceStore for UploadsClient {
    fn release(&self, keys: Vec<String>) -> BoxFuture<'_, Result<(), ResourceError>> {
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(());
            }
            self.delete_files(&keys).await
        })
    }
}
