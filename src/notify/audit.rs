use std::time::Duration;

use serde_json::Value as Json;
use tracing::{debug, error};
use url::Url;

use crate::config::AuditConfig;
use crate::secret::Secret;

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Append-oriented JSON document sink for searchable exchange records.
/// One document is written per counter-chain emission.
#[derive(Debug)]
pub struct AuditSink {
    client: reqwest::Client,
    target: Option<Target>,
}

#[derive(Debug)]
struct Target {
    endpoint: Secret<Url>,
    index: String,
    username: String,
    password: Secret<String>,
}

impl AuditSink {
    pub fn new(config: &AuditConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(Self {
            client,
            target: Some(Target {
                endpoint: config.endpoint.clone(),
                index: config.index.clone(),
                username: config.username.clone(),
                password: config.password.clone(),
            }),
        })
    }

    pub fn disabled() -> Self {
        Self {
            client: reqwest::Client::new(),
            target: None,
        }
    }

    pub async fn index_document(&self, document: Json) {
        let Some(target) = &self.target else {
            debug!("audit sink disabled, document not written");
            return;
        };
        let url = match target.endpoint.url().join(&format!("{}/_doc", target.index)) {
            Ok(url) => url,
            Err(join_error) => {
                error!(?join_error, index = target.index, "bad audit index name");
                return;
            }
        };
        let result = self
            .client
            .post(url)
            .basic_auth(&target.username, Some(target.password.expose()))
            .json(&document)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                error!(status = %response.status(), "audit store rejected the document");
            }
            Err(send_error) => {
                error!(?send_error, "could not reach the audit store");
            }
        }
    }
}
