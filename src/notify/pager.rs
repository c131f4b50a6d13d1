use std::time::Duration;

use serde_json::{json, Value as Json};
use tracing::{error, warn};
use url::Url;

use crate::config::PagerConfig;
use crate::secret::Secret;

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub enum Severity {
    Critical,
    Error,
    Warning,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Error => "error",
            Severity::Warning => "warning",
        }
    }
}

/// PagerDuty Events v2 client. Without a routing key the pager only logs,
/// which is what local and staging runs want.
#[derive(Debug)]
pub struct Pager {
    client: reqwest::Client,
    endpoint: Url,
    routing_key: Option<Secret<String>>,
}

impl Pager {
    pub fn new(config: &PagerConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            routing_key: Some(config.routing_key.clone()),
        })
    }

    pub fn disabled() -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: Url::parse("https://events.pagerduty.com/v2/enqueue").unwrap(),
            routing_key: None,
        }
    }

    /// Triggers an incident. Failures are logged; paging about a broken
    /// pager helps nobody.
    pub async fn page(&self, severity: Severity, summary: &str, details: Json) {
        let Some(routing_key) = &self.routing_key else {
            warn!(summary, severity = severity.as_str(), "paging disabled, incident not sent");
            return;
        };
        let body = json!({
            "routing_key": routing_key.expose(),
            "event_action": "trigger",
            "payload": {
                "summary": summary,
                "source": "ncg-bridge",
                "severity": severity.as_str(),
                "custom_details": details,
            },
        });
        let result = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                error!(summary, status = %response.status(), "pager rejected the incident");
            }
            Err(send_error) => {
                error!(summary, ?send_error, "could not reach the pager");
            }
        }
    }
}
