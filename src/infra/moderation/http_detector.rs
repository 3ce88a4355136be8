use crate::core::moderation::{Detector, DetectorCategory, DetectorVerdict, ModerationRequest};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

/// Detector backed by an HTTP scoring service.
///
/// POSTs the request as JSON and expects `{score, confidence, categories, raw?}`.
pub struct HttpDetector {
    client: Client,
    name: String,
    category: DetectorCategory,
    url: String,
    api_key: Option<String>,
}

impl HttpDetector {
    pub fn new(category: DetectorCategory, url: String, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            name: category.to_string(),
            category,
            url,
            api_key,
        }
    }

    /// Detectors for every category with a `MODERATION_DETECTOR_<CATEGORY>_URL`
    /// variable set. `MODERATION_DETECTOR_API_KEY` is sent as a bearer token.
    pub fn from_env() -> Vec<Self> {
        let api_key = std::env::var("MODERATION_DETECTOR_API_KEY").ok();
        DetectorCategory::ALL
            .iter()
            .filter_map(|category| {
                let var = format!(
                    "MODERATION_DETECTOR_{}_URL",
                    category.as_str().to_uppercase()
                );
                std::env::var(&var)
                    .ok()
                    .filter(|url| !url.trim().is_empty())
                    .map(|url| Self::new(*category, url, api_key.clone()))
            })
            .collect()
    }
}

fn detector_payload(category: DetectorCategory, request: &ModerationRequest) -> serde_json::Value {
    json!({
        "category": category,
        "request_id": request.id,
        "kind": request.kind,
        "subject_user_id": request.subject_user_id,
        "content": request.content,
        "attachments": request.attachments,
        "context": request.context,
        "priority": request.priority,
    })
}

#[async_trait]
impl Detector for HttpDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> DetectorCategory {
        self.category
    }

    async fn analyze(&self, request: &ModerationRequest) -> anyhow::Result<DetectorVerdict> {
        let mut call = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&detector_payload(self.category, request));
        if let Some(key) = &self.api_key {
            call = call.header("Authorization", format!("Bearer {}", key));
        }

        let response = call.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            anyhow::bail!("{} detector error: {} - {}", self.name, status, text);
        }

        let verdict: DetectorVerdict = response.json().await?;
        Ok(verdict)
    }
}
