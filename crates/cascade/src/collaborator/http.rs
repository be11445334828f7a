//! OpenAI-compatible chat-completions client.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use super::{CollaboratorError, Generator, RephraseRequest, StepRequest, DEFAULT_STEP};
use crate::config::schema::{CollaboratorConfig, RetryConfig, StepConfig};
use crate::sanitize::redact_url;
use crate::secrets::{collaborator_api_key, SecretError};

const DEFAULT_PROMPT: &str = "Produce the {sub_type} for dimension '{dimension}' from this \
source written in '{source_dimension}'.\n\nTitle: {title}\n\nContent:\n{body}\n\nRespond with \
a single JSON object that has a \"title\" field.";

const REPHRASE_PROMPT: &str = "Rewrite this title for dimension '{dimension}' so that it keeps \
its meaning but differs from every title listed below.\n\nTitle: {title}\n\nAlready used:\n\
{taken}\n\nRespond with the new title only.";

pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<SecretString>,
    system_prompt: Option<String>,
    pipelines: HashMap<String, Vec<StepConfig>>,
}

impl HttpGenerator {
    pub fn from_config(
        config: &CollaboratorConfig,
        retry: &RetryConfig,
    ) -> Result<Self, SecretError> {
        let api_key = collaborator_api_key(config)?;
        if api_key.is_none() {
            log::warn!("No collaborator API key configured; requests are sent unauthenticated");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(retry.request_timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });

        log::info!(
            "Collaborator endpoint {} (model {})",
            redact_url(&config.endpoint),
            config.model
        );

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
            system_prompt: config.system_prompt.clone(),
            pipelines: config.pipelines.clone(),
        })
    }

    fn template_for(&self, pipeline: &str, step: &str) -> &str {
        self.pipelines
            .get(pipeline)
            .and_then(|steps| steps.iter().find(|s| s.name == step))
            .map(|s| s.prompt.as_str())
            .unwrap_or(DEFAULT_PROMPT)
    }

    async fn chat(&self, prompt: String, json_output: bool) -> Result<String, CollaboratorError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));

        let mut body = json!({ "model": self.model, "messages": messages });
        if json_output {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        let text = response.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(CollaboratorError::from_status(status.as_u16(), text));
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| CollaboratorError::Malformed(format!("response envelope: {}", e)))?;
        extract_content(&parsed)
    }
}

fn classify_transport(err: reqwest::Error) -> CollaboratorError {
    if err.is_timeout() {
        CollaboratorError::Timeout(err.to_string())
    } else {
        CollaboratorError::Network(err.to_string())
    }
}

/// Pulls `choices[0].message.content` out of a completion response.
fn extract_content(response: &Value) -> Result<String, CollaboratorError> {
    response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or(CollaboratorError::EmptyResponse)
}

/// Fills `{placeholders}` in a step prompt.
pub fn render_prompt(template: &str, request: &StepRequest) -> String {
    let body = match &request.source_body {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let mut out = template
        .replace("{title}", &request.source_title)
        .replace("{body}", &body)
        .replace("{dimension}", request.key.dimension.as_str())
        .replace("{source_dimension}", request.source_dimension.as_str())
        .replace("{sub_type}", &request.key.sub_type);
    for (name, value) in &request.previous {
        out = out.replace(&format!("{{step.{}}}", name), &value.to_string());
    }
    out
}

#[async_trait]
impl Generator for HttpGenerator {
    fn steps(&self, pipeline: &str) -> Vec<String> {
        match self.pipelines.get(pipeline) {
            Some(steps) if !steps.is_empty() => steps.iter().map(|s| s.name.clone()).collect(),
            _ => vec![DEFAULT_STEP.to_string()],
        }
    }

    async fn produce(&self, request: &StepRequest) -> Result<String, CollaboratorError> {
        let prompt = render_prompt(self.template_for(&request.pipeline, &request.step), request);
        self.chat(prompt, true).await
    }

    async fn rephrase(&self, request: &RephraseRequest) -> Result<String, CollaboratorError> {
        let taken = request
            .taken
            .iter()
            .map(|t| format!("- {}", t))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = REPHRASE_PROMPT
            .replace("{dimension}", request.key.dimension.as_str())
            .replace("{title}", &request.title)
            .replace("{taken}", &taken);
        self.chat(prompt, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Dimension, UnitKey};
    use std::collections::BTreeMap;

    fn request() -> StepRequest {
        let mut previous = BTreeMap::new();
        previous.insert("headline".to_string(), json!({"title": "Hallo"}));
        StepRequest {
            pipeline: "cluster_translation".to_string(),
            step: "body".to_string(),
            step_index: 1,
            key: UnitKey::new("s1", "de", "article"),
            source_dimension: Dimension::new("en"),
            source_title: "Hello".to_string(),
            source_body: json!("Some text"),
            previous,
        }
    }

    fn generator(pipelines: HashMap<String, Vec<StepConfig>>) -> HttpGenerator {
        let config = CollaboratorConfig {
            api_key: Some("test-key".to_string()),
            pipelines,
            ..Default::default()
        };
        HttpGenerator::from_config(&config, &RetryConfig::default()).unwrap()
    }

    #[test]
    fn test_render_prompt() {
        let out = render_prompt(
            "{title}|{body}|{dimension}|{source_dimension}|{sub_type}|{step.headline}",
            &request(),
        );
        assert_eq!(out, r#"Hello|Some text|de|en|article|{"title":"Hallo"}"#);
    }

    #[test]
    fn test_extract_content() {
        let ok = json!({"choices": [{"message": {"content": " {\"title\":\"x\"} "}}]});
        assert_eq!(extract_content(&ok).unwrap(), "{\"title\":\"x\"}");

        let empty = json!({"choices": [{"message": {"content": ""}}]});
        assert_eq!(extract_content(&empty), Err(CollaboratorError::EmptyResponse));
        assert_eq!(extract_content(&json!({})), Err(CollaboratorError::EmptyResponse));
    }

    #[test]
    fn test_steps_from_config() {
        let mut pipelines = HashMap::new();
        pipelines.insert(
            "cluster_translation".to_string(),
            vec![
                StepConfig {
                    name: "headline".to_string(),
                    prompt: "h".to_string(),
                },
                StepConfig {
                    name: "body".to_string(),
                    prompt: "b".to_string(),
                },
            ],
        );
        let g = generator(pipelines);
        assert_eq!(g.steps("cluster_translation"), vec!["headline", "body"]);
        assert_eq!(g.steps("unknown"), vec![DEFAULT_STEP]);
        assert_eq!(g.template_for("cluster_translation", "body"), "b");
        assert_eq!(g.template_for("unknown", "content"), DEFAULT_PROMPT);
    }
}
