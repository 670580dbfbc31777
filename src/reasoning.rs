use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::env;
use std::time::Duration;
use tracing::debug;

use crate::model::QuizError;

// ========================= Requests =========================

/// JSON schema the model output must follow.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResponseSchema {
    pub name: String,
    pub schema: Value,
}

impl ResponseSchema {
    /// `{ correct_options: [string], steps: [string] }`
    pub fn answer() -> Self {
        Self {
            name: "quiz_answer".into(),
            schema: json!({
                "type": "object",
                "properties": {
                    "correct_options": { "type": "array", "items": { "type": "string" } },
                    "steps": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["correct_options", "steps"],
                "additionalProperties": false
            }),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub schema: Option<ResponseSchema>,
    /// PNG bytes; routes the call to the vision model.
    pub image: Option<Vec<u8>>,
    pub web_search: bool,
}

impl CompletionRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self { prompt: prompt.into(), ..Default::default() }
    }

    pub fn with_schema(mut self, schema: ResponseSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_image(mut self, png: Vec<u8>) -> Self {
        self.image = Some(png);
        self
    }

    pub fn with_web_search(mut self) -> Self {
        self.web_search = true;
        self
    }
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Returns the model's raw text output.
    async fn complete(&self, request: &CompletionRequest) -> Result<String, QuizError>;
}

// ========================= Responses API Adapter =========================

#[derive(Clone)]
pub struct ReasonerConfig {
    pub api_base: String,     // e.g. "https://api.openai.com/v1"
    pub api_key: String,      // env OPENAI_API_KEY
    pub model: String,
    pub vision_model: String,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            vision_model: env::var("OPENAI_VISION_MODEL").unwrap_or_else(|_| "gpt-4o".into()),
            temperature: 0.0,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct ResponsesReasoner {
    http: Client,
    cfg: ReasonerConfig,
}

impl ResponsesReasoner {
    pub fn new(cfg: ReasonerConfig) -> Result<Self, QuizError> {
        if cfg.api_key.trim().is_empty() {
            return Err(QuizError::Config("OPENAI_API_KEY missing".into()));
        }
        let http = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| QuizError::Config(e.to_string()))?;
        Ok(Self { http, cfg })
    }

    fn body(&self, request: &CompletionRequest) -> Value {
        let mut content = vec![json!({ "type": "input_text", "text": request.prompt })];
        let model = match &request.image {
            Some(png) => {
                content.push(json!({
                    "type": "input_image",
                    "image_url": format!("data:image/png;base64,{}", B64.encode(png))
                }));
                &self.cfg.vision_model
            }
            None => &self.cfg.model,
        };
        let mut body = json!({
            "model": model,
            "temperature": self.cfg.temperature,
            "input": [{ "role": "user", "content": content }]
        });
        if let Some(schema) = &request.schema {
            body["text"] = json!({
                "format": {
                    "type": "json_schema",
                    "name": schema.name,
                    "schema": schema.schema,
                    "strict": true
                }
            });
        }
        if request.web_search {
            body["tools"] = json!([{ "type": "web_search_preview" }]);
        }
        body
    }

    async fn send(&self, request: &CompletionRequest) -> Result<String> {
        let url = format!("{}/responses", self.cfg.api_base.trim_end_matches('/'));
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&self.body(request))
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("OpenAI error {}: {}", status, text);
        }
        let v: Value = serde_json::from_str(&text).context("failed to parse OpenAI response JSON")?;
        Self::parse_output(&v)
    }

    /// Concatenates the `output_text` parts of every `message` item.
    fn parse_output(v: &Value) -> Result<String> {
        let outputs = v
            .get("output")
            .and_then(|x| x.as_array())
            .cloned()
            .unwrap_or_default();
        let mut text = String::new();
        for o in outputs.iter().filter(|o| o.get("type").and_then(|t| t.as_str()) == Some("message")) {
            let parts = o.get("content").and_then(|c| c.as_array()).cloned().unwrap_or_default();
            for p in parts {
                if p.get("type").and_then(|t| t.as_str()) == Some("output_text") {
                    if let Some(t) = p.get("text").and_then(|t| t.as_str()) {
                        text.push_str(t);
                    }
                }
            }
        }
        if text.trim().is_empty() {
            bail!("response carried no output text");
        }
        Ok(text)
    }
}

#[async_trait]
impl Reasoner for ResponsesReasoner {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, QuizError> {
        let out = self
            .send(request)
            .await
            .map_err(|e| QuizError::Reasoner(e.to_string()))?;
        debug!(chars = out.len(), vision = request.image.is_some(), "model output: {}", out.trim());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cfg(base: String) -> ReasonerConfig {
        ReasonerConfig {
            api_base: base,
            api_key: "test-key".into(),
            model: "text-model".into(),
            vision_model: "vision-model".into(),
            temperature: 0.0,
            timeout: Duration::from_secs(5),
        }
    }

    fn reply(text: &str) -> Value {
        json!({
            "id": "resp_1",
            "output": [
                { "type": "web_search_call", "status": "completed" },
                { "type": "message", "content": [{ "type": "output_text", "text": text }] }
            ]
        })
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let mut c = cfg("http://localhost".into());
        c.api_key = " ".into();
        assert!(matches!(ResponsesReasoner::new(c), Err(QuizError::Config(_))));
    }

    #[test]
    fn body_carries_schema_image_and_tools() {
        let r = ResponsesReasoner::new(cfg("http://localhost".into())).unwrap();
        let req = CompletionRequest::text("q")
            .with_schema(ResponseSchema::answer())
            .with_image(vec![1, 2, 3])
            .with_web_search();
        let body = r.body(&req);
        assert_eq!(body["model"], "vision-model");
        assert_eq!(body["text"]["format"]["type"], "json_schema");
        assert_eq!(body["text"]["format"]["strict"], true);
        assert_eq!(body["tools"][0]["type"], "web_search_preview");
        assert_eq!(body["input"][0]["content"][1]["image_url"], "data:image/png;base64,AQID");

        let plain = r.body(&CompletionRequest::text("q"));
        assert_eq!(plain["model"], "text-model");
        assert!(plain.get("text").is_none());
        assert!(plain.get("tools").is_none());
    }

    #[tokio::test]
    async fn complete_returns_message_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(json!({ "model": "text-model" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply("math")))
            .expect(1)
            .mount(&server)
            .await;

        let r = ResponsesReasoner::new(cfg(server.uri())).unwrap();
        let out = r.complete(&CompletionRequest::text("classify")).await.unwrap();
        assert_eq!(out, "math");
    }

    #[tokio::test]
    async fn api_errors_surface_as_reasoner_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(ResponseTemplate::new(401).set_body_string(r#"{"error":"bad key"}"#))
            .mount(&server)
            .await;

        let r = ResponsesReasoner::new(cfg(server.uri())).unwrap();
        let err = r.complete(&CompletionRequest::text("x")).await.unwrap_err();
        match err {
            QuizError::Reasoner(msg) => assert!(msg.contains("401")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn empty_output_is_an_error() {
        assert!(ResponsesReasoner::parse_output(&json!({ "output": [] })).is_err());
        let v = json!({ "output": [{ "type": "message", "content": [
            { "type": "output_text", "text": "a" },
            { "type": "output_text", "text": "b" }
        ]}]});
        assert_eq!(ResponsesReasoner::parse_output(&v).unwrap(), "ab");
    }
}
