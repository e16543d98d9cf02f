use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ClinicError;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash-latest";

const TRANSLATION_PROMPT: &str =
    "Translate the following Chinese text to English, providing only the English translation: ";
const PRIMING_REQUEST: &str = "你好，我需要幫助翻譯中文到英文。";
const PRIMING_REPLY: &str = "當然可以！請提供您需要翻譯的中文內容，我會幫您翻譯成英文。";

#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

impl TranslatorConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        TranslatorConfig {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
    top_p: f32,
    top_k: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct UpstreamError {
    error: UpstreamErrorBody,
}

#[derive(Deserialize)]
struct UpstreamErrorBody {
    #[serde(default)]
    message: String,
}

fn build_request(text: &str) -> (String, GenerationConfig) {
    (
        format!("{TRANSLATION_PROMPT}{text}"),
        GenerationConfig {
            max_output_tokens: 8192,
            temperature: 0.3,
            top_p: 0.9,
            top_k: 40,
        },
    )
}

/// Chinese to English translation through the generative language API.
#[derive(Debug, Clone)]
pub struct Translator {
    http: reqwest::Client,
    config: TranslatorConfig,
}

impl Translator {
    pub fn new(config: TranslatorConfig) -> Result<Self, ClinicError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClinicError::Internal(format!("failed to build http client: {e}")))?;
        Ok(Translator { http, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }

    pub async fn translate(&self, text: &str) -> Result<String, ClinicError> {
        if text.trim().is_empty() {
            return Err(ClinicError::Validation("text must not be empty".to_string()));
        }

        let (prompt, generation_config) = build_request(text);
        let body = GenerateRequest {
            contents: vec![
                Content {
                    role: "user",
                    parts: vec![Part {
                        text: PRIMING_REQUEST,
                    }],
                },
                Content {
                    role: "model",
                    parts: vec![Part {
                        text: PRIMING_REPLY,
                    }],
                },
                Content {
                    role: "user",
                    parts: vec![Part { text: &prompt }],
                },
            ],
            generation_config,
        };

        let resp = self
            .http
            .post(self.endpoint())
            .query(&[("key", self.config.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("translation request failed: {e}");
                ClinicError::Upstream(format!("translation request failed: {e}"))
            })?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .json::<UpstreamError>()
                .await
                .map(|e| e.error.message)
                .unwrap_or_default();
            tracing::warn!(%status, "translation upstream rejected request: {message}");
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
                || message.contains("API key not valid")
            {
                return Err(ClinicError::Unauthorized(
                    "the translation API key was rejected".to_string(),
                ));
            }
            return Err(ClinicError::Upstream(format!(
                "translation service returned {status}"
            )));
        }

        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| ClinicError::Upstream(format!("unreadable translation response: {e}")))?;

        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if text.is_empty() {
            return Err(ClinicError::Upstream(
                "translation response contained no text".to_string(),
            ));
        }
        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::collections::HashMap;

    async fn fake_generate(
        Path(model_action): Path<String>,
        Query(query): Query<HashMap<String, String>>,
        Json(body): Json<serde_json::Value>,
    ) -> axum::response::Response {
        if query.get("key").map(String::as_str) != Some("good-key") {
            let err = serde_json::json!({
                "error": {"code": 400, "message": "API key not valid. Please pass a valid API key."}
            });
            return (StatusCode::BAD_REQUEST, Json(err)).into_response();
        }
        assert_eq!(model_action, "test-model:generateContent");
        assert_eq!(body["contents"].as_array().unwrap().len(), 3);
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["generationConfig"]["topK"], 40);
        let prompt = body["contents"][2]["parts"][0]["text"].as_str().unwrap();
        let source = prompt.trim_start_matches(TRANSLATION_PROMPT);
        let reply = serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": format!(" EN[{source}]\n")}]}
            }]
        });
        Json(reply).into_response()
    }

    async fn start_fake() -> String {
        let app = Router::new().route("/v1beta/models/{model_action}", post(fake_generate));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn config(base_url: String, key: &str) -> TranslatorConfig {
        TranslatorConfig {
            api_key: key.to_string(),
            base_url,
            model: "test-model".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn translates_through_upstream() {
        let base = start_fake().await;
        let translator = Translator::new(config(base, "good-key")).unwrap();
        let out = translator.translate("睡眠呼吸中止症").await.unwrap();
        assert_eq!(out, "EN[睡眠呼吸中止症]");
    }

    #[tokio::test]
    async fn invalid_key_is_unauthorized() {
        let base = start_fake().await;
        let translator = Translator::new(config(base, "bad-key")).unwrap();
        let err = translator.translate("你好").await.unwrap_err();
        assert!(matches!(err, ClinicError::Unauthorized(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn empty_text_is_rejected_locally() {
        let translator =
            Translator::new(config("http://127.0.0.1:9".to_string(), "good-key")).unwrap();
        let err = translator.translate("  ").await.unwrap_err();
        assert!(matches!(err, ClinicError::Validation(_)));
    }

    #[tokio::test]
    async fn unreachable_upstream() {
        let port = portpicker::pick_unused_port().expect("no free port");
        let translator =
            Translator::new(config(format!("http://127.0.0.1:{port}"), "good-key")).unwrap();
        let err = translator.translate("你好").await.unwrap_err();
        assert!(matches!(err, ClinicError::Upstream(_)), "got {err:?}");
    }
}
