//! Image captioning through a hosted inference endpoint
//!
//! Speaks the Hugging Face Inference API `image-to-text` task, which serves
//! BLIP (`Salesforce/blip-image-captioning-base`) among others.

use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::config::CaptionConfig;

#[derive(Debug, Serialize)]
struct CaptionRequest<'a> {
    inputs: &'a str,
    parameters: CaptionParameters,
}

#[derive(Debug, Serialize)]
struct CaptionParameters {
    max_new_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GeneratedText {
    generated_text: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CaptionResponse {
    Many(Vec<GeneratedText>),
    One(GeneratedText),
}

/// Pull the first generated caption out of an endpoint response body
pub fn parse_caption_response(body: &str) -> Result<String> {
    let response: CaptionResponse =
        serde_json::from_str(body).context("Caption endpoint returned unexpected JSON")?;

    let generated = match response {
        CaptionResponse::Many(items) => items
            .into_iter()
            .next()
            .context("Caption endpoint returned no results")?,
        CaptionResponse::One(item) => item,
    };

    Ok(generated.generated_text.trim().to_string())
}

pub struct RemoteCaptioner {
    client: reqwest::Client,
    url: String,
    model: String,
    api_token: Option<String>,
    max_new_tokens: u32,
}

impl RemoteCaptioner {
    pub fn new(config: &CaptionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            url: format!("{}/models/{}", config.endpoint.trim_end_matches('/'), config.model),
            model: config.model.clone(),
            api_token: config.api_token.clone().filter(|t| !t.is_empty()),
            max_new_tokens: config.max_new_tokens,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Caption raw image bytes
    pub async fn caption(&self, image_data: &[u8]) -> Result<String> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image_data);
        let payload = CaptionRequest {
            inputs: &encoded,
            parameters: CaptionParameters {
                max_new_tokens: self.max_new_tokens,
            },
        };

        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Caption request to {} failed", self.url))?;
        let status = response.status();
        let body = response.text().await.context("Failed to read caption response")?;

        if !status.is_success() {
            let excerpt: String = body.chars().take(300).collect();
            anyhow::bail!("Caption endpoint returned {}: {}", status, excerpt);
        }

        let caption = parse_caption_response(&body)?;
        tracing::debug!("Caption from {}: {}", self.model, caption);
        Ok(caption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};

    #[test]
    fn test_parse_list_response() {
        let caption = parse_caption_response(r#"[{"generated_text": " a man riding a horse "}]"#).unwrap();
        assert_eq!(caption, "a man riding a horse");
    }

    #[test]
    fn test_parse_single_response() {
        let caption = parse_caption_response(r#"{"generated_text": "a woman with a hat"}"#).unwrap();
        assert_eq!(caption, "a woman with a hat");
    }

    #[test]
    fn test_parse_bad_responses() {
        assert!(parse_caption_response("[]").is_err());
        assert!(parse_caption_response(r#"{"error": "loading"}"#).is_err());
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn config(endpoint: String) -> CaptionConfig {
        CaptionConfig {
            endpoint,
            model: "test/blip".to_string(),
            api_token: Some("secret".to_string()),
            ..CaptionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_caption_round_trip() {
        let router = Router::new().route(
            "/models/test/blip",
            post(|headers: axum::http::HeaderMap, Json(body): Json<serde_json::Value>| async move {
                assert_eq!(headers["authorization"], "Bearer secret");
                assert_eq!(body["parameters"]["max_new_tokens"], 32);
                assert_eq!(body["inputs"], "AQID");
                Json(serde_json::json!([{"generated_text": "a man in a suit"}]))
            }),
        );
        let endpoint = serve(router).await;

        let captioner = RemoteCaptioner::new(&config(endpoint)).unwrap();
        let caption = captioner.caption(&[1, 2, 3]).await.unwrap();
        assert_eq!(caption, "a man in a suit");
    }

    #[tokio::test]
    async fn test_caption_error_status() {
        let router = Router::new().route(
            "/models/test/blip",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "model is loading") }),
        );
        let endpoint = serve(router).await;

        let captioner = RemoteCaptioner::new(&config(endpoint)).unwrap();
        let err = captioner.caption(&[1, 2, 3]).await.unwrap_err();
        assert!(err.to_string().contains("503"));
        assert!(err.to_string().contains("model is loading"));
    }
}
