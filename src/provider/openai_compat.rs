//! Shared chat-completions codec for the OpenAI-compatible vendor family
//! (OpenAI, Mistral, DeepSeek, OpenRouter).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::config::ProviderCredentials;
use crate::error::{Error, Result};

use super::driver::{
    build_http_client, classify_http_status, classify_transport_error, retry_after_ms,
};
use super::types::{ChatMessage, GenerationParams, ProviderId, ProviderResponse, Role};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: WireContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: String,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// One vendor endpoint speaking the chat-completions dialect.
pub(crate) struct ChatEndpoint {
    provider: ProviderId,
    http: Client,
    base_url: String,
    api_key: String,
    extra_headers: Vec<(String, String)>,
}

impl ChatEndpoint {
    pub fn new(
        provider: ProviderId,
        credentials: &ProviderCredentials,
        default_base_url: &str,
    ) -> Result<Self> {
        let http = build_http_client(credentials.timeout_secs)?;
        let base_url = credentials
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url.to_string());
        Ok(Self {
            provider,
            http,
            base_url,
            api_key: credentials.api_key.clone(),
            extra_headers: Vec::new(),
        })
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    fn apply_headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut builder = builder
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json");
        for (name, value) in &self.extra_headers {
            builder = builder.header(name, value);
        }
        builder
    }

    /// POST /chat/completions and parse the canonical result. An image
    /// payload, when present, is attached to the final user message as a
    /// base64 data URL part.
    pub async fn chat(
        &self,
        model_id: &str,
        transcript: &[ChatMessage],
        params: &GenerationParams,
        image: Option<(&[u8], &str)>,
    ) -> Result<ProviderResponse> {
        let mut messages: Vec<WireMessage> = transcript
            .iter()
            .map(|m| WireMessage {
                role: wire_role(m.role),
                content: WireContent::Text(m.content.clone()),
            })
            .collect();

        if let Some((data, mime_type)) = image {
            let data_url = format!("data:{};base64,{}", mime_type, BASE64.encode(data));
            if let Some(last_user) = messages.iter_mut().rev().find(|m| m.role == "user") {
                let text = match &last_user.content {
                    WireContent::Text(text) => text.clone(),
                    WireContent::Parts(_) => String::new(),
                };
                last_user.content = WireContent::Parts(vec![
                    ContentPart::Text { text },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: data_url },
                    },
                ]);
            }
        }

        let request = ChatRequest {
            model: model_id,
            messages,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            frequency_penalty: params.frequency_penalty,
            presence_penalty: params.presence_penalty,
            stop: params.stop_sequences.clone(),
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .apply_headers(self.http.post(&url))
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_transport_error(self.provider, e))?;

        let status = response.status();
        let retry_after = retry_after_ms(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| classify_transport_error(self.provider, e))?;

        if !status.is_success() {
            return Err(classify_http_status(self.provider, status, &body, retry_after));
        }

        let parsed: ChatResponse = serde_json::from_str(&body).map_err(|e| {
            Error::internal(format!("{} response parse failed: {}", self.provider, e))
        })?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            Error::internal(format!("{} returned no choices", self.provider))
        })?;

        let mut out = ProviderResponse::text(
            parsed.model,
            choice.message.content.unwrap_or_default(),
        );
        if let Some(usage) = parsed.usage {
            out = out.with_tokens(usage.prompt_tokens, usage.completion_tokens);
        }
        if let Some(reason) = choice.finish_reason {
            out = out.with_finish_reason(reason);
        }
        Ok(out)
    }

    /// GET a JSON resource relative to the base URL. Used for catalog
    /// listings and cheap health probes.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .apply_headers(self.http.get(&url))
            .send()
            .await
            .map_err(|e| classify_transport_error(self.provider, e))?;

        let status = response.status();
        let retry_after = retry_after_ms(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| classify_transport_error(self.provider, e))?;

        if !status.is_success() {
            return Err(classify_http_status(self.provider, status, &body, retry_after));
        }

        serde_json::from_str(&body).map_err(|e| {
            Error::internal(format!("{} response parse failed: {}", self.provider, e))
        })
    }

    /// POST a JSON body and parse a JSON response. Used by the embeddings
    /// endpoint.
    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        payload: &B,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .apply_headers(self.http.post(&url))
            .json(payload)
            .send()
            .await
            .map_err(|e| classify_transport_error(self.provider, e))?;

        let status = response.status();
        let retry_after = retry_after_ms(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| classify_transport_error(self.provider, e))?;

        if !status.is_success() {
            return Err(classify_http_status(self.provider, status, &body, retry_after));
        }

        serde_json::from_str(&body).map_err(|e| {
            Error::internal(format!("{} response parse failed: {}", self.provider, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_omits_unset_params() {
        let request = ChatRequest {
            model: "gpt-4o",
            messages: vec![WireMessage {
                role: "user",
                content: WireContent::Text("hi".into()),
            }],
            max_tokens: None,
            temperature: Some(0.7),
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"temperature\":0.7"));
        assert!(!json.contains("max_tokens"));
        assert!(!json.contains("top_p"));
        assert!(!json.contains("frequency_penalty"));
    }

    #[test]
    fn test_image_part_serialization() {
        let part = ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: "data:image/png;base64,AAAA".into(),
            },
        };
        let json = serde_json::to_string(&part).unwrap();
        assert!(json.contains("\"type\":\"image_url\""));
        assert!(json.contains("data:image/png;base64,AAAA"));
    }

    #[test]
    fn test_chat_response_parse() {
        let body = r#"{
            "id": "chatcmpl-1",
            "model": "gpt-4o-2024-08-06",
            "choices": [
                {"message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}
            ],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }"#;
        let parsed: ChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.choices.len(), 1);
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("hello"));
        assert_eq!(parsed.usage.as_ref().unwrap().prompt_tokens, 12);
    }
}
