use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "openai" or "ollama"
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,
    pub openai: Option<OpenAIConfig>,
    pub ollama: Option<OllamaConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

fn default_retry_count() -> usize {
    2
}
fn default_retry_delay() -> u64 {
    5
}
fn default_llm_timeout() -> u64 {
    300
}

/// OpenAI-style chat completion: `system` carries the agent's role context.
#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn chat(&self, system: &str, user: &str) -> Result<String>;
}

pub fn create_llm(config: &LlmConfig) -> Result<Box<dyn LlmClient>> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_seconds))
        .build()
        .context("Failed to build HTTP client")?;
    let client: Box<dyn LlmClient> = match config.provider.as_str() {
        "ollama" => {
            let cfg = config.ollama.as_ref().context("Ollama config missing")?;
            Box::new(OllamaClient::new(http, &cfg.base_url, &cfg.model))
        }
        "openai" => {
            let cfg = config.openai.as_ref().context("OpenAI config missing")?;
            Box::new(OpenAIClient::new(
                http,
                &cfg.api_key,
                &cfg.model,
                cfg.base_url.as_deref(),
            ))
        }
        _ => return Err(anyhow!("Unknown LLM provider: {}", config.provider)),
    };
    Ok(Box::new(RetryingLlm::new(
        client,
        config.retry_count,
        Duration::from_secs(config.retry_delay_seconds),
    )))
}

/// Retries a failed chat call a fixed number of times with a fixed pause.
#[derive(Debug)]
pub struct RetryingLlm {
    inner: Box<dyn LlmClient>,
    retry_count: usize,
    delay: Duration,
}

impl RetryingLlm {
    pub fn new(inner: Box<dyn LlmClient>, retry_count: usize, delay: Duration) -> Self {
        Self {
            inner,
            retry_count,
            delay,
        }
    }
}

#[async_trait]
impl LlmClient for RetryingLlm {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.inner.chat(system, user).await {
                Ok(text) => return Ok(text),
                Err(e) if attempt < self.retry_count => {
                    attempt += 1;
                    warn!(
                        "LLM call failed ({}), retry {}/{} in {:?}",
                        e, attempt, self.retry_count, self.delay
                    );
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// --- Ollama ---
#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(client: reqwest::Client, base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
        }
    }
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

fn messages(system: &str, user: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage {
            role: "system".to_string(),
            content: system.to_string(),
        },
        ChatMessage {
            role: "user".to_string(),
            content: user.to_string(),
        },
    ]
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessageResponse,
}

#[derive(Deserialize)]
struct OllamaMessageResponse {
    content: String,
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);

        let request_body = OllamaRequest {
            model: self.model.clone(),
            messages: messages(system, user),
            stream: false,
        };

        let resp = self.client.post(&url).json(&request_body).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Ollama API error: {}", error_text));
        }

        let result: OllamaResponse = resp.json().await?;
        Ok(result.message.content)
    }
}

// --- OpenAI compatible ---

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(client: reqwest::Client, api_key: &str, model: &str, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client,
        }
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        let request_body = OpenAIRequest {
            model: self.model.clone(),
            messages: messages(system, user),
        };

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("OpenAI API error: {}", error_text));
        }

        let result: OpenAIResponse = resp.json().await?;
        if let Some(choice) = result.choices.first() {
            if let Some(content) = &choice.message.content {
                return Ok(content.trim().to_string());
            }
        }

        Err(anyhow!("OpenAI response empty or missing content"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_openai_response_parsing_success() {
        let json = r#"{
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "{\"chapters\": []}"
                },
                "finish_reason": "stop"
            }]
        }"#;

        let result: OpenAIResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            result.choices[0].message.content.as_deref(),
            Some("{\"chapters\": []}")
        );
    }

    #[test]
    fn test_openai_response_parsing_null_content() {
        let json = r#"{"choices": [{"message": {"role": "assistant", "content": null}}]}"#;
        let result: OpenAIResponse = serde_json::from_str(json).unwrap();
        assert!(result.choices[0].message.content.is_none());
    }

    #[test]
    fn test_unknown_provider() {
        let config = LlmConfig {
            provider: "gemini".to_string(),
            retry_count: 0,
            retry_delay_seconds: 0,
            timeout_seconds: 1,
            openai: None,
            ollama: None,
        };
        assert!(create_llm(&config).is_err());
    }

    #[derive(Debug)]
    struct FlakyLlm {
        failures_left: Arc<Mutex<usize>>,
        calls: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl LlmClient for FlakyLlm {
        async fn chat(&self, _system: &str, _user: &str) -> Result<String> {
            *self.calls.lock().unwrap() += 1;
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(anyhow!("connection reset"));
            }
            Ok("ok".to_string())
        }
    }

    #[tokio::test]
    async fn test_retrying_llm_recovers() -> Result<()> {
        let calls = Arc::new(Mutex::new(0));
        let llm = RetryingLlm::new(
            Box::new(FlakyLlm {
                failures_left: Arc::new(Mutex::new(2)),
                calls: calls.clone(),
            }),
            2,
            Duration::from_millis(1),
        );
        assert_eq!(llm.chat("s", "u").await?, "ok");
        assert_eq!(*calls.lock().unwrap(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_retrying_llm_gives_up() {
        let calls = Arc::new(Mutex::new(0));
        let llm = RetryingLlm::new(
            Box::new(FlakyLlm {
                failures_left: Arc::new(Mutex::new(5)),
                calls: calls.clone(),
            }),
            1,
            Duration::from_millis(1),
        );
        assert!(llm.chat("s", "u").await.is_err());
        assert_eq!(*calls.lock().unwrap(), 2);
    }
}
