// src/translate/groq.rs
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::translate::{TranslateError, Translation, Translator};

pub const GROQ_CHAT_URL: &str = "https://api.groq.com/openai/v1/chat/completions";
pub const DEFAULT_TRANSLATION_MODEL: &str = "llama-3.1-8b-instant";
const PROMPT_DESCRIPTION_MAX_CHARS: usize = 2000;

const SYSTEM_PROMPT: &str = "You are a professional translator specializing in cryptocurrency and financial news. Translate accurately while preserving technical terms and coin names. Respond ONLY with valid JSON.";

/// Display name for a language code; unknown codes pass through.
pub fn language_name(code: &str) -> String {
    let name = match code.to_ascii_lowercase().as_str() {
        "en" => "English",
        "ko" => "Korean",
        "zh" => "Chinese",
        "ja" => "Japanese",
        "es" => "Spanish",
        "pt" => "Portuguese",
        "de" => "German",
        "fr" => "French",
        "ru" => "Russian",
        "tr" => "Turkish",
        "it" => "Italian",
        "nl" => "Dutch",
        "pl" => "Polish",
        "vi" => "Vietnamese",
        "id" => "Indonesian",
        "th" => "Thai",
        "ar" => "Arabic",
        "fa" => "Persian",
        "uk" => "Ukrainian",
        _ => return code.to_string(),
    };
    name.to_string()
}

/// Groq chat-completions client (OpenAI-compatible API).
pub struct GroqTranslator {
    http: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
    target_language: String,
}

impl GroqTranslator {
    pub fn new(
        api_key: impl Into<String>,
        model: Option<&str>,
        target_language: &str,
    ) -> Result<Self, TranslateError> {
        let http = reqwest::Client::builder()
            .user_agent("cryptosignal-news/0.1")
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TranslateError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            model: model.unwrap_or(DEFAULT_TRANSLATION_MODEL).to_string(),
            endpoint: GROQ_CHAT_URL.to_string(),
            target_language: target_language.to_ascii_lowercase(),
        })
    }

    /// Point at another OpenAI-compatible endpoint (proxies, tests).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn user_prompt(&self, title: &str, description: &str, source_language: &str) -> String {
        let desc: String = description.chars().take(PROMPT_DESCRIPTION_MAX_CHARS).collect();
        format!(
            "Translate this {from} cryptocurrency news article to {to}. Return ONLY valid JSON with \"title\" and \"description\" fields.\n\nTitle: {title}\n\nDescription: {desc}\n\nResponse format:\n{{\"title\": \"translated title\", \"description\": \"translated description\"}}",
            from = language_name(source_language),
            to = language_name(&self.target_language),
        )
    }
}

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatReq<'a> {
    model: &'a str,
    messages: Vec<Msg<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResp {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMsg,
}

#[derive(Deserialize)]
struct ChoiceMsg {
    content: String,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[derive(Deserialize)]
struct TranslatedFields {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
}

/// Pull the JSON object out of a model answer, tolerating code fences
/// and chatter around it. Falls back to the originals when nothing parses.
pub fn parse_translation(content: &str, title: &str, description: &str) -> Translation {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let parsed = serde_json::from_str::<TranslatedFields>(trimmed).ok().or_else(|| {
        let start = trimmed.find('{')?;
        let end = trimmed.rfind('}')?;
        (end > start)
            .then(|| serde_json::from_str::<TranslatedFields>(&trimmed[start..=end]).ok())
            .flatten()
    });

    match parsed {
        Some(f) => Translation {
            title: if f.title.trim().is_empty() { title.to_string() } else { f.title.trim().to_string() },
            description: if f.description.trim().is_empty() {
                description.to_string()
            } else {
                f.description.trim().to_string()
            },
        },
        None => {
            tracing::warn!(target: "translate", "unparsable translation answer, keeping original text");
            Translation {
                title: title.to_string(),
                description: description.to_string(),
            }
        }
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s > 0.0)
        .map(Duration::from_secs_f64)
}

#[async_trait]
impl Translator for GroqTranslator {
    async fn translate(
        &self,
        title: &str,
        description: &str,
        source_language: &str,
    ) -> Result<Translation, TranslateError> {
        if source_language.eq_ignore_ascii_case(&self.target_language) {
            return Ok(Translation {
                title: title.to_string(),
                description: description.to_string(),
            });
        }

        let prompt = self.user_prompt(title, description, source_language);
        let req = ChatReq {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                Msg {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: 0.3,
            max_tokens: 1024,
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| TranslateError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or(body);
            return Err(TranslateError::Api {
                status: status.as_u16(),
                message,
                retry_after,
            });
        }

        let parsed: ChatResp = resp
            .json()
            .await
            .map_err(|e| TranslateError::Response(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| TranslateError::Response("no choices in response".into()))?;

        Ok(parse_translation(&content, title, description))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_fenced_json() {
        let t = parse_translation(r#"{"title":"Hello","description":"World"}"#, "a", "b");
        assert_eq!(t.title, "Hello");
        assert_eq!(t.description, "World");

        let fenced = "```json\n{\"title\": \"BTC up\", \"description\": \"Gains\"}\n```";
        let t = parse_translation(fenced, "a", "b");
        assert_eq!(t.title, "BTC up");
    }

    #[test]
    fn extracts_json_from_chatter() {
        let answer = "Sure! Here it is: {\"title\": \"ETH news\", \"description\": \"\"} Hope it helps.";
        let t = parse_translation(answer, "orig title", "orig desc");
        assert_eq!(t.title, "ETH news");
        // empty field keeps the original
        assert_eq!(t.description, "orig desc");
    }

    #[test]
    fn garbage_keeps_originals() {
        let t = parse_translation("I cannot translate this.", "제목", "본문");
        assert_eq!(t.title, "제목");
        assert_eq!(t.description, "본문");
    }

    #[test]
    fn language_names_fall_back_to_code() {
        assert_eq!(language_name("KO"), "Korean");
        assert_eq!(language_name("xx"), "xx");
    }

    #[tokio::test]
    async fn same_language_returns_input_without_calling_out() {
        let tr = GroqTranslator::new("", None, "en")
            .unwrap()
            .with_endpoint("http://127.0.0.1:9/unreachable");
        let t = tr.translate("Title", "Desc", "EN").await.unwrap();
        assert_eq!(t.title, "Title");
    }
}
