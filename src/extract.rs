use crate::config::ModelSettings;
use crate::models::{Extraction, MessageRecord};
use async_trait::async_trait;
use rig::agent::Agent;
use rig::client::CompletionClient;
use rig::completion::{CompletionModel, Prompt, PromptError};
use rig::providers::gemini;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;

pub const EXTRACTION_PROMPT: &str = "You read credit card statement emails. \
From the text below, extract the issuing bank name, the last four digits of the card, \
the payment due date and the total amount due. \
Reply with exactly one JSON object and nothing else, using these keys: \
{\"bank\": string, \"ending_digits\": string, \"due_date\": string, \"amount\": number}. \
Use null for anything the text does not state.\n\nText:\n";

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Failed to create Gemini client: {0}")]
    Client(String),

    #[error("Model request failed: {0}")]
    Prompt(#[from] PromptError),
}

/// A hosted text model that turns a prompt into (maybe) some text.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<Option<String>, ExtractError>;
}

/// Bridges a rig agent to [`GenerativeModel`].
pub struct RigModel<M: CompletionModel> {
    agent: Agent<M>,
    model_name: String,
}

impl<M: CompletionModel> RigModel<M> {
    pub fn new(agent: Agent<M>, model_name: &str) -> Self {
        Self {
            agent,
            model_name: model_name.to_string(),
        }
    }
}

#[async_trait]
impl<M> GenerativeModel for RigModel<M>
where
    M: CompletionModel + 'static,
{
    async fn generate(&self, prompt: &str) -> Result<Option<String>, ExtractError> {
        let reply = self.agent.prompt(prompt).await?;
        tracing::debug!("{} replied with {} bytes", self.model_name, reply.len());
        Ok(Some(reply).filter(|r| !r.trim().is_empty()))
    }
}

/// Gemini `generateContent` through rig's provider. `settings.endpoint` is
/// the API base URL, so tests can point it at a local server.
pub fn gemini_model(
    settings: &ModelSettings,
    api_key: &SecretString,
) -> Result<Arc<dyn GenerativeModel>, ExtractError> {
    let client: gemini::Client = gemini::Client::builder()
        .api_key(api_key.expose_secret())
        .base_url(settings.endpoint.trim_end_matches('/'))
        .build()
        .map_err(|e| ExtractError::Client(e.to_string()))?;

    let agent = client.agent(settings.model.as_str()).build();
    tracing::info!("Using Gemini (model: {})", settings.model);
    Ok(Arc::new(RigModel::new(agent, &settings.model)))
}

/// Removes markdown code fences the model likes to wrap JSON in.
pub fn strip_code_fences(raw: &str) -> String {
    let mut cleaned = raw.replace("```json", "");
    // Removing one fence can join stray backticks into another.
    while cleaned.contains("```") {
        cleaned = cleaned.replace("```", "");
    }
    cleaned.trim().to_string()
}

#[derive(Clone)]
pub struct Extractor {
    model: Arc<dyn GenerativeModel>,
}

impl Extractor {
    pub fn new(model: Arc<dyn GenerativeModel>) -> Self {
        Self { model }
    }

    /// One model call. An empty or failed reply comes back as "".
    pub async fn extract(&self, text: &str) -> String {
        let prompt = format!("{}{}", EXTRACTION_PROMPT, text);
        match self.model.generate(&prompt).await {
            Ok(Some(reply)) => strip_code_fences(&reply),
            Ok(None) => {
                tracing::warn!("Model returned no text");
                String::new()
            }
            Err(e) => {
                tracing::error!("Extraction failed: {}", e);
                String::new()
            }
        }
    }

    pub async fn extract_message(&self, record: &MessageRecord) -> Extraction {
        let subject = self.extract(&record.subject).await;
        let body = if record.body != record.subject {
            Some(self.extract(&record.body).await)
        } else {
            None
        };
        tracing::debug!("Extracted fields for message {}", record.id);
        Extraction { subject, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig::completion::CompletionError;
    use std::sync::Mutex;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path_regex},
    };

    struct ScriptedModel {
        replies: Mutex<Vec<Result<Option<String>, ExtractError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<Option<String>, ExtractError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().rev().collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl GenerativeModel for ScriptedModel {
        async fn generate(&self, prompt: &str) -> Result<Option<String>, ExtractError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.replies.lock().unwrap().pop().unwrap_or(Ok(None))
        }
    }

    fn record(subject: &str, body: &str) -> MessageRecord {
        MessageRecord {
            id: "m1".to_string(),
            subject: subject.to_string(),
            from: "bank@example.com".to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_strip_code_fences() {
        let raw = "```json\n{\"bank\": \"Acme\"}\n```";
        assert_eq!(strip_code_fences(raw), "{\"bank\": \"Acme\"}");
    }

    #[test]
    fn test_strip_leaves_no_markers() {
        for raw in [
            "```json```json{}```",
            "``````",
            "text ```json inner ``` more ```",
            "no fences",
        ] {
            let cleaned = strip_code_fences(raw);
            assert!(!cleaned.contains("```json"), "{:?}", cleaned);
            assert!(!cleaned.contains("```"), "{:?}", cleaned);
        }
    }

    #[tokio::test]
    async fn test_distinct_body_costs_two_calls() {
        let model = ScriptedModel::new(vec![
            Ok(Some("```json\n{\"bank\": \"Acme\"}\n```".to_string())),
            Ok(Some("{\"amount\": 10.5}".to_string())),
        ]);
        let extractor = Extractor::new(model.clone());

        let extraction = extractor
            .extract_message(&record("Credit card statement", "Amount due 10.50"))
            .await;

        assert_eq!(model.calls(), 2);
        assert_eq!(extraction.subject, "{\"bank\": \"Acme\"}");
        assert_eq!(extraction.body.as_deref(), Some("{\"amount\": 10.5}"));
        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0].starts_with(EXTRACTION_PROMPT));
        assert!(prompts[0].ends_with("Credit card statement"));
        assert!(prompts[1].ends_with("Amount due 10.50"));
    }

    #[tokio::test]
    async fn test_identical_body_is_not_sent_twice() {
        let model = ScriptedModel::new(vec![Ok(Some("{}".to_string()))]);
        let extractor = Extractor::new(model.clone());

        let extraction = extractor
            .extract_message(&record("Statement", "Statement"))
            .await;

        assert_eq!(model.calls(), 1);
        assert_eq!(extraction.body, None);
    }

    #[tokio::test]
    async fn test_missing_or_failed_reply_is_empty() {
        let model = ScriptedModel::new(vec![
            Ok(None),
            Err(ExtractError::Prompt(PromptError::CompletionError(
                CompletionError::ProviderError("quota exceeded".to_string()),
            ))),
        ]);
        let extractor = Extractor::new(model);

        assert_eq!(extractor.extract("first").await, "");
        assert_eq!(extractor.extract("second").await, "");
    }

    fn settings_for(server: &MockServer) -> ModelSettings {
        ModelSettings {
            endpoint: format!("{}/", server.uri()),
            ..ModelSettings::default()
        }
    }

    fn gemini_extractor(server: &MockServer) -> Extractor {
        let model = gemini_model(&settings_for(server), &SecretString::from("test-key")).unwrap();
        Extractor::new(model)
    }

    #[tokio::test]
    async fn test_rate_limited_gemini_reply_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"/models/gemini-1\.5-flash:generateContent$"))
            .respond_with(ResponseTemplate::new(429).set_body_raw(
                r#"{"error":{"code":429,"message":"Resource exhausted","status":"RESOURCE_EXHAUSTED"}}"#,
                "application/json",
            ))
            .expect(1..)
            .mount(&server)
            .await;

        let extractor = gemini_extractor(&server);
        assert_eq!(extractor.extract("Credit card statement").await, "");
    }

    #[tokio::test]
    async fn test_malformed_gemini_reply_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r":generateContent$"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("<html>not json</html>", "text/html"),
            )
            .expect(1..)
            .mount(&server)
            .await;

        let extractor = gemini_extractor(&server);
        assert_eq!(extractor.extract("Credit card statement").await, "");
    }
}
