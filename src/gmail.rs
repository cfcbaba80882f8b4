use crate::config::MAX_STATEMENTS;
use crate::models::{self, MessageRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use google_gmail1::Gmail;
use google_gmail1::api::{Message, MessagePart};
use hyper::client::HttpConnector;
use hyper_rustls::HttpsConnector;

pub type HttpsClient = hyper::Client<HttpsConnector<HttpConnector>>;

pub fn https_client() -> Result<HttpsClient> {
    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .context("Failed to load native roots")?
        .https_only()
        .enable_http1()
        .build();
    Ok(hyper::Client::builder().build(connector))
}

/// The two Gmail calls a statement scan needs.
#[async_trait]
pub trait MailboxApi: Send + Sync {
    async fn list_message_ids(&self, query: &str, max_results: u32) -> Result<Vec<String>>;
    async fn get_message(&self, id: &str) -> Result<MessageRecord>;
}

#[derive(Clone)]
pub struct GmailClient {
    hub: Gmail<HttpsConnector<HttpConnector>>,
}

impl GmailClient {
    pub fn new(hub: Gmail<HttpsConnector<HttpConnector>>) -> Self {
        Self { hub }
    }

    pub async fn profile_email(&self) -> Result<Option<String>> {
        let (_, profile) = self
            .hub
            .users()
            .get_profile("me")
            .doit()
            .await
            .context("Failed to get profile")?;
        Ok(profile.email_address)
    }
}

#[async_trait]
impl MailboxApi for GmailClient {
    async fn list_message_ids(&self, query: &str, max_results: u32) -> Result<Vec<String>> {
        let (_, message_list) = self
            .hub
            .users()
            .messages_list("me")
            .q(query)
            .max_results(max_results)
            .doit()
            .await
            .context("Failed to list messages")?;

        Ok(message_list
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| m.id)
            .collect())
    }

    async fn get_message(&self, id: &str) -> Result<MessageRecord> {
        let (_, msg) = self
            .hub
            .users()
            .messages_get("me", id)
            .format("full")
            .doit()
            .await
            .with_context(|| format!("Failed to get message {}", id))?;

        Ok(record_from_message(id, msg))
    }
}

/// Flattens a Gmail message, filling placeholders for missing headers.
pub fn record_from_message(requested_id: &str, msg: Message) -> MessageRecord {
    let mut subject = None;
    let mut from = None;
    let mut body = models::NO_CONTENT.to_string();

    if let Some(payload) = &msg.payload {
        for header in payload.headers.iter().flatten() {
            match header.name.as_deref() {
                Some("Subject") => subject = header.value.clone(),
                Some("From") => from = header.value.clone(),
                _ => {}
            }
        }
        body = message_body(payload);
    }

    MessageRecord {
        id: msg.id.unwrap_or_else(|| requested_id.to_string()),
        subject: subject.unwrap_or_else(|| models::NO_SUBJECT.to_string()),
        from: from.unwrap_or_else(|| models::UNKNOWN_SENDER.to_string()),
        body,
    }
}

/// Lists and fetches up to ten statement emails. Any failure is logged and
/// turned into an empty result.
pub async fn fetch_statements<A: MailboxApi + ?Sized>(
    api: &A,
    query: &str,
    max_results: u32,
) -> Vec<MessageRecord> {
    match try_fetch(api, query, max_results.min(MAX_STATEMENTS)).await {
        Ok(records) => {
            tracing::info!("Fetched {} statement messages", records.len());
            records
        }
        Err(e) => {
            tracing::error!("Error accessing Gmail: {:#}", e);
            Vec::new()
        }
    }
}

async fn try_fetch<A: MailboxApi + ?Sized>(
    api: &A,
    query: &str,
    max_results: u32,
) -> Result<Vec<MessageRecord>> {
    let ids = api.list_message_ids(query, max_results).await?;
    let mut records = Vec::with_capacity(ids.len().min(max_results as usize));
    for id in ids.iter().take(max_results as usize) {
        let record = api.get_message(id).await?;
        tracing::debug!("subject {}, from {}", record.subject, record.from);
        records.push(record);
    }
    Ok(records)
}

/// Picks the readable body of a message: top-level data first, then the
/// first text/plain part, then the first text/html part.
pub fn message_body(payload: &MessagePart) -> String {
    if let Some(data) = payload.body.as_ref().and_then(|b| b.data.as_ref()) {
        if !data.is_empty() {
            return decode_body_data(data);
        }
    }

    match &payload.parts {
        Some(parts) => find_part(parts, "text/plain")
            .or_else(|| find_part(parts, "text/html"))
            .unwrap_or_else(|| models::NO_READABLE_CONTENT.to_string()),
        None => models::NO_CONTENT.to_string(),
    }
}

fn find_part(parts: &[MessagePart], mime_type: &str) -> Option<String> {
    for part in parts {
        if part.mime_type.as_deref() == Some(mime_type) {
            if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_ref()) {
                return Some(decode_body_data(data));
            }
        }
        if let Some(nested) = &part.parts {
            if let Some(body) = find_part(nested, mime_type) {
                return Some(body);
            }
        }
    }
    None
}

/// Gmail hands out base64url; depending on the client version the bytes
/// may already be decoded. Anything that is not base64 of UTF-8 text is
/// taken as-is.
pub fn decode_body_data(data: &[u8]) -> String {
    let data_str = String::from_utf8_lossy(data);
    let trimmed = data_str.trim().trim_end_matches('=');

    let decoded = general_purpose::URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(trimmed));

    match decoded.ok().and_then(|bytes| String::from_utf8(bytes).ok()) {
        Some(text) => text,
        None => data_str.into_owned(),
    }
}
