use crate::models::{Extraction, MessageRecord};
use chrono::{DateTime, Local};
use std::collections::HashMap;

/// Session and scan results, owned by the UI loop.
///
/// Background tasks tag their results with the generation they were
/// started under; anything from an older generation is dropped.
#[derive(Debug, Default)]
pub struct AppState {
    pub authenticated: bool,
    pub account: Option<String>,
    pub messages: Vec<MessageRecord>,
    pub extractions: HashMap<String, Extraction>,
    pub loading: bool,
    pub last_fetched: Option<DateTime<Local>>,
    generation: u64,
}

impl AppState {
    pub fn sign_in(&mut self, account: Option<String>) {
        self.authenticated = true;
        self.account = account;
    }

    pub fn set_account(&mut self, account: Option<String>) {
        if self.authenticated {
            self.account = account;
        }
    }

    /// Starts a fetch, or returns `None` when one is already running.
    pub fn begin_fetch(&mut self) -> Option<u64> {
        if !self.authenticated || self.loading {
            return None;
        }
        self.generation += 1;
        self.loading = true;
        Some(self.generation)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    /// Replaces the message list wholesale. Returns false for stale results.
    pub fn replace_messages(&mut self, generation: u64, messages: Vec<MessageRecord>) -> bool {
        if !self.is_current(generation) {
            tracing::debug!("Dropping results of stale fetch {}", generation);
            return false;
        }
        self.messages = messages;
        self.extractions.clear();
        self.loading = false;
        self.last_fetched = Some(Local::now());
        true
    }

    pub fn record_extraction(&mut self, generation: u64, id: String, extraction: Extraction) {
        if self.is_current(generation) && self.messages.iter().any(|m| m.id == id) {
            self.extractions.insert(id, extraction);
        }
    }

    pub fn sign_out(&mut self) {
        self.authenticated = false;
        self.account = None;
        self.messages.clear();
        self.extractions.clear();
        self.loading = false;
        self.last_fetched = None;
        self.generation += 1;
    }
}
