use serde::{Deserialize, Serialize};

pub const NO_SUBJECT: &str = "No subject";
pub const UNKNOWN_SENDER: &str = "Unknown sender";
pub const NO_READABLE_CONTENT: &str = "No readable content";
pub const NO_CONTENT: &str = "No content";

/// One fetched email, flattened to the fields the scanner cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub subject: String,
    pub from: String,
    pub body: String,
}

/// Fields the model is asked to pull out of a statement email.
/// Nothing here is validated; any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreditCardInfo {
    #[serde(default)]
    pub bank: Option<String>,
    #[serde(default)]
    pub ending_digits: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
}

/// Cleaned model replies for one message. `body` is only set when the body
/// differed from the subject and was sent separately.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub subject: String,
    pub body: Option<String>,
}

impl Extraction {
    /// Best-effort structured view, preferring the body reply.
    pub fn info(&self) -> Option<CreditCardInfo> {
        self.body
            .as_deref()
            .and_then(CreditCardInfo::parse)
            .or_else(|| CreditCardInfo::parse(&self.subject))
    }
}

impl CreditCardInfo {
    pub fn parse(raw: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(raw.trim()).ok()?;
        let obj = value.as_object()?;

        let text = |key: &str| match obj.get(key) {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        // Models sometimes quote the amount or add a currency symbol.
        let amount = match obj.get("amount") {
            Some(serde_json::Value::Number(n)) => n.as_f64(),
            Some(serde_json::Value::String(s)) => s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect::<String>()
                .parse()
                .ok(),
            _ => None,
        };

        Some(Self {
            bank: text("bank"),
            ending_digits: text("ending_digits"),
            due_date: text("due_date"),
            amount,
        })
    }
}
