use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Gmail caps a statement scan at this many messages.
pub const MAX_STATEMENTS: u32 = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub keybindings: Keybindings,
    pub gmail: GmailSettings,
    pub model: ModelSettings,
    pub broadcast: BroadcastSettings,
    pub log_file: LogFile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Keybindings {
    pub next_panel: Vec<String>,
    pub prev_panel: Vec<String>,
    pub move_up: Vec<String>,
    pub move_down: Vec<String>,
    pub sign_in: Vec<String>,
    pub grant: Vec<String>,
    pub deny: Vec<String>,
    pub refresh: Vec<String>,
    pub broadcast: Vec<String>,
    pub sign_out: Vec<String>,
    pub quit: Vec<String>,
}

impl Default for Keybindings {
    fn default() -> Self {
        Self {
            next_panel: vec!["l".to_string(), "Right".to_string(), "Tab".to_string()],
            prev_panel: vec!["h".to_string(), "Left".to_string(), "BackTab".to_string()],
            move_up: vec!["k".to_string(), "Up".to_string()],
            move_down: vec!["j".to_string(), "Down".to_string()],
            sign_in: vec!["s".to_string(), "Enter".to_string()],
            grant: vec!["g".to_string(), "Enter".to_string()],
            deny: vec!["d".to_string(), "Esc".to_string()],
            refresh: vec!["r".to_string()],
            broadcast: vec!["b".to_string()],
            sign_out: vec!["o".to_string()],
            quit: vec!["q".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GmailSettings {
    pub credentials_path: String,
    pub query: String,
    pub max_results: u32,
}

impl Default for GmailSettings {
    fn default() -> Self {
        Self {
            credentials_path: "credentials.json".to_string(),
            query: "subject:\"Credit card statement\"".to_string(),
            max_results: MAX_STATEMENTS,
        }
    }
}

impl GmailSettings {
    pub fn effective_max_results(&self) -> u32 {
        self.max_results.min(MAX_STATEMENTS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Base URL of the Gemini API.
    pub endpoint: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com".to_string(),
            model: "gemini-1.5-flash".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
        }
    }
}

impl ModelSettings {
    pub fn api_key(&self) -> Option<SecretString> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(SecretString::from)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastSettings {
    pub socket_path: String,
    pub component: String,
    pub extra_key: String,
    pub extra_value: String,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            socket_path: std::env::temp_dir()
                .join("statement-scan-receiver.sock")
                .to_string_lossy()
                .into_owned(),
            component: "briefing.StatementDataReceiver".to_string(),
            extra_key: "KeyName".to_string(),
            extra_value: "code1id".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogFile(pub String);

impl Default for LogFile {
    fn default() -> Self {
        Self("statement-scan.log".to_string())
    }
}

pub fn parse_key_string(key_str: &str) -> (KeyCode, KeyModifiers) {
    // A lone "-" is a key, not a separator.
    if key_str == "-" {
        return (KeyCode::Char('-'), KeyModifiers::empty());
    }

    let mut parts: Vec<&str> = key_str.split('-').collect();
    let mut modifiers = KeyModifiers::empty();

    let base_key_str = parts.pop().unwrap_or("");

    for part in parts {
        match part.to_lowercase().as_str() {
            "ctrl" => modifiers.insert(KeyModifiers::CONTROL),
            "alt" => modifiers.insert(KeyModifiers::ALT),
            "shift" => modifiers.insert(KeyModifiers::SHIFT),
            "cmd" | "command" | "super" => modifiers.insert(KeyModifiers::SUPER),
            "meta" => modifiers.insert(KeyModifiers::META),
            _ => {}
        }
    }

    let mut chars = base_key_str.chars();
    let code = match (base_key_str, chars.next(), chars.next()) {
        ("Backspace", _, _) => KeyCode::Backspace,
        ("Enter", _, _) => KeyCode::Enter,
        ("Left", _, _) => KeyCode::Left,
        ("Right", _, _) => KeyCode::Right,
        ("Up", _, _) => KeyCode::Up,
        ("Down", _, _) => KeyCode::Down,
        ("Tab", _, _) => KeyCode::Tab,
        ("BackTab", _, _) => KeyCode::BackTab,
        ("Esc", _, _) => KeyCode::Esc,
        (_, Some(c), None) => KeyCode::Char(c),
        _ => KeyCode::Null,
    };

    (code, modifiers)
}

pub fn matches_key(event: KeyEvent, bindings: &[String]) -> bool {
    bindings.iter().any(|b| {
        let (code, modifiers) = parse_key_string(b);
        event.code == code && event.modifiers.contains(modifiers)
    })
}

impl Config {
    pub fn load() -> Result<Self, toml::de::Error> {
        Self::load_from("settings.toml")
    }

    /// A missing file means defaults. A file that does not parse is an
    /// error, left for the caller to report once logging is up.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, toml::de::Error> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content),
            Err(_) => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_and_named_keys() {
        assert_eq!(
            parse_key_string("r"),
            (KeyCode::Char('r'), KeyModifiers::empty())
        );
        assert_eq!(
            parse_key_string("Enter"),
            (KeyCode::Enter, KeyModifiers::empty())
        );
        assert_eq!(
            parse_key_string("Nonsense"),
            (KeyCode::Null, KeyModifiers::empty())
        );
    }

    #[test]
    fn test_parse_modifiers() {
        let (code, mods) = parse_key_string("ctrl-r");
        assert_eq!(code, KeyCode::Char('r'));
        assert!(mods.contains(KeyModifiers::CONTROL));
    }

    #[test]
    fn test_matches_key() {
        let bindings = vec!["j".to_string(), "Down".to_string()];
        let down = KeyEvent::new(KeyCode::Down, KeyModifiers::empty());
        let k = KeyEvent::new(KeyCode::Char('k'), KeyModifiers::empty());
        assert!(matches_key(down, &bindings));
        assert!(!matches_key(k, &bindings));
    }

    #[test]
    fn test_partial_settings_keep_defaults() {
        let config: Config = toml::from_str(
            r#"
            [gmail]
            max_results = 50

            [model]
            model = "gemini-2.0-flash"
            "#,
        )
        .unwrap();
        assert_eq!(config.gmail.query, "subject:\"Credit card statement\"");
        assert_eq!(config.gmail.effective_max_results(), MAX_STATEMENTS);
        assert_eq!(config.model.model, "gemini-2.0-flash");
        assert_eq!(config.model.api_key_env, "GEMINI_API_KEY");
        assert_eq!(config.keybindings.quit, vec!["q".to_string()]);
        assert_eq!(config.log_file.0, "statement-scan.log");
    }

    #[test]
    fn test_missing_settings_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(dir.path().join("settings.toml")).unwrap();
        assert_eq!(config.gmail.max_results, MAX_STATEMENTS);
    }

    #[test]
    fn test_broken_settings_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[gmail\nmax_results = 3").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_log_file_is_plain_string() {
        let config: Config = toml::from_str(r#"log_file = "scan.log""#).unwrap();
        assert_eq!(config.log_file.0, "scan.log");
    }
}
