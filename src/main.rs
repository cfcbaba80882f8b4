mod auth;
mod broadcast;
mod config;
mod extract;
mod gmail;
mod models;
mod state;
mod ui;

use crate::auth::{AuthError, GmailAuthenticator};
use crate::config::{Config, Keybindings, matches_key};
use crate::extract::Extractor;
use crate::gmail::{GmailClient, MailboxApi};
use crate::models::{Extraction, MessageRecord};
use crate::ui::{FocusedPanel, UIMode, UIState};
use anyhow::Context;
use crossterm::{
    event::{self, Event, KeyEvent, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode},
};
use google_gmail1::Gmail;
use ratatui::Terminal;
use ratatui::backend::{Backend, CrosstermBackend};
use std::io;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Results coming back from background tasks to the UI loop.
enum AppEvent {
    SignedIn(GmailAuthenticator),
    SignInFailed(AuthError),
    Account(Option<String>),
    Fetched {
        generation: u64,
        messages: Vec<MessageRecord>,
    },
    Extracted {
        generation: u64,
        id: String,
        extraction: Extraction,
    },
    Broadcast(Result<(), String>),
    SignedOut(Result<(), String>),
}

#[derive(Default)]
struct Tasks {
    sign_in: Option<JoinHandle<()>>,
    fetch: Option<JoinHandle<()>>,
}

impl Tasks {
    /// Installs a new fetch task. The previous one is aborted so it stops
    /// sending mail to the model.
    fn replace_fetch(&mut self, handle: JoinHandle<()>) {
        if let Some(old) = self.fetch.replace(handle) {
            old.abort();
        }
    }

    fn abort_all(&mut self) {
        for handle in [self.sign_in.take(), self.fetch.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

fn init_logging(path: &str, debug: bool) -> anyhow::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path))?;

    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    // The terminal belongs to the TUI, so logs go to a file.
    tracing_subscriber::fmt()
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .with_max_level(level)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, config_error) = match Config::load() {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    let debug_logging = std::env::args().any(|arg| arg == "--debug");
    init_logging(&config.log_file.0, debug_logging)?;
    if let Some(e) = config_error {
        tracing::warn!("Ignoring settings.toml: {}", e);
    }

    if std::env::args().any(|arg| arg == "--reset-token") {
        auth::RingStorage.clear_token().await?;
        println!("Token cleared. Please restart without --reset-token to re-authenticate.");
        return Ok(());
    }

    let extractor = match config.model.api_key() {
        Some(key) => match extract::gemini_model(&config.model, &key) {
            Ok(model) => Some(Extractor::new(model)),
            Err(e) => {
                tracing::error!("{}", e);
                None
            }
        },
        None => {
            tracing::warn!(
                "{} is not set; statement fields will not be extracted",
                config.model.api_key_env
            );
            None
        }
    };

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run(&mut terminal, &config, extractor).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;
    terminal.show_cursor()?;

    if let Err(e) = &result {
        tracing::error!("Exiting with error: {:#}", e);
    }
    result
}

async fn run<B: Backend>(
    terminal: &mut Terminal<B>,
    config: &Config,
    extractor: Option<Extractor>,
) -> anyhow::Result<()> {
    let mut ui_state = UIState {
        extraction_enabled: extractor.is_some(),
        ..UIState::default()
    };

    let (url_tx, mut url_rx) = mpsc::channel::<String>(1);
    let (tx, mut rx) = mpsc::channel::<AppEvent>(64);
    let mut tasks = Tasks::default();
    let mut gmail_client: Option<GmailClient> = None;

    // A stored token means the user already consented.
    if auth::RingStorage.has_token().await {
        start_sign_in(config, &mut ui_state, &mut tasks, &url_tx, &tx).await;
    }

    loop {
        while let Ok(url) = url_rx.try_recv() {
            ui_state.auth_url = Some(url);
            ui_state.mode = UIMode::Authentication;
        }

        while let Ok(app_event) = rx.try_recv() {
            match app_event {
                AppEvent::SignedIn(authenticator) => {
                    tasks.sign_in = None;
                    if ui_state.mode != UIMode::Authentication {
                        tracing::debug!("Ignoring sign-in that finished after cancel");
                        continue;
                    }
                    let hub = Gmail::new(gmail::https_client()?, authenticator);
                    let client = GmailClient::new(hub);

                    ui_state.app.sign_in(None);
                    ui_state.mode = UIMode::Browsing;
                    ui_state.auth_url = None;
                    ui_state.status_message = None;

                    let profile_client = client.clone();
                    let profile_tx = tx.clone();
                    tokio::spawn(async move {
                        match profile_client.profile_email().await {
                            Ok(email) => {
                                let _ = profile_tx.send(AppEvent::Account(email)).await;
                            }
                            Err(e) => tracing::warn!("Could not load profile: {:#}", e),
                        }
                    });

                    start_fetch(config, &mut ui_state, &mut tasks, &client, &extractor, &tx);
                    gmail_client = Some(client);
                }
                AppEvent::SignInFailed(err) => {
                    tasks.sign_in = None;
                    ui_state.reset_to_signed_out();
                    ui_state.status_message = Some(err.to_string());
                }
                AppEvent::Account(email) => ui_state.app.set_account(email),
                AppEvent::Fetched {
                    generation,
                    messages,
                } => {
                    if ui_state.app.replace_messages(generation, messages) {
                        ui_state.clamp_selection();
                        ui_state.status_message = Some(format!(
                            "{} statement(s) loaded",
                            ui_state.app.messages.len()
                        ));
                    }
                }
                AppEvent::Extracted {
                    generation,
                    id,
                    extraction,
                } => ui_state.app.record_extraction(generation, id, extraction),
                AppEvent::Broadcast(result) => {
                    ui_state.status_message = Some(match result {
                        Ok(()) => "Broadcast sent".to_string(),
                        Err(e) => format!("Broadcast failed: {}", e),
                    });
                }
                AppEvent::SignedOut(result) => {
                    ui_state.status_message = Some(match result {
                        Ok(()) => "Signed out".to_string(),
                        Err(e) => format!("Signed out, but the stored token remains: {}", e),
                    });
                }
            }
        }

        terminal.draw(|f| ui::render(f, &mut ui_state))?;

        if !event::poll(std::time::Duration::from_millis(100))? {
            continue;
        }

        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        match ui_state.mode {
            UIMode::SignedOut => {
                if matches_key(key, &config.keybindings.quit) {
                    break;
                } else if matches_key(key, &config.keybindings.sign_in) {
                    ui_state.status_message = None;
                    ui_state.mode = UIMode::Consent;
                }
            }
            UIMode::Consent => {
                if matches_key(key, &config.keybindings.grant) {
                    start_sign_in(config, &mut ui_state, &mut tasks, &url_tx, &tx).await;
                } else if matches_key(key, &config.keybindings.deny) {
                    tracing::info!("User denied access");
                    ui_state.mode = UIMode::SignedOut;
                    ui_state.status_message = Some("Access denied".to_string());
                } else if matches_key(key, &config.keybindings.quit) {
                    break;
                }
            }
            UIMode::Authentication => match authentication_action(key, &config.keybindings) {
                Some(AuthAction::Cancel) => {
                    tasks.abort_all();
                    tracing::info!("Sign-in cancelled by user");
                    ui_state.reset_to_signed_out();
                    ui_state.status_message = Some(
                        AuthError::Cancelled("cancelled from the terminal".to_string())
                            .to_string(),
                    );
                }
                Some(AuthAction::Quit) => break,
                None => {}
            },
            UIMode::Browsing => {
                if matches_key(key, &config.keybindings.quit) {
                    break;
                }

                if matches_key(key, &config.keybindings.prev_panel) {
                    ui_state.focused_panel = FocusedPanel::Statements;
                } else if matches_key(key, &config.keybindings.next_panel) {
                    ui_state.focused_panel = FocusedPanel::Details;
                } else if matches_key(key, &config.keybindings.move_down) {
                    match ui_state.focused_panel {
                        FocusedPanel::Statements => ui_state.select_next(),
                        FocusedPanel::Details => {
                            ui_state.detail_scroll = ui_state.detail_scroll.saturating_add(1);
                        }
                    }
                } else if matches_key(key, &config.keybindings.move_up) {
                    match ui_state.focused_panel {
                        FocusedPanel::Statements => ui_state.select_prev(),
                        FocusedPanel::Details => {
                            ui_state.detail_scroll = ui_state.detail_scroll.saturating_sub(1);
                        }
                    }
                } else if matches_key(key, &config.keybindings.refresh) {
                    if let Some(client) = &gmail_client {
                        start_fetch(config, &mut ui_state, &mut tasks, client, &extractor, &tx);
                    }
                } else if matches_key(key, &config.keybindings.broadcast) {
                    if ui_state.app.loading {
                        ui_state.status_message =
                            Some("Still loading messages; try again shortly".to_string());
                    } else {
                        let signal = broadcast::BroadcastSignal::from_settings(&config.broadcast);
                        let socket_path = config.broadcast.socket_path.clone();
                        let broadcast_tx = tx.clone();
                        tokio::spawn(async move {
                            let result = broadcast::send(&socket_path, &signal)
                                .await
                                .map_err(|e| format!("{:#}", e));
                            let _ = broadcast_tx.send(AppEvent::Broadcast(result)).await;
                        });
                    }
                } else if matches_key(key, &config.keybindings.sign_out) {
                    tasks.abort_all();
                    gmail_client = None;
                    ui_state.reset_to_signed_out();

                    let sign_out_tx = tx.clone();
                    tokio::spawn(async move {
                        let result = auth::Authenticator::sign_out()
                            .await
                            .map_err(|e| format!("{:#}", e));
                        let _ = sign_out_tx.send(AppEvent::SignedOut(result)).await;
                    });
                }
            }
        }
    }

    tasks.abort_all();
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum AuthAction {
    Cancel,
    Quit,
}

/// Keys while waiting on the browser: deny cancels the flow, quit exits.
fn authentication_action(key: KeyEvent, bindings: &Keybindings) -> Option<AuthAction> {
    if matches_key(key, &bindings.deny) {
        Some(AuthAction::Cancel)
    } else if matches_key(key, &bindings.quit) {
        Some(AuthAction::Quit)
    } else {
        None
    }
}

async fn start_sign_in(
    config: &Config,
    ui_state: &mut UIState,
    tasks: &mut Tasks,
    url_tx: &mpsc::Sender<String>,
    tx: &mpsc::Sender<AppEvent>,
) {
    let secret = match auth::Authenticator::load_secret(&config.gmail.credentials_path).await {
        Ok(secret) => secret,
        Err(e) => {
            tracing::error!("{:#}", e);
            ui_state.mode = UIMode::SignedOut;
            ui_state.status_message = Some(
                AuthError::NoCredential(format!("{:#}", e)).to_string(),
            );
            return;
        }
    };

    ui_state.mode = UIMode::Authentication;
    ui_state.auth_url = None;

    let delegate = auth::TuiDelegate { tx: url_tx.clone() };
    let tx = tx.clone();
    tasks.sign_in = Some(tokio::spawn(async move {
        let app_event = match auth::Authenticator::sign_in(secret, delegate).await {
            Ok(authenticator) => AppEvent::SignedIn(authenticator),
            Err(e) => AppEvent::SignInFailed(e),
        };
        let _ = tx.send(app_event).await;
    }));
}

fn start_fetch(
    config: &Config,
    ui_state: &mut UIState,
    tasks: &mut Tasks,
    client: &GmailClient,
    extractor: &Option<Extractor>,
    tx: &mpsc::Sender<AppEvent>,
) {
    let Some(generation) = ui_state.app.begin_fetch() else {
        tracing::debug!("Fetch already in flight; ignoring refresh");
        return;
    };
    ui_state.status_message = Some("Loading messages...".to_string());

    tasks.replace_fetch(spawn_fetch(
        client.clone(),
        extractor.clone(),
        config.gmail.query.clone(),
        config.gmail.effective_max_results(),
        generation,
        tx.clone(),
    ));
}

/// Fetches the statements, reports them, then extracts each one in turn.
fn spawn_fetch<A: MailboxApi + 'static>(
    api: A,
    extractor: Option<Extractor>,
    query: String,
    max_results: u32,
    generation: u64,
    tx: mpsc::Sender<AppEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let messages = gmail::fetch_statements(&api, &query, max_results).await;
        let to_extract = messages.clone();
        if tx
            .send(AppEvent::Fetched {
                generation,
                messages,
            })
            .await
            .is_err()
        {
            return;
        }

        let Some(extractor) = extractor else {
            return;
        };
        for record in to_extract {
            let extraction = extractor.extract_message(&record).await;
            let sent = tx
                .send(AppEvent::Extracted {
                    generation,
                    id: record.id,
                    extraction,
                })
                .await;
            if sent.is_err() {
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{ExtractError, GenerativeModel};
    use async_trait::async_trait;
    use crossterm::event::{KeyCode, KeyModifiers};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct StaticMailbox {
        count: usize,
    }

    #[async_trait]
    impl MailboxApi for StaticMailbox {
        async fn list_message_ids(&self, _query: &str, max: u32) -> anyhow::Result<Vec<String>> {
            Ok((0..self.count.min(max as usize))
                .map(|i| format!("m{}", i))
                .collect())
        }

        async fn get_message(&self, id: &str) -> anyhow::Result<MessageRecord> {
            Ok(MessageRecord {
                id: id.to_string(),
                subject: "Credit card statement".to_string(),
                from: "bank@example.com".to_string(),
                body: format!("Amount due for {}", id),
            })
        }
    }

    /// Every call blocks until the test hands out a permit.
    struct GatedModel {
        started: AtomicUsize,
        permits: Semaphore,
    }

    impl GatedModel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                started: AtomicUsize::new(0),
                permits: Semaphore::new(0),
            })
        }

        fn started(&self) -> usize {
            self.started.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerativeModel for GatedModel {
        async fn generate(&self, _prompt: &str) -> Result<Option<String>, ExtractError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.permits.acquire().await.unwrap().forget();
            Ok(Some("{}".to_string()))
        }
    }

    async fn wait_for_calls(model: &GatedModel, n: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while model.started() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    /// Starts generation 1 over three messages and waits until its first
    /// model call is parked.
    async fn fetch_in_extraction(
        tasks: &mut Tasks,
        extractor: &Extractor,
        model: &GatedModel,
        tx: &mpsc::Sender<AppEvent>,
        rx: &mut mpsc::Receiver<AppEvent>,
    ) {
        tasks.replace_fetch(spawn_fetch(
            StaticMailbox { count: 3 },
            Some(extractor.clone()),
            "subject:statement".to_string(),
            10,
            1,
            tx.clone(),
        ));
        assert!(matches!(
            rx.recv().await,
            Some(AppEvent::Fetched { generation: 1, .. })
        ));
        wait_for_calls(model, 1).await;
    }

    #[tokio::test]
    async fn test_refresh_stops_previous_extraction() {
        let model = GatedModel::new();
        let extractor = Extractor::new(model.clone());
        let (tx, mut rx) = mpsc::channel(64);
        let mut tasks = Tasks::default();

        fetch_in_extraction(&mut tasks, &extractor, &model, &tx, &mut rx).await;

        tasks.replace_fetch(spawn_fetch(
            StaticMailbox { count: 0 },
            Some(extractor.clone()),
            "subject:statement".to_string(),
            10,
            2,
            tx.clone(),
        ));
        assert!(matches!(
            rx.recv().await,
            Some(AppEvent::Fetched { generation: 2, .. })
        ));

        // Generation 1 would make five more calls if it were still alive.
        model.permits.add_permits(10);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(model.started(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sign_out_stops_extraction() {
        let model = GatedModel::new();
        let extractor = Extractor::new(model.clone());
        let (tx, mut rx) = mpsc::channel(64);
        let mut tasks = Tasks::default();

        fetch_in_extraction(&mut tasks, &extractor, &model, &tx, &mut rx).await;
        tasks.abort_all();

        model.permits.add_permits(10);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(model.started(), 1);
        assert!(rx.try_recv().is_err());
        assert!(tasks.fetch.is_none());
    }

    #[tokio::test]
    async fn test_fetch_without_extractor_only_reports_messages() {
        let (tx, mut rx) = mpsc::channel(64);
        let handle = spawn_fetch(
            StaticMailbox { count: 12 },
            None,
            "subject:statement".to_string(),
            10,
            7,
            tx,
        );
        handle.await.unwrap();

        match rx.recv().await {
            Some(AppEvent::Fetched {
                generation,
                messages,
            }) => {
                assert_eq!(generation, 7);
                assert_eq!(messages.len(), 10);
            }
            _ => panic!("expected the fetched messages first"),
        }
        assert!(rx.recv().await.is_none());
    }

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::empty())
    }

    #[test]
    fn test_authentication_keys_follow_bindings() {
        let defaults = Keybindings::default();
        assert_eq!(
            authentication_action(press(KeyCode::Esc), &defaults),
            Some(AuthAction::Cancel)
        );
        assert_eq!(
            authentication_action(press(KeyCode::Char('q')), &defaults),
            Some(AuthAction::Quit)
        );

        let custom = Keybindings {
            deny: vec!["x".to_string()],
            quit: vec!["Q".to_string()],
            ..Keybindings::default()
        };
        assert_eq!(
            authentication_action(press(KeyCode::Char('x')), &custom),
            Some(AuthAction::Cancel)
        );
        assert_eq!(authentication_action(press(KeyCode::Esc), &custom), None);
        assert_eq!(
            authentication_action(press(KeyCode::Char('Q')), &custom),
            Some(AuthAction::Quit)
        );
        assert_eq!(authentication_action(press(KeyCode::Char('q')), &custom), None);
    }
}
