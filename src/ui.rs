use crate::models::{CreditCardInfo, MessageRecord};
use crate::state::AppState;
use ratatui::{
    Frame,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap},
};

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum FocusedPanel {
    #[default]
    Statements,
    Details,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum UIMode {
    #[default]
    SignedOut,
    Consent,
    Authentication,
    Browsing,
}

pub struct UIState {
    pub app: AppState,
    pub mode: UIMode,
    pub focused_panel: FocusedPanel,
    pub selected_index: usize,
    pub list_state: ListState,
    pub detail_scroll: u16,
    pub auth_url: Option<String>,
    pub status_message: Option<String>,
    pub extraction_enabled: bool,
}

impl Default for UIState {
    fn default() -> Self {
        Self {
            app: AppState::default(),
            mode: UIMode::SignedOut,
            focused_panel: FocusedPanel::Statements,
            selected_index: 0,
            list_state: ListState::default(),
            detail_scroll: 0,
            auth_url: None,
            status_message: None,
            extraction_enabled: true,
        }
    }
}

impl UIState {
    pub fn selected_message(&self) -> Option<&MessageRecord> {
        self.app.messages.get(self.selected_index)
    }

    pub fn select_next(&mut self) {
        if self.selected_index < self.app.messages.len().saturating_sub(1) {
            self.selected_index += 1;
            self.detail_scroll = 0;
        }
    }

    pub fn select_prev(&mut self) {
        if self.selected_index > 0 {
            self.selected_index -= 1;
            self.detail_scroll = 0;
        }
    }

    /// Keeps the selection inside the list after it was replaced.
    pub fn clamp_selection(&mut self) {
        if self.selected_index >= self.app.messages.len() {
            self.selected_index = self.app.messages.len().saturating_sub(1);
        }
        self.detail_scroll = 0;
    }

    pub fn reset_to_signed_out(&mut self) {
        self.app.sign_out();
        self.mode = UIMode::SignedOut;
        self.focused_panel = FocusedPanel::Statements;
        self.selected_index = 0;
        self.detail_scroll = 0;
        self.auth_url = None;
    }
}

fn border_style(focused: bool) -> Style {
    if focused {
        Style::default()
            .fg(Color::Yellow)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(Color::Gray)
    }
}

pub fn render(f: &mut Frame, state: &mut UIState) {
    match state.mode {
        UIMode::SignedOut => render_signed_out(f, state),
        UIMode::Consent => render_consent(f),
        UIMode::Authentication => render_authentication(f, state),
        UIMode::Browsing => render_browsing(f, state),
    }
}

fn render_signed_out(f: &mut Frame, state: &UIState) {
    let area = centered_rect(50, 30, f.area());
    let mut text = String::from("Credit Card Statements\n\nPress [s] to sign in with Google, [q] to quit.");
    if let Some(status) = &state.status_message {
        text.push_str("\n\n");
        text.push_str(status);
    }
    let p = Paragraph::new(text)
        .alignment(Alignment::Center)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(" statement-scan ")
                .border_style(Style::default().fg(Color::Cyan)),
        )
        .wrap(Wrap { trim: true });
    f.render_widget(p, area);
}

fn render_consent(f: &mut Frame) {
    let area = centered_rect(60, 45, f.area());
    f.render_widget(Clear, area);

    let text = "The application requires read-only access to your Gmail account to:\n\
                \n  • Identify bank statement emails\
                \n  • Extract statement data (bank, card digits, due date, amount)\
                \n  • Show a summary of what is due\n\
                \nMessage subjects and bodies are sent to the configured language model.\n\
                \n[g] Grant access      [d] Deny access";

    let p = Paragraph::new(text)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(" Bank Statement Access Requirements ")
                .border_style(Style::default().fg(Color::Cyan)),
        )
        .wrap(Wrap { trim: false });
    f.render_widget(p, area);
}

fn render_browsing(f: &mut Frame, state: &mut UIState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1), // Header
            Constraint::Min(5),    // Panels
            Constraint::Length(1), // Status / help
        ])
        .split(f.area());

    let account = state.app.account.as_deref().unwrap_or("signed in");
    let fetched = match (state.app.loading, state.app.last_fetched) {
        (true, _) => "loading messages…".to_string(),
        (false, Some(at)) => format!("fetched {}", at.format("%H:%M:%S")),
        (false, None) => "not fetched".to_string(),
    };
    let header = Paragraph::new(format!(" {}  |  {}", account, fetched))
        .style(Style::default().fg(Color::Cyan));
    f.render_widget(header, rows[0]);

    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(rows[1]);

    // Panel 1: statement list
    let list_width = chunks[0].width.saturating_sub(2) as usize;
    let inner_len = list_width.saturating_sub(1);

    let items: Vec<ListItem> = state
        .app
        .messages
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let info = state.app.extractions.get(&m.id).and_then(|e| e.info());
            let summary = match &info {
                Some(info) => summary_line(info),
                None if state.extraction_enabled => "extracting…".to_string(),
                None => "extraction disabled".to_string(),
            };

            let is_selected = i == state.selected_index;
            let indicator = if is_selected { "█" } else { " " };
            let style = if is_selected {
                Style::default().fg(Color::Yellow)
            } else {
                Style::default()
            };

            let text = format!(
                "{}{}\n{}{}\n{}{}",
                indicator,
                pad(format!(" From: {}", m.from), inner_len),
                indicator,
                pad(format!(" Subj: {}", m.subject), inner_len),
                indicator,
                pad(format!(" {}", summary), inner_len),
            );
            ListItem::new(text).style(style)
        })
        .collect();

    let list_block = Block::default()
        .borders(Borders::ALL)
        .title("Credit Card Statements")
        .border_style(border_style(state.focused_panel == FocusedPanel::Statements));

    if state.app.messages.is_empty() {
        let (text, style) = if state.app.loading {
            ("Loading messages...", Style::default().fg(Color::Yellow))
        } else {
            ("No statements found", Style::default().fg(Color::DarkGray))
        };
        let p = Paragraph::new(text)
            .block(list_block)
            .style(style)
            .wrap(Wrap { trim: true });
        f.render_widget(p, chunks[0]);
    } else {
        let list = List::new(items).block(list_block);
        state.list_state.select(Some(state.selected_index));
        f.render_stateful_widget(list, chunks[0], &mut state.list_state);
    }

    // Panel 2: details
    let details_block = Block::default()
        .borders(Borders::ALL)
        .title("Statement Details")
        .border_style(border_style(state.focused_panel == FocusedPanel::Details));

    let detail_content = match state.selected_message() {
        None => "No statement selected".to_string(),
        Some(m) => detail_text(m, state.app.extractions.get(&m.id)),
    };

    let detail = Paragraph::new(detail_content)
        .block(details_block)
        .wrap(Wrap { trim: true })
        .scroll((state.detail_scroll, 0));
    f.render_widget(detail, chunks[1]);

    let footer = match &state.status_message {
        Some(status) => format!(" {}", status),
        None => {
            " [j/k] move  [tab] panel  [r] refresh  [b] send to receiver  [o] sign out  [q] quit"
                .to_string()
        }
    };
    let footer_style = if state.app.loading {
        Style::default().fg(Color::DarkGray)
    } else {
        Style::default().fg(Color::Gray)
    };
    f.render_widget(Paragraph::new(footer).style(footer_style), rows[2]);
}

fn summary_line(info: &CreditCardInfo) -> String {
    let bank = info.bank.as_deref().unwrap_or("?");
    let digits = info.ending_digits.as_deref().unwrap_or("????");
    let amount = info
        .amount
        .map(|a| format!("{:.2}", a))
        .unwrap_or_else(|| "?".to_string());
    let due = info.due_date.as_deref().unwrap_or("?");
    format!("{} •••• {}  {} due {}", bank, digits, amount, due)
}

fn detail_text(m: &MessageRecord, extraction: Option<&crate::models::Extraction>) -> String {
    let mut out = format!("From: {}\nSubject: {}\nId: {}\n\n", m.from, m.subject, m.id);

    match extraction {
        Some(e) => {
            if let Some(info) = e.info() {
                out.push_str(&format!("{}\n\n", summary_line(&info)));
            }
            out.push_str(&format!("Model reply (subject):\n{}\n\n", e.subject));
            if let Some(body) = &e.body {
                out.push_str(&format!("Model reply (body):\n{}\n\n", body));
            }
        }
        None => out.push_str("No model reply yet.\n\n"),
    }

    out.push_str("------------------------------------------------------------\n\n");
    out.push_str(&clean_body(&m.body));
    out
}

fn pad(s: String, len: usize) -> String {
    let char_count = s.chars().count();
    if char_count > len {
        let truncated: String = s.chars().take(len.saturating_sub(3)).collect();
        format!("{}...", truncated)
    } else {
        format!("{:width$}", s, width = len)
    }
}

fn render_authentication(f: &mut Frame, state: &UIState) {
    let area = centered_rect(60, 40, f.area());
    f.render_widget(Clear, area);

    let block = Block::default()
        .title(" Authentication Required ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let inner = block.inner(area);
    f.render_widget(block, area);

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(6),
            Constraint::Length(4),
            Constraint::Min(0),
        ])
        .split(inner);

    let msg = Paragraph::new(
        "To read your statement emails, please visit the following URL in your browser and authorize the application:",
    )
    .wrap(Wrap { trim: true });
    f.render_widget(msg, chunks[0]);

    match &state.auth_url {
        Some(url) => {
            let url_p = Paragraph::new(url.as_str())
                .style(
                    Style::default()
                        .fg(Color::Yellow)
                        .add_modifier(Modifier::UNDERLINED),
                )
                .block(Block::default().borders(Borders::ALL).title(" URL "))
                .wrap(Wrap { trim: false });
            f.render_widget(url_p, chunks[1]);
        }
        None => {
            f.render_widget(Paragraph::new("Waiting for sign-in to start…"), chunks[1]);
        }
    }

    let footer = Paragraph::new("Your default browser should have opened automatically. If not, please copy the URL above (Tip: Hold Shift to select in most terminals).\n\nPress Esc to cancel.")
        .style(Style::default().fg(Color::Gray))
        .wrap(Wrap { trim: true });
    f.render_widget(footer, chunks[2]);
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

/// Normalises line endings and keeps at most one blank line between
/// paragraphs.
fn clean_body(body: &str) -> String {
    let normalized = body.replace("\r\n", "\n").replace('\r', "\n");
    let mut result = String::with_capacity(normalized.len());

    let mut consecutive_empty_lines = 0;
    let mut first_content = true;

    for line in normalized.split('\n') {
        let trimmed = line.trim_end();

        if trimmed.is_empty() {
            consecutive_empty_lines += 1;
            continue;
        }

        if !first_content {
            let newlines_to_add = std::cmp::min(consecutive_empty_lines + 1, 2);
            for _ in 0..newlines_to_add {
                result.push('\n');
            }
        }

        result.push_str(trimmed);
        consecutive_empty_lines = 0;
        first_content = false;
    }

    result
}
