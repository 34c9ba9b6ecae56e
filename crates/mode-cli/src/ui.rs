use std::io;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use crossterm::event::{
    self, DisableBracketedPaste, EnableBracketedPaste, Event, KeyCode, KeyEvent, KeyEventKind,
    KeyModifiers,
};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::{Backend, CrosstermBackend};
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap};
use ratatui::Terminal;
use tracing::debug;

use mode_core::actions::{ModeAction, RuntimeAction, ScrollDirection, UserAction};
use mode_core::reducer::{reduce, ModeEffect};
use mode_core::state::{ModeState, ModelAvailability, SessionState};
use mode_core::transcript::{Severity, TranscriptEntry};

use crate::runtime::{EffectOutcome, EffectRunner, Services};

struct TuiGuard;

impl Drop for TuiGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(
            io::stdout(),
            LeaveAlternateScreen,
            DisableBracketedPaste,
            crossterm::cursor::Show
        );
    }
}

/// Runs the session until the user quits. Returns the directory to hand to the parent
/// shell, if any.
pub fn run(mut state: SessionState, services: Services) -> io::Result<Option<PathBuf>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(
        stdout,
        EnterAlternateScreen,
        EnableBracketedPaste,
        crossterm::cursor::Hide
    )?;
    let _guard = TuiGuard;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let (tx, rx) = mpsc::channel();
    let runner = EffectRunner::new(services, tx);
    runner.probe_model();

    run_app(&mut terminal, &mut state, &runner, &rx)
}

fn run_app<B: Backend>(
    terminal: &mut Terminal<B>,
    state: &mut SessionState,
    runner: &EffectRunner,
    rx: &mpsc::Receiver<RuntimeAction>,
) -> io::Result<Option<PathBuf>> {
    loop {
        // Worker completions
        let mut effects = Vec::new();
        while let Ok(action) = rx.try_recv() {
            debug!(action = action.label(), mode = state.mode.label(), "runtime event");
            effects.extend(reduce(state, ModeAction::Runtime(action)));
        }
        if let EffectOutcome::Quit { handoff } = run_effects(runner, effects) {
            return Ok(handoff);
        }

        terminal.draw(|f| ui(f, state))?;

        if event::poll(Duration::from_millis(16))? {
            let effects = match event::read()? {
                Event::Key(key) if key.kind == KeyEventKind::Press => handle_key_event(key, state),
                Event::Paste(text) => reduce(state, ModeAction::User(UserAction::ChatPaste(text))),
                _ => Vec::new(),
            };
            if let EffectOutcome::Quit { handoff } = run_effects(runner, effects) {
                return Ok(handoff);
            }
        }
    }
}

fn run_effects(runner: &EffectRunner, effects: Vec<ModeEffect>) -> EffectOutcome {
    for effect in effects {
        if let quit @ EffectOutcome::Quit { .. } = runner.run(effect) {
            return quit;
        }
    }
    EffectOutcome::Continue
}

fn handle_key_event(key: KeyEvent, state: &mut SessionState) -> Vec<ModeEffect> {
    match map_key(&state.mode, key) {
        Some(action) => reduce(state, ModeAction::User(action)),
        None => Vec::new(),
    }
}

fn map_key(mode: &ModeState, key: KeyEvent) -> Option<UserAction> {
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    if ctrl && key.code == KeyCode::Char('c') {
        return Some(if mode.is_chat() {
            UserAction::Cancel
        } else {
            UserAction::Quit
        });
    }
    match key.code {
        KeyCode::PageUp => return Some(UserAction::ScrollTranscript(ScrollDirection::Up)),
        KeyCode::PageDown => return Some(UserAction::ScrollTranscript(ScrollDirection::Down)),
        _ => {}
    }

    match mode {
        ModeState::Menu => handle_menu_keys(key),
        ModeState::ChatComposing { .. } => handle_composing_keys(key, ctrl),
        ModeState::ChatAwaitingConfirmation { .. } => handle_confirmation_keys(key),
        ModeState::ChatAwaitingModel { .. } | ModeState::ChatExecuting { .. } => {
            (key.code == KeyCode::Esc).then_some(UserAction::Cancel)
        }
    }
}

fn handle_menu_keys(key: KeyEvent) -> Option<UserAction> {
    match key.code {
        KeyCode::Up | KeyCode::Char('k') => Some(UserAction::MenuUp),
        KeyCode::Down | KeyCode::Char('j') => Some(UserAction::MenuDown),
        KeyCode::Enter | KeyCode::Right => Some(UserAction::MenuSelect),
        KeyCode::Backspace | KeyCode::Left | KeyCode::Esc | KeyCode::Char('b') => {
            Some(UserAction::MenuBack)
        }
        KeyCode::Tab => Some(UserAction::ToggleChat),
        KeyCode::Char('q') => Some(UserAction::Quit),
        _ => None,
    }
}

fn handle_composing_keys(key: KeyEvent, ctrl: bool) -> Option<UserAction> {
    match key.code {
        KeyCode::Tab => Some(UserAction::ToggleChat),
        KeyCode::Enter => Some(UserAction::Submit),
        KeyCode::Backspace => Some(UserAction::ChatBackspace),
        KeyCode::Esc => Some(UserAction::Cancel),
        KeyCode::End => Some(UserAction::ScrollTranscript(ScrollDirection::Bottom)),
        KeyCode::Char(c) if !ctrl && !key.modifiers.contains(KeyModifiers::ALT) => {
            Some(UserAction::ChatInput(c))
        }
        _ => None,
    }
}

fn handle_confirmation_keys(key: KeyEvent) -> Option<UserAction> {
    match key.code {
        KeyCode::Char('y') | KeyCode::Char('Y') | KeyCode::Enter => Some(UserAction::Confirm),
        KeyCode::Char('n') | KeyCode::Char('N') => Some(UserAction::Decline),
        KeyCode::Esc => Some(UserAction::Cancel),
        _ => None,
    }
}

fn get_spinner() -> &'static str {
    let frames = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    frames[(millis / 100) as usize % frames.len()]
}

fn ui(f: &mut ratatui::Frame, state: &SessionState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Min(0),    // Content
            Constraint::Length(3), // Input
            Constraint::Length(1), // Footer
        ])
        .split(f.area());

    render_header(f, state, chunks[0]);
    match state.mode {
        ModeState::Menu => render_menu(f, state, chunks[1]),
        _ => render_transcript(f, state, chunks[1]),
    }
    render_input(f, state, chunks[2]);

    let footer = Paragraph::new(footer_hint(&state.mode))
        .style(Style::default().fg(Color::DarkGray));
    f.render_widget(footer, chunks[3]);

    if let ModeState::ChatAwaitingConfirmation {
        command,
        explanation,
    } = &state.mode
    {
        render_confirmation(f, command, explanation);
    }
}

fn render_header(f: &mut ratatui::Frame, state: &SessionState, area: Rect) {
    let (model_status, model_color) = match state.model {
        ModelAvailability::Unknown => ("checking", Color::DarkGray),
        ModelAvailability::Available => ("online", Color::Green),
        ModelAvailability::Unavailable => ("offline", Color::Red),
    };
    let header = Line::from(vec![
        Span::styled(
            "Mode Terminal",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!(" | {} | ", state.mode.label())),
        Span::styled(
            state.cwd.display().to_string(),
            Style::default().fg(Color::Blue),
        ),
        Span::raw(format!(" | {} ", state.config.assistant.model)),
        Span::styled(model_status, Style::default().fg(model_color)),
    ]);
    let header = Paragraph::new(header).block(Block::default().borders(Borders::ALL));
    f.render_widget(header, area);
}

fn render_menu(f: &mut ratatui::Frame, state: &SessionState, area: Rect) {
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(area);

    let root = state.menu.root.as_ref();
    let cursor = &state.menu.cursor;
    let items: Vec<ListItem> = cursor
        .items(root)
        .iter()
        .map(|node| {
            let marker = if node.is_leaf() { "  " } else { "+ " };
            ListItem::new(format!("{marker}{}", node.label))
        })
        .collect();
    let mut list_state = ListState::default();
    list_state.select(Some(cursor.selected()));
    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(cursor.breadcrumb(root).join(" > ")),
        )
        .highlight_style(
            Style::default()
                .fg(Color::Black)
                .bg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("> ");
    f.render_stateful_widget(list, columns[0], &mut list_state);

    let (title, lines): (String, Vec<Line>) = if state.menu.dispatching {
        (
            "Working".to_string(),
            vec![Line::from(format!("{} running...", get_spinner()))],
        )
    } else if let Some(panel) = &state.menu.panel {
        (
            panel.title.clone(),
            panel.lines.iter().map(|line| Line::from(line.as_str())).collect(),
        )
    } else {
        let description = cursor
            .highlighted(root)
            .filter(|_| state.config.interface.show_help_text)
            .map(|node| node.description.as_str())
            .unwrap_or_default();
        ("Details".to_string(), vec![Line::from(description)])
    };
    let detail = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(title))
        .wrap(Wrap { trim: false });
    f.render_widget(detail, columns[1]);
}

fn render_transcript(f: &mut ratatui::Frame, state: &SessionState, area: Rect) {
    let inner_width = usize::from(area.width.saturating_sub(2)).max(1);
    let visible = usize::from(area.height.saturating_sub(2));
    let lines = transcript_lines(state, inner_width);

    let max_top = lines.len().saturating_sub(visible);
    let scroll = state.transcript_scroll.min(max_top);
    let top = u16::try_from(max_top - scroll).unwrap_or(u16::MAX);
    let title = if scroll > 0 {
        format!("AI Chat (scrolled {scroll})")
    } else {
        "AI Chat".to_string()
    };

    let transcript = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(title))
        .scroll((top, 0));
    f.render_widget(transcript, area);
}

fn transcript_lines(state: &SessionState, width: usize) -> Vec<Line<'static>> {
    let mut lines = Vec::new();
    if state.transcript.is_empty() {
        lines.push(Line::styled(
            "Ask for something in plain language, e.g. \"show me the largest files here\".",
            Style::default().fg(Color::DarkGray),
        ));
        return lines;
    }

    for record in state.transcript.all() {
        match &record.entry {
            TranscriptEntry::UserMessage { text, .. } => {
                push_wrapped(&mut lines, text, width, "you> ", Style::default().fg(Color::Cyan));
            }
            TranscriptEntry::ModelReply {
                explanation,
                proposed_command,
                ..
            } => {
                push_wrapped(
                    &mut lines,
                    explanation,
                    width,
                    "ai> ",
                    Style::default().fg(Color::Green),
                );
                if let Some(command) = proposed_command {
                    push_wrapped(
                        &mut lines,
                        command,
                        width,
                        "  $ ",
                        Style::default().fg(Color::Yellow),
                    );
                }
            }
            TranscriptEntry::CommandResult {
                command,
                exit_code,
                stdout_tail,
                stderr_tail,
                duration_ms,
                ..
            } => {
                let status_color = if *exit_code == 0 {
                    Color::Green
                } else {
                    Color::Red
                };
                lines.push(Line::from(vec![
                    Span::styled(
                        format!("$ {command}"),
                        Style::default().add_modifier(Modifier::BOLD),
                    ),
                    Span::styled(
                        format!("  exit {exit_code}, {duration_ms} ms"),
                        Style::default().fg(status_color),
                    ),
                ]));
                push_wrapped(&mut lines, stdout_tail, width, "", Style::default());
                push_wrapped(
                    &mut lines,
                    stderr_tail,
                    width,
                    "",
                    Style::default().fg(Color::Red),
                );
            }
            TranscriptEntry::SystemNotice { text, severity } => {
                let color = match severity {
                    Severity::Info => Color::DarkGray,
                    Severity::Warning => Color::Yellow,
                    Severity::Error => Color::Red,
                };
                let prefix = format!("[{}] ", severity.label());
                push_wrapped(&mut lines, text, width, &prefix, Style::default().fg(color));
            }
        }
        lines.push(Line::default());
    }
    lines
}

/// Wraps `text` to `width`, prefixing the first line and indenting the rest to match.
fn push_wrapped(lines: &mut Vec<Line<'static>>, text: &str, width: usize, prefix: &str, style: Style) {
    let text = text.trim_end_matches('\n');
    if text.is_empty() {
        return;
    }
    let indent = " ".repeat(prefix.chars().count());
    let options = textwrap::Options::new(width)
        .initial_indent(prefix)
        .subsequent_indent(&indent);
    for row in textwrap::wrap(text, options) {
        lines.push(Line::styled(row.into_owned(), style));
    }
}

fn render_input(f: &mut ratatui::Frame, state: &SessionState, area: Rect) {
    let (title, body) = match &state.mode {
        ModeState::Menu => (
            "Menu",
            "Press Tab to ask the AI assistant".to_string(),
        ),
        ModeState::ChatComposing { draft } => ("Message", format!("> {draft}")),
        ModeState::ChatAwaitingModel { pending_user_text } => (
            "Thinking",
            format!("{} {pending_user_text}", get_spinner()),
        ),
        ModeState::ChatAwaitingConfirmation { command, .. } => {
            ("Confirm", format!("Run `{command}`?"))
        }
        ModeState::ChatExecuting { command } => {
            ("Running", format!("{} {command}", get_spinner()))
        }
    };
    let input = Paragraph::new(body.as_str())
        .block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(input, area);

    if let ModeState::ChatComposing { draft } = &state.mode {
        let offset = u16::try_from(draft.chars().count() + 2).unwrap_or(u16::MAX);
        let x = area
            .x
            .saturating_add(1)
            .saturating_add(offset)
            .min(area.right().saturating_sub(2));
        f.set_cursor_position((x, area.y + 1));
    }
}

fn footer_hint(mode: &ModeState) -> &'static str {
    match mode {
        ModeState::Menu => "Up/Down or j/k move | Enter open | b back | Tab chat | q quit",
        ModeState::ChatComposing { .. } => {
            "Enter send | Tab menu | Esc cancel | PgUp/PgDn scroll"
        }
        ModeState::ChatAwaitingModel { .. } | ModeState::ChatExecuting { .. } => {
            "Esc cancel | PgUp/PgDn scroll"
        }
        ModeState::ChatAwaitingConfirmation { .. } => "y/Enter run | n decline | Esc cancel",
    }
}

fn render_confirmation(f: &mut ratatui::Frame, command: &str, explanation: &str) {
    let area = centered_rect(70, 40, f.area());
    let mut lines = vec![
        Line::from(explanation.to_string()),
        Line::default(),
        Line::styled(
            format!("$ {command}"),
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ),
        Line::default(),
    ];
    lines.push(Line::from(vec![
        Span::styled("[y] ", Style::default().fg(Color::Green)),
        Span::raw("run   "),
        Span::styled("[n] ", Style::default().fg(Color::Red)),
        Span::raw("decline   "),
        Span::styled("[Esc] ", Style::default().fg(Color::DarkGray)),
        Span::raw("back to menu"),
    ]));
    let popup = Paragraph::new(lines)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Run this command?")
                .border_style(Style::default().fg(Color::Yellow)),
        )
        .wrap(Wrap { trim: false });
    f.render_widget(Clear, area);
    f.render_widget(popup, area);
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

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use mode_core::config::Config;
    use mode_core::transcript::TranscriptEntry;
    use pretty_assertions::assert_eq;
    use ratatui::backend::TestBackend;

    use super::*;
    use crate::menu::main_menu;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn ctrl_c() -> KeyEvent {
        KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)
    }

    fn session() -> SessionState {
        let mut config = Config::default();
        config.assistant.allowed_base_path = Some(PathBuf::from("/home/alice"));
        SessionState::new(
            Arc::new(config),
            PathBuf::from("/home/alice/work"),
            Arc::new(main_menu()),
        )
    }

    fn confirming() -> ModeState {
        ModeState::ChatAwaitingConfirmation {
            command: "git init".to_string(),
            explanation: "Creates a repository.".to_string(),
        }
    }

    #[test]
    fn ctrl_c_cancels_chat_and_quits_menu() {
        assert_eq!(map_key(&ModeState::Menu, ctrl_c()), Some(UserAction::Quit));
        assert_eq!(
            map_key(&ModeState::composing(), ctrl_c()),
            Some(UserAction::Cancel)
        );
        assert_eq!(map_key(&confirming(), ctrl_c()), Some(UserAction::Cancel));
    }

    #[test]
    fn menu_keys() {
        let menu = ModeState::Menu;
        assert_eq!(map_key(&menu, key(KeyCode::Char('j'))), Some(UserAction::MenuDown));
        assert_eq!(map_key(&menu, key(KeyCode::Up)), Some(UserAction::MenuUp));
        assert_eq!(map_key(&menu, key(KeyCode::Enter)), Some(UserAction::MenuSelect));
        assert_eq!(map_key(&menu, key(KeyCode::Char('b'))), Some(UserAction::MenuBack));
        assert_eq!(map_key(&menu, key(KeyCode::Tab)), Some(UserAction::ToggleChat));
        assert_eq!(map_key(&menu, key(KeyCode::Char('q'))), Some(UserAction::Quit));
    }

    #[test]
    fn composing_keys_edit_the_draft() {
        let composing = ModeState::composing();
        assert_eq!(
            map_key(&composing, key(KeyCode::Char('q'))),
            Some(UserAction::ChatInput('q'))
        );
        assert_eq!(map_key(&composing, key(KeyCode::Enter)), Some(UserAction::Submit));
        assert_eq!(map_key(&composing, key(KeyCode::Esc)), Some(UserAction::Cancel));
        assert_eq!(
            map_key(&composing, key(KeyCode::PageUp)),
            Some(UserAction::ScrollTranscript(ScrollDirection::Up))
        );
    }

    #[test]
    fn confirmation_accepts_y_enter_and_n() {
        let mode = confirming();
        assert_eq!(map_key(&mode, key(KeyCode::Char('y'))), Some(UserAction::Confirm));
        assert_eq!(map_key(&mode, key(KeyCode::Enter)), Some(UserAction::Confirm));
        assert_eq!(map_key(&mode, key(KeyCode::Char('n'))), Some(UserAction::Decline));
        assert_eq!(map_key(&mode, key(KeyCode::Tab)), None);
    }

    #[test]
    fn waiting_states_only_cancel() {
        let mode = ModeState::ChatExecuting {
            command: "sleep 5".to_string(),
        };
        assert_eq!(map_key(&mode, key(KeyCode::Char('x'))), None);
        assert_eq!(map_key(&mode, key(KeyCode::Esc)), Some(UserAction::Cancel));
    }

    #[test]
    fn transcript_lines_render_each_entry_kind() {
        let mut state = session();
        state.transcript.append(TranscriptEntry::user("list files"));
        state.transcript.append(TranscriptEntry::reply(
            "Lists the files.",
            Some("ls -la".into()),
        ));
        state.transcript.append(TranscriptEntry::CommandResult {
            command: "ls -la".into(),
            exit_code: 0,
            stdout_tail: "a.txt\n".into(),
            stderr_tail: "".into(),
            duration_ms: 4,
            timestamp: chrono::Utc::now(),
        });
        state
            .transcript
            .append(TranscriptEntry::notice(Severity::Warning, "denied: privilege escalation"));

        let text: Vec<String> = transcript_lines(&state, 80)
            .iter()
            .map(|line| line.spans.iter().map(|span| span.content.as_ref()).collect::<String>())
            .collect();
        assert_eq!(
            text,
            vec![
                "you> list files",
                "",
                "ai> Lists the files.",
                "  $ ls -la",
                "",
                "$ ls -la  exit 0, 4 ms",
                "a.txt",
                "",
                "[warning] denied: privilege escalation",
                "",
            ]
        );
    }

    #[test]
    fn long_messages_wrap_with_hanging_indent() {
        let mut state = session();
        state
            .transcript
            .append(TranscriptEntry::user("one two three four five"));
        let lines = transcript_lines(&state, 14);
        let first: String = lines[0].spans.iter().map(|span| span.content.as_ref()).collect();
        let second: String = lines[1].spans.iter().map(|span| span.content.as_ref()).collect();
        assert_eq!(first, "you> one two");
        assert_eq!(second, "     three");
    }

    #[test]
    fn confirmation_popup_shows_command() {
        let mut state = session();
        state.mode = confirming();
        let mut terminal = Terminal::new(TestBackend::new(80, 24)).expect("terminal");
        terminal.draw(|f| ui(f, &state)).expect("draw");

        let buffer = terminal.backend().buffer();
        let screen: String = buffer
            .content()
            .iter()
            .map(|cell| cell.symbol())
            .collect();
        assert!(screen.contains("Run this command?"));
        assert!(screen.contains("$ git init"));
    }

    #[test]
    fn menu_screen_lists_main_entries() {
        let state = session();
        let mut terminal = Terminal::new(TestBackend::new(100, 24)).expect("terminal");
        terminal.draw(|f| ui(f, &state)).expect("draw");

        let screen: String = terminal
            .backend()
            .buffer()
            .content()
            .iter()
            .map(|cell| cell.symbol())
            .collect();
        assert!(screen.contains("Normal Use"));
        assert!(screen.contains("The Code"));
        assert!(screen.contains("Mode Terminal"));
    }
}
