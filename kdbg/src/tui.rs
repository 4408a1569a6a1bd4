//! # Terminal User Interface (TUI)
//!
//! Interactive debugger front end built on `ratatui`.
//!
//! The TUI owns no debugger state. Every frame renders one
//! [`SessionSnapshot`], and every key press becomes at most one
//! [`Debugger`] command. Breakpoint hits and step completions arrive as
//! [`SessionNotice`]s and are shown in the status bar.
//!
//! ## Panels
//!
//! - `status` - debug state, location, stream health
//! - `panels` - registers, call stack, breakpoints, log (the scrollable views)
//! - `theme` - colors and styles
//!
//! ## Keys
//!
//! | Key | Action |
//! |-----|--------|
//! | `c` | continue |
//! | `s` | single step |
//! | `h` | halt |
//! | `b` | breakpoint at the current location |
//! | `Space` | enable/disable the selected breakpoint |
//! | `d` | delete the selected breakpoint |
//! | `t` | trace every probed function on/off |
//! | `Tab` | next view |
//! | `↑↓` `PgUp` `PgDn` | scroll the focused view |
//! | `?` | help |
//! | `q` | quit |

#![allow(clippy::too_many_lines, clippy::needless_pass_by_value)]

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::Receiver;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use log::debug;
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph},
    Frame, Terminal,
};

mod panels;
mod status;
mod theme;

use status::StatusPanel;
use theme::{
    state_color, ALERT_RED, CAUTION_AMBER, PRIMARY_GREEN, STYLE_DIM, STYLE_HEADING, STYLE_KEY,
    STYLE_TEXT,
};

use crate::domain::{Address, SessionError};
use crate::session::{Debugger, SessionNotice, SessionSnapshot, View};

/// Redraw rate
const UPDATE_INTERVAL: Duration = Duration::from_millis(100);

/// How long a status bar message stays up
const MESSAGE_LINGER: Duration = Duration::from_secs(4);

/// Rows moved by `PgUp`/`PgDn`
const PAGE: isize = 10;

// ============================================================================
// Key mapping
// ============================================================================

/// What a key press asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Continue,
    Step,
    Halt,
    ToggleTracing,
    BreakHere { address: Address, symbol: String },
    ToggleBreakpoint(Address),
    ClearBreakpoint(Address),
    Scroll(View, isize),
    FocusNext,
    Help,
    Quit,
}

/// The breakpoint under the breakpoint view's cursor
fn selected_breakpoint(snapshot: &SessionSnapshot) -> Option<Address> {
    snapshot.breakpoints.get(snapshot.scroll_of(View::Breakpoints)).map(|bp| bp.address)
}

/// Map a key to a command; `None` for unbound keys and commands with no target
#[must_use]
pub fn command_for_key(code: KeyCode, focus: View, snapshot: &SessionSnapshot) -> Option<Command> {
    match code {
        KeyCode::Char('q' | 'Q') | KeyCode::Esc => Some(Command::Quit),
        KeyCode::Char('c') => Some(Command::Continue),
        KeyCode::Char('s') => Some(Command::Step),
        KeyCode::Char('h') => Some(Command::Halt),
        KeyCode::Char('t') => Some(Command::ToggleTracing),
        KeyCode::Char('b') => (snapshot.current_address.value() != 0).then(|| Command::BreakHere {
            address: snapshot.current_address,
            symbol: snapshot.current_function.clone(),
        }),
        KeyCode::Char(' ') => selected_breakpoint(snapshot).map(Command::ToggleBreakpoint),
        KeyCode::Char('d') | KeyCode::Delete => {
            selected_breakpoint(snapshot).map(Command::ClearBreakpoint)
        }
        KeyCode::Tab => Some(Command::FocusNext),
        KeyCode::Up | KeyCode::Char('k') => Some(Command::Scroll(focus, -1)),
        KeyCode::Down | KeyCode::Char('j') => Some(Command::Scroll(focus, 1)),
        KeyCode::PageUp => Some(Command::Scroll(focus, -PAGE)),
        KeyCode::PageDown => Some(Command::Scroll(focus, PAGE)),
        KeyCode::Char('?') => Some(Command::Help),
        _ => None,
    }
}

// ============================================================================
// Live application state
// ============================================================================

struct LiveApp {
    focus: View,
    show_help: bool,
    message: Option<(String, Color, Instant)>,
    should_quit: bool,
}

impl LiveApp {
    fn new() -> Self {
        Self { focus: View::Registers, show_help: false, message: None, should_quit: false }
    }

    fn say(&mut self, text: impl Into<String>, color: Color) {
        self.message = Some((text.into(), color, Instant::now()));
    }

    fn current_message(&self) -> Option<(&str, Color)> {
        self.message
            .as_ref()
            .filter(|(_, _, at)| at.elapsed() < MESSAGE_LINGER)
            .map(|(text, color, _)| (text.as_str(), *color))
    }

    /// Run one command; only fatal session errors escape
    fn execute(&mut self, debugger: &mut Debugger, command: Command) -> Result<(), SessionError> {
        let outcome = match command {
            Command::Quit => {
                self.should_quit = true;
                return Ok(());
            }
            Command::Help => {
                self.show_help = true;
                return Ok(());
            }
            Command::FocusNext => {
                self.focus = self.focus.next();
                return Ok(());
            }
            Command::Scroll(view, delta) => debugger.scroll(view, delta).map(|_| None),
            Command::Continue => debugger.continue_execution().map(|s| Some(format!("[{s}]"))),
            Command::Step => debugger.step().map(|s| Some(format!("[{s}]"))),
            Command::Halt => debugger.halt().map(|s| Some(format!("[{s}]"))),
            Command::ToggleTracing => debugger
                .toggle_tracing()
                .map(|on| Some(format!("tracing {}", if on { "on" } else { "off" }))),
            Command::BreakHere { address, symbol } => debugger
                .set_breakpoint(address, symbol)
                .map(|()| Some(format!("breakpoint set at {address}"))),
            Command::ToggleBreakpoint(address) => debugger.toggle_breakpoint(address).map(|on| {
                Some(format!("breakpoint {} at {address}", if on { "enabled" } else { "disabled" }))
            }),
            Command::ClearBreakpoint(address) => debugger
                .clear_breakpoint(address)
                .map(|()| Some(format!("breakpoint cleared at {address}"))),
        };

        match outcome {
            Ok(Some(text)) => self.say(text, PRIMARY_GREEN),
            Ok(None) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                debug!("Command rejected: {e}");
                self.say(e.to_string(), ALERT_RED);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Rendering
// ============================================================================

fn render_header(f: &mut Frame, area: Rect, snapshot: &SessionSnapshot) {
    let (source, source_color) = if snapshot.probe_status.replay {
        ("[REPLAY]", CAUTION_AMBER)
    } else {
        ("[LIVE]", ALERT_RED)
    };

    let header = Paragraph::new(vec![Line::from(vec![
        Span::styled("KDBG", STYLE_HEADING),
        Span::styled(" | ", STYLE_DIM),
        Span::styled(source, Style::new().fg(source_color).add_modifier(Modifier::BOLD)),
        Span::styled(" | ", STYLE_DIM),
        Span::styled(snapshot.pid.to_string(), Style::new().fg(PRIMARY_GREEN)),
        Span::styled(" | ", STYLE_DIM),
        Span::styled(
            snapshot.debug_state.to_string(),
            Style::new().fg(state_color(snapshot.debug_state)).add_modifier(Modifier::BOLD),
        ),
        Span::styled(" | ", STYLE_DIM),
        Span::styled(format!("{} evts", snapshot.events_applied), Style::new().fg(CAUTION_AMBER)),
        Span::styled(format!(" (update #{})", snapshot.update_counter), STYLE_DIM),
    ])])
    .block(Block::default().borders(Borders::ALL).border_style(Style::new().fg(source_color)));
    f.render_widget(header, area);
}

fn render_status_bar(f: &mut Frame, area: Rect, app: &LiveApp) {
    let mut spans = Vec::new();
    for (key, label) in [
        ("c", ":Cont "),
        ("s", ":Step "),
        ("h", ":Halt "),
        ("b", ":Break "),
        ("t", ":Trace "),
        ("Tab", ":View "),
        ("?", ":Help "),
        ("q", ":Quit "),
    ] {
        spans.push(Span::styled(key, STYLE_KEY));
        spans.push(Span::styled(label, STYLE_DIM));
    }
    if let Some((text, color)) = app.current_message() {
        spans.push(Span::styled(format!(" {text}"), Style::new().fg(color)));
    }

    let status = Paragraph::new(vec![Line::from(spans)]).block(
        Block::default().borders(Borders::ALL).border_style(Style::default().fg(PRIMARY_GREEN)),
    );
    f.render_widget(status, area);
}

fn render_help_overlay(f: &mut Frame, area: Rect) {
    let popup_area = centered_popup(area, 70, 20);

    let key = |k: &'static str, text: &'static str| {
        Line::from(vec![
            Span::styled(format!("  {k:<10}"), STYLE_KEY),
            Span::styled(text, STYLE_TEXT),
        ])
    };
    let help_text = vec![
        Line::from(""),
        Line::from(Span::styled("  Execution", STYLE_HEADING)),
        key("c", "Continue: follow every event until a breakpoint hits"),
        key("s", "Step: stop again at the next event"),
        key("h", "Halt: freeze the view where it is"),
        Line::from(""),
        Line::from(Span::styled("  Breakpoints", STYLE_HEADING)),
        key("b", "Break at the current function"),
        key("Space", "Enable/disable the selected breakpoint"),
        key("d", "Delete the selected breakpoint"),
        key("t", "Trace every probed function"),
        Line::from(""),
        Line::from(Span::styled("  Views", STYLE_HEADING)),
        key("Tab", "Focus the next view"),
        key("↑↓ PgUp PgDn", "Scroll or select in the focused view"),
        Line::from(""),
        Line::from(Span::styled("  Press any key to close", STYLE_DIM)),
    ];

    let help_widget = Paragraph::new(help_text).block(
        Block::default()
            .borders(Borders::ALL)
            .title(" Help ")
            .style(Style::new().bg(Color::Black).fg(PRIMARY_GREEN)),
    );

    f.render_widget(Clear, popup_area);
    f.render_widget(help_widget, popup_area);
}

/// Create a centered popup area with given width percentage and height in lines
fn centered_popup(area: Rect, width_percent: u16, height_lines: u16) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Fill(1), Constraint::Length(height_lines), Constraint::Fill(1)])
        .split(area);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - width_percent) / 2),
            Constraint::Percentage(width_percent),
            Constraint::Percentage((100 - width_percent) / 2),
        ])
        .split(vertical[1])[1]
}

fn draw(f: &mut Frame, app: &LiveApp, snapshot: &SessionSnapshot) {
    let outer_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Min(0),    // Panels
            Constraint::Length(3), // Status bar
        ])
        .split(f.area());

    render_header(f, outer_layout[0], snapshot);

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(outer_layout[1]);
    let top_cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(30),
            Constraint::Percentage(35),
            Constraint::Percentage(35),
        ])
        .split(rows[0]);
    let bottom_cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(rows[1]);

    StatusPanel::new(snapshot).render(f, top_cols[0]);
    panels::render_registers(f, top_cols[1], snapshot, app.focus == View::Registers);
    panels::render_stack(f, top_cols[2], snapshot, app.focus == View::Stack);
    panels::render_breakpoints(f, bottom_cols[0], snapshot, app.focus == View::Breakpoints);
    panels::render_log(f, bottom_cols[1], snapshot, app.focus == View::Log);

    render_status_bar(f, outer_layout[2], app);

    if app.show_help {
        render_help_overlay(f, f.area());
    }
}

// ============================================================================
// Event loop
// ============================================================================

fn event_loop<B: Backend>(
    terminal: &mut Terminal<B>,
    debugger: &mut Debugger,
    notices: &Receiver<SessionNotice>,
    running: &AtomicBool,
) -> Result<()> {
    let mut app = LiveApp::new();
    let mut snapshot = debugger.snapshot()?;
    let mut last_update: Option<Instant> = None;

    loop {
        // Ingestion cleared the flag: fatal error or shutdown elsewhere
        if !running.load(Ordering::Acquire) {
            break;
        }

        while let Ok(notice) = notices.try_recv() {
            let color = match notice {
                SessionNotice::BreakpointHit { .. } => ALERT_RED,
                SessionNotice::StepComplete { .. } => CAUTION_AMBER,
            };
            app.say(notice.to_string(), color);
        }

        if last_update.is_none_or(|t| t.elapsed() >= UPDATE_INTERVAL) {
            snapshot = debugger.snapshot()?;
            terminal.draw(|f| draw(f, &app, &snapshot))?;
            last_update = Some(Instant::now());
        }

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    if app.show_help {
                        app.show_help = false;
                    } else if let Some(command) = command_for_key(key.code, app.focus, &snapshot) {
                        app.execute(debugger, command)?;
                        // Show the effect of the key without waiting a full interval
                        last_update = None;
                    }
                }
            }
        }

        if app.should_quit {
            break;
        }

        std::thread::sleep(Duration::from_millis(10));
    }

    Ok(())
}

/// Run the interactive debugger until the user quits or ingestion stops
///
/// Clears `running` on the way out so ingestion winds down with the UI.
///
/// Hands the debugger back so the caller can save breakpoints and detach.
///
/// # Errors
/// Terminal I/O errors and fatal session errors. The terminal is restored
/// in either case.
pub fn run_live(
    mut debugger: Debugger,
    notices: Receiver<SessionNotice>,
    running: Arc<AtomicBool>,
) -> Result<Debugger> {
    // -------------------------------------------------------------------------
    // Terminal Setup
    // -------------------------------------------------------------------------
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = event_loop(&mut terminal, &mut debugger, &notices, &running);
    running.store(false, Ordering::Release);

    // Cleanup terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;

    result.map(|()| debugger)
}
