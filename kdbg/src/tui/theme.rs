//! TUI color theme
//!
//! Green-on-black terminal palette; amber and red mark states that need the
//! user's attention.

use ratatui::style::{Color, Modifier, Style};

use crate::contract::RegisterConfidence;
use crate::session::DebugState;

pub const PRIMARY_GREEN: Color = Color::Rgb(0, 255, 0);
pub const ALERT_RED: Color = Color::Rgb(255, 0, 0);
pub const CAUTION_AMBER: Color = Color::Rgb(255, 191, 0);
pub const INFO_DIM: Color = Color::Rgb(0, 180, 0);

pub const STYLE_HEADING: Style = Style::new().fg(PRIMARY_GREEN).add_modifier(Modifier::BOLD);
pub const STYLE_DIM: Style = Style::new().fg(INFO_DIM);
pub const STYLE_KEY: Style = Style::new().fg(CAUTION_AMBER);
pub const STYLE_TEXT: Style = Style::new().fg(Color::White);
pub const STYLE_SELECTED: Style = Style::new().fg(Color::Black).bg(PRIMARY_GREEN);

/// Color of the debug state indicator
#[must_use]
pub fn state_color(state: DebugState) -> Color {
    match state {
        DebugState::Running => PRIMARY_GREEN,
        DebugState::Stepping => CAUTION_AMBER,
        DebugState::AtBreakpoint => ALERT_RED,
        DebugState::Stopped => INFO_DIM,
    }
}

/// Label and color describing how far register values can be trusted
#[must_use]
pub fn confidence_marker(confidence: RegisterConfidence) -> (&'static str, Color) {
    match confidence {
        RegisterConfidence::Full => ("full", PRIMARY_GREEN),
        RegisterConfidence::Partial => ("partial, zero may mean not captured", CAUTION_AMBER),
        RegisterConfidence::Unavailable => ("unavailable", ALERT_RED),
    }
}

/// Border style for a panel, highlighted when it has keyboard focus
#[must_use]
pub fn border_style(focused: bool) -> Style {
    if focused {
        Style::new().fg(CAUTION_AMBER).add_modifier(Modifier::BOLD)
    } else {
        Style::new().fg(PRIMARY_GREEN)
    }
}
