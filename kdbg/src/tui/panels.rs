//! One render function per scrollable view
//!
//! Each panel draws from a [`SessionSnapshot`] only. The view's scroll cursor
//! marks the selected row; the panel scrolls so the cursor stays visible.

use kdbg_common::REGISTER_NAMES;
use ratatui::{
    layout::Rect,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

use super::theme::{
    border_style, confidence_marker, ALERT_RED, CAUTION_AMBER, INFO_DIM, PRIMARY_GREEN, STYLE_DIM,
    STYLE_SELECTED, STYLE_TEXT,
};
use crate::session::{SessionSnapshot, View};

/// First row to draw so that `cursor` is visible in `height` rows
fn first_visible(cursor: usize, height: usize) -> usize {
    if height == 0 {
        0
    } else {
        cursor.saturating_sub(height - 1)
    }
}

fn inner_height(area: Rect) -> usize {
    usize::from(area.height.saturating_sub(2))
}

fn select(line: Line<'static>, selected: bool) -> Line<'static> {
    if selected {
        line.style(STYLE_SELECTED)
    } else {
        line
    }
}

fn render_rows(f: &mut Frame, area: Rect, title: String, focused: bool, rows: Vec<Line<'static>>) {
    let paragraph = Paragraph::new(rows).block(
        Block::default().borders(Borders::ALL).title(title).border_style(border_style(focused)),
    );
    f.render_widget(paragraph, area);
}

pub fn render_registers(f: &mut Frame, area: Rect, snapshot: &SessionSnapshot, focused: bool) {
    let cursor = snapshot.scroll_of(View::Registers);
    let height = inner_height(area);
    let start = first_visible(cursor, height);
    let values = snapshot.registers.values();

    let rows = REGISTER_NAMES
        .iter()
        .zip(values)
        .enumerate()
        .skip(start)
        .take(height)
        .map(|(i, (name, value))| {
            let value_style = if value == 0 { STYLE_DIM } else { STYLE_TEXT };
            let line = Line::from(vec![
                Span::styled(format!(" {name:<4}"), Style::new().fg(CAUTION_AMBER)),
                Span::styled(format!("0x{value:016x}"), value_style),
            ]);
            select(line, focused && i == cursor)
        })
        .collect();

    let (label, _) = confidence_marker(snapshot.register_confidence);
    render_rows(f, area, format!("Registers ({label})"), focused, rows);
}

pub fn render_stack(f: &mut Frame, area: Rect, snapshot: &SessionSnapshot, focused: bool) {
    let cursor = snapshot.scroll_of(View::Stack);
    let height = inner_height(area);
    let start = first_visible(cursor, height);

    let rows = if snapshot.call_stack.is_empty() {
        vec![Line::from(Span::styled(" (no frames)", STYLE_DIM))]
    } else {
        snapshot
            .call_stack
            .iter()
            .enumerate()
            .skip(start)
            .take(height)
            .map(|(depth, frame)| {
                let line = Line::from(vec![
                    Span::styled(format!(" #{depth:<3}"), STYLE_DIM),
                    Span::styled(format!("{} ", frame.address), Style::new().fg(INFO_DIM)),
                    Span::styled(frame.function.clone(), STYLE_TEXT),
                ]);
                select(line, focused && depth == cursor)
            })
            .collect()
    };

    render_rows(f, area, format!("Call Stack ({})", snapshot.tid), focused, rows);
}

pub fn render_breakpoints(f: &mut Frame, area: Rect, snapshot: &SessionSnapshot, focused: bool) {
    let cursor = snapshot.scroll_of(View::Breakpoints);
    let height = inner_height(area);
    let start = first_visible(cursor, height);

    let rows = if snapshot.breakpoints.is_empty() {
        vec![Line::from(Span::styled(" (none, press b to break here)", STYLE_DIM))]
    } else {
        snapshot
            .breakpoints
            .iter()
            .enumerate()
            .skip(start)
            .take(height)
            .map(|(i, bp)| {
                let (marker, color) =
                    if bp.enabled { ("●", ALERT_RED) } else { ("○", INFO_DIM) };
                let line = Line::from(vec![
                    Span::styled(format!(" {marker} "), Style::new().fg(color)),
                    Span::styled(format!("{} ", bp.address), STYLE_DIM),
                    Span::styled(bp.symbol.clone(), STYLE_TEXT),
                    Span::styled(
                        format!("  hits:{}", bp.hit_count),
                        Style::new().fg(PRIMARY_GREEN),
                    ),
                ]);
                select(line, focused && i == cursor)
            })
            .collect()
    };

    let title = format!(
        "Breakpoints ({}{})",
        snapshot.breakpoints.len(),
        if snapshot.trace_all { ", tracing all" } else { "" }
    );
    render_rows(f, area, title, focused, rows);
}

pub fn render_log(f: &mut Frame, area: Rect, snapshot: &SessionSnapshot, focused: bool) {
    let cursor = snapshot.scroll_of(View::Log);
    let height = inner_height(area);

    // Without focus the log follows the newest line
    let start = if focused {
        first_visible(cursor, height)
    } else {
        snapshot.log.len().saturating_sub(height)
    };

    let rows = snapshot
        .log
        .iter()
        .enumerate()
        .skip(start)
        .take(height)
        .map(|(i, text)| {
            let line = Line::from(Span::styled(format!(" {text}"), STYLE_DIM));
            select(line, focused && i == cursor)
        })
        .collect();

    render_rows(f, area, "Log".to_string(), focused, rows);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_visible_keeps_cursor_on_screen() {
        assert_eq!(first_visible(0, 10), 0);
        assert_eq!(first_visible(9, 10), 0);
        assert_eq!(first_visible(10, 10), 1);
        assert_eq!(first_visible(31, 8), 24);
        assert_eq!(first_visible(5, 0), 0);
    }
}
