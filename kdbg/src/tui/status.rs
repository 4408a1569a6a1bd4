use ratatui::{
    layout::Rect,
    style::{Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

use super::theme::{state_color, CAUTION_AMBER, INFO_DIM, PRIMARY_GREEN};
use crate::session::SessionSnapshot;

/// Session overview: where execution is and how healthy the event stream is
pub struct StatusPanel<'a> {
    snapshot: &'a SessionSnapshot,
    lossy: bool,
}

impl<'a> StatusPanel<'a> {
    pub fn new(snapshot: &'a SessionSnapshot) -> Self {
        let ingest = &snapshot.ingest;
        let lossy = ingest.kernel_dropped > 0
            || ingest.malformed > 0
            || ingest.recording_failures > 0
            || snapshot.probe_status.degraded();
        Self { snapshot, lossy }
    }

    fn row(label: &'static str, value: String, color: ratatui::style::Color) -> Line<'static> {
        Line::from(vec![
            Span::styled(format!(" {label:<8}"), Style::default().fg(INFO_DIM)),
            Span::styled(value, Style::default().fg(color)),
        ])
    }

    pub fn render(&self, f: &mut Frame, area: Rect) {
        let s = self.snapshot;
        let mut lines = vec![Line::from(Span::styled(
            format!(" [{}]", s.debug_state),
            Style::default().fg(state_color(s.debug_state)).add_modifier(Modifier::BOLD),
        ))];
        lines.push(Line::from(""));

        let function = if s.current_function.is_empty() { "-" } else { &s.current_function };
        lines.push(Self::row("Func", function.to_string(), PRIMARY_GREEN));
        lines.push(Self::row("Addr", s.current_address.to_string(), PRIMARY_GREEN));
        lines.push(Self::row(
            "Thread",
            format!("{} {}", s.tid, s.cpu),
            PRIMARY_GREEN,
        ));
        if let Some(ret) = s.last_return {
            lines.push(Self::row("Return", format!("0x{ret:x}"), PRIMARY_GREEN));
        }
        lines.push(Line::from(""));

        lines.push(Self::row("Events", s.events_applied.to_string(), PRIMARY_GREEN));
        lines.push(Self::row("Hits", s.breakpoint_hits.to_string(), PRIMARY_GREEN));

        let ingest = &s.ingest;
        let loss_color = if self.lossy { CAUTION_AMBER } else { PRIMARY_GREEN };
        lines.push(Self::row("Dropped", ingest.kernel_dropped.to_string(), loss_color));
        lines.push(Self::row("Bad", ingest.malformed.to_string(), loss_color));

        let probes = &s.probe_status;
        if probes.replay {
            lines.push(Self::row("Probes", "replay".to_string(), INFO_DIM));
        } else {
            let color = if probes.degraded() { CAUTION_AMBER } else { PRIMARY_GREEN };
            lines.push(Self::row(
                "Probes",
                format!("{} ok, {} failed", probes.attached.len(), probes.failures.len()),
                color,
            ));
        }

        let border_color = if self.lossy { CAUTION_AMBER } else { PRIMARY_GREEN };
        let paragraph = Paragraph::new(lines).block(
            Block::default()
                .borders(Borders::ALL)
                .title("Status")
                .border_style(Style::default().fg(border_color)),
        );

        f.render_widget(paragraph, area);
    }
}
