use std::{
    io::stdout,
    sync::mpsc::{Receiver, TryRecvError},
    time::Duration,
};

use crate::csv_logger::SessionLoggers;
use crate::device_manager::{DeviceManager, Event};
use crate::gui::error::MonitorError;
use crate::hardware_message_decoder::{MessageType, Record};
use crate::session::DeviceSession;

use crossterm::{
    event::{self, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{
        block::{Position, Title},
        *,
    },
    Terminal,
};

const TICK: Duration = Duration::from_millis(16);

struct Entry {
    session: DeviceSession,
    record: Option<Record>,
}

struct App<'a> {
    manager: &'a DeviceManager,
    events: &'a Receiver<Event>,
    loggers: &'a mut SessionLoggers,
    record_new: bool,
    entries: Vec<Entry>,
    cursor: usize,
    anchors: Option<[[f32; 3]; 4]>,
}

impl App<'_> {
    fn drain_events(&mut self) -> Result<(), MonitorError> {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.handle(event),
                Err(TryRecvError::Empty) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::DevicesConnected => {
                for session in self.manager.take_new_devices() {
                    session.set_logging(self.record_new);
                    self.entries.push(Entry {
                        session,
                        record: None,
                    });
                }
            }
            Event::DevicesRemoved => {
                for session in self.manager.take_removed_devices() {
                    self.loggers.forget(&session);
                    self.entries.retain(|e| e.session.id() != session.id());
                }
                self.cursor = self.cursor.min(self.entries.len().saturating_sub(1));
            }
            Event::NewData(id) => {
                // the session may already be gone, that's fine
                let Some(session) = self.manager.session(&id) else {
                    return;
                };
                let Some(entry) = self.entries.iter_mut().find(|e| e.session.id() == &id) else {
                    return;
                };
                entry.record = session.last_record();
                if let Some(anchors) = entry.record.as_ref().and_then(Record::anchors) {
                    self.anchors = Some(anchors);
                }
                self.loggers.log(&session);
            }
        }
    }

    fn toggle_logging(&mut self) {
        if let Some(entry) = self.entries.get(self.cursor) {
            entry.session.set_logging(!entry.session.logging());
        }
    }
}

/// One line summary of the interesting part of a record.
pub(crate) fn summary(record: &Record) -> String {
    let [x, y, z] = match record.msg_type() {
        MessageType::Apr => return "anchor positions".to_owned(),
        _ => record.position().unwrap_or([f32::NAN; 3]),
    };
    let mut s = format!("({:.3}, {:.3}, {:.3})", x, y, z);
    if let Some([roll, pitch, yaw]) = record.attitude() {
        s += &format!(" rpy ({:.2}, {:.2}, {:.2})", roll, pitch, yaw);
    }
    s
}

/// Shows the connected boards and their latest records until the user
/// presses `q`. `l` toggles CSV logging for the selected board.
pub fn session_monitor(
    manager: &DeviceManager,
    events: &Receiver<Event>,
    loggers: &mut SessionLoggers,
    record_new: bool,
) -> Result<(), MonitorError> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let app = App {
        manager,
        events,
        loggers,
        record_new,
        entries: Vec::new(),
        cursor: 0,
        anchors: None,
    };
    let res = run_app(&mut terminal, app);

    // restore terminal
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    res
}

fn run_app<B: Backend>(terminal: &mut Terminal<B>, mut app: App) -> Result<(), MonitorError> {
    let mut table_state = TableState::default();
    loop {
        app.drain_events()?;
        table_state.select((!app.entries.is_empty()).then_some(app.cursor));
        terminal.draw(|frame| ui(frame, &app, &mut table_state))?;

        if event::poll(TICK)? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    let n_entries = app.entries.len().max(1);
                    match key.code {
                        KeyCode::Down => app.cursor = (app.cursor + 1) % n_entries,
                        KeyCode::Up => app.cursor = (app.cursor + n_entries - 1) % n_entries,
                        KeyCode::Char('l') => app.toggle_logging(),
                        KeyCode::Char('q') => return Ok(()),
                        _ => {}
                    }
                }
            }
        }
    }
}

fn ui(frame: &mut Frame, app: &App, table_state: &mut TableState) {
    let [table_area, anchors_area] = {
        let areas = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(3), Constraint::Length(3)])
            .split(frame.size());
        [areas[0], areas[1]]
    };

    let title = Title::from(" EVB1000 Monitor ".magenta().bold());
    let instructions = Title::from(Line::from(vec![
        " Navigate ".into(),
        "<Up>/<Down>".magenta().bold(),
        " Toggle logging ".into(),
        "<L>".magenta().bold(),
        " Quit ".into(),
        "<Q> ".magenta().bold(),
    ]));
    let block = Block::default()
        .title(title.alignment(Alignment::Center))
        .title(
            instructions
                .alignment(Alignment::Center)
                .position(Position::Bottom),
        )
        .borders(Borders::ALL);

    let header = Row::new(vec!["Port", "Session", "Tag", "Type", "Latest", "Log"])
        .style(Style::default().fg(Color::Magenta).add_modifier(Modifier::BOLD));
    let rows = app.entries.iter().map(|entry| {
        let (tag, msg_type, latest) = match &entry.record {
            Some(record) => (
                record.tag_id().map_or_else(String::new, |id| id.to_string()),
                record.msg_type().to_string(),
                summary(record),
            ),
            None => (String::new(), String::new(), "waiting...".to_owned()),
        };
        let logging = if entry.session.logging() { "rec" } else { "" };
        Row::new(vec![
            entry.session.port().path.clone(),
            entry.session.id().to_string(),
            tag,
            msg_type,
            latest,
            logging.to_owned(),
        ])
    });
    let table = Table::new(
        rows,
        [
            Constraint::Length(16),
            Constraint::Length(20),
            Constraint::Length(5),
            Constraint::Length(5),
            Constraint::Min(30),
            Constraint::Length(4),
        ],
    )
    .header(header)
    .block(block)
    .style(Style::default().fg(Color::White))
    .highlight_symbol(">>")
    .highlight_style(Style::default().fg(Color::Magenta));
    frame.render_stateful_widget(table, table_area, table_state);

    let anchors = match app.anchors {
        Some(anchors) => anchors
            .iter()
            .enumerate()
            .map(|(i, [x, y, z])| format!("A{} ({:.2}, {:.2}, {:.2})", i, x, y, z))
            .collect::<Vec<_>>()
            .join("  "),
        None => "no anchor report yet".to_owned(),
    };
    let anchors = Paragraph::new(anchors)
        .block(Block::default().title(" Anchors ").borders(Borders::ALL));
    frame.render_widget(anchors, anchors_area);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_summary() {
        let record: Record = "tpr 02 3f800000 40000000 40400000".parse().unwrap();
        assert_eq!(summary(&record), "(1.000, 2.000, 3.000)");
    }

    #[test]
    fn attitude_summary() {
        let record: Record = "kmf 02 3f800000 40000000 40400000 00000000 00000000 3f000000"
            .parse()
            .unwrap();
        assert_eq!(
            summary(&record),
            "(1.000, 2.000, 3.000) rpy (0.00, 0.00, 0.50)"
        );
    }

    #[test]
    fn anchor_summary() {
        let line = format!("apr 01{}", " 00000000".repeat(12));
        let record: Record = line.parse().unwrap();
        assert_eq!(summary(&record), "anchor positions");
    }
}
