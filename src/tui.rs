use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell as TableCell, Paragraph, Row, Table, TableState, Wrap};

use crate::domain::{ColumnKey, RowKey};
use crate::filter::ColumnFilterArg;
use crate::listing::{Listing, ListingUpdate, ProgressEvent, ProgressSink};
use crate::refresh::Trigger;
use crate::remote::RemoteSampleSource;
use crate::scope::Prefilter;
use crate::table::TableModel;

const EVENTS_MAX: usize = 6;
const LOGS_MAX: usize = 200;
const TICK: Duration = Duration::from_millis(120);
const CELL_WIDTH_MAX: u16 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    Table,
    Logs,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum InputMode {
    Browse,
    TextFilter,
    RangeFilter,
    ToggleColumn,
    ConfirmPurge(RowKey),
}

impl InputMode {
    fn prompt(&self) -> String {
        match self {
            InputMode::Browse => ": ".to_string(),
            InputMode::TextFilter => "/ ".to_string(),
            InputMode::RangeFilter => "# ".to_string(),
            InputMode::ToggleColumn => "column ".to_string(),
            InputMode::ConfirmPurge(key) => format!("purge {key}? (y/n) "),
        }
    }
}

#[derive(Debug)]
struct BrowseState {
    status: String,
    events: VecDeque<String>,
    logs: VecDeque<String>,
    busy: bool,
    started: Instant,
}

/// Interactive table browser over a [`Listing`]. Background completions are
/// applied on every tick, so the table updates while the user pages.
pub struct Tui {
    state: Rc<RefCell<BrowseState>>,
    view: View,
    input_mode: InputMode,
    input: String,
    selected: usize,
    log_scroll: u16,
    changes: Rc<Cell<u64>>,
}

struct TuiProgress {
    state: Rc<RefCell<BrowseState>>,
}

impl ProgressSink for TuiProgress {
    fn event(&self, event: ProgressEvent) {
        let mut state = self.state.borrow_mut();
        let message = event.message.trim().to_string();
        let line = match event.elapsed {
            Some(elapsed) => format!("{message} ({} ms)", elapsed.as_millis()),
            None => message.clone(),
        };
        state.status = message;
        push_bounded(&mut state.events, line.clone(), EVENTS_MAX);
        push_bounded(&mut state.logs, format!("[{}] {line}", timestamp()), LOGS_MAX);
    }
}

impl Default for Tui {
    fn default() -> Self {
        Self::new()
    }
}

impl Tui {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(BrowseState {
                status: "ready".to_string(),
                events: VecDeque::new(),
                logs: VecDeque::new(),
                busy: false,
                started: Instant::now(),
            })),
            view: View::Table,
            input_mode: InputMode::Browse,
            input: String::new(),
            selected: 0,
            log_scroll: 0,
            changes: Rc::new(Cell::new(0)),
        }
    }

    pub fn browse<S: RemoteSampleSource + 'static>(
        &mut self,
        listing: &mut Listing<S>,
        prefilter: Prefilter,
    ) -> miette::Result<()> {
        let sink = TuiProgress {
            state: self.state.clone(),
        };
        let changes = self.changes.clone();
        listing
            .view_mut()
            .on_changed(move |_| changes.set(changes.get().wrapping_add(1)));
        listing.set_prefilter(prefilter, &sink).into_diagnostic()?;

        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;

        let result = self.event_loop(listing, &sink);

        disable_raw_mode().into_diagnostic()?;
        let mut stdout = io::stdout();
        stdout.execute(LeaveAlternateScreen).into_diagnostic()?;
        result
    }

    fn event_loop<S: RemoteSampleSource + 'static>(
        &mut self,
        listing: &mut Listing<S>,
        sink: &TuiProgress,
    ) -> miette::Result<()> {
        let backend = CrosstermBackend::new(io::stdout());
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        let mut tick = 0usize;
        loop {
            for update in listing.pump(sink) {
                self.record_update(&update);
            }
            self.set_busy(listing.is_busy());
            self.selected = self.selected.min(listing.view().row_count().saturating_sub(1));

            {
                let state = self.state.borrow();
                terminal
                    .draw(|frame| draw_ui(frame, self, listing, &state, tick))
                    .into_diagnostic()?;
            }

            if event::poll(TICK).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    if self.handle_key(key, listing, sink) {
                        break;
                    }
                }
            }
            tick = tick.wrapping_add(1);
        }
        Ok(())
    }

    fn handle_key<S: RemoteSampleSource + 'static>(
        &mut self,
        key: KeyEvent,
        listing: &mut Listing<S>,
        sink: &TuiProgress,
    ) -> bool {
        if key.kind != KeyEventKind::Press {
            return false;
        }
        if self.input_mode != InputMode::Browse {
            self.handle_prompt_key(key, listing, sink);
            return false;
        }

        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => {
                if self.view != View::Table {
                    self.view = View::Table;
                    return false;
                }
                return true;
            }
            KeyCode::Right | KeyCode::Char('n') => {
                listing.view_mut().next_page();
                self.selected = 0;
            }
            KeyCode::Left | KeyCode::Char('p') => {
                listing.view_mut().prev_page();
                self.selected = 0;
            }
            KeyCode::Up => self.selected = self.selected.saturating_sub(1),
            KeyCode::Down => self.selected = self.selected.saturating_add(1),
            KeyCode::PageUp if self.view == View::Logs => self.scroll_logs(5),
            KeyCode::PageDown if self.view == View::Logs => self.scroll_logs(-5),
            KeyCode::PageUp => {
                listing.view_mut().prev_page();
                self.selected = 0;
            }
            KeyCode::PageDown => {
                listing.view_mut().next_page();
                self.selected = 0;
            }
            KeyCode::Char('r') => {
                if let Err(err) = listing.refresh(sink) {
                    self.report(format!("refresh failed: {err}"));
                }
            }
            KeyCode::Char('m') => {
                if let Err(err) = listing.fetch_missing(sink) {
                    self.report(format!("missing-sample fetch failed: {err}"));
                }
            }
            KeyCode::Char('c') => {
                listing.view_mut().clear_filters();
                self.report("filters cleared".to_string());
            }
            KeyCode::Char('/') => self.start_prompt(InputMode::TextFilter),
            KeyCode::Char('#') => self.start_prompt(InputMode::RangeFilter),
            KeyCode::Char('v') => self.start_prompt(InputMode::ToggleColumn),
            KeyCode::Char('x') => {
                if let Some(row) = listing.view().row_at(self.selected) {
                    let key = row.key();
                    if key.is_placeholder() {
                        self.report(format!("{key} has no sample to purge"));
                    } else {
                        self.start_prompt(InputMode::ConfirmPurge(key));
                    }
                }
            }
            KeyCode::Char('l') | KeyCode::F(4) => {
                self.view = if self.view == View::Logs { View::Table } else { View::Logs };
            }
            KeyCode::Char('?') | KeyCode::F(1) => {
                self.view = if self.view == View::Help { View::Table } else { View::Help };
            }
            _ => {}
        }
        false
    }

    fn handle_prompt_key<S: RemoteSampleSource + 'static>(
        &mut self,
        key: KeyEvent,
        listing: &mut Listing<S>,
        sink: &TuiProgress,
    ) {
        if let InputMode::ConfirmPurge(row_key) = &self.input_mode {
            if matches!(key.code, KeyCode::Char('y') | KeyCode::Char('Y')) {
                let row_key = row_key.clone();
                if let Err(err) = listing.purge_sample(&row_key, sink) {
                    self.report(format!("purge failed: {err}"));
                }
            }
            self.finish_prompt();
            return;
        }

        match key.code {
            KeyCode::Esc => self.finish_prompt(),
            KeyCode::Backspace => {
                self.input.pop();
            }
            KeyCode::Enter => {
                let value = self.input.trim().to_string();
                let mode = self.input_mode.clone();
                self.finish_prompt();
                if !value.is_empty() {
                    self.apply_prompt(&mode, &value, listing);
                }
            }
            KeyCode::Char(ch) => self.input.push(ch),
            _ => {}
        }
    }

    fn apply_prompt<S: RemoteSampleSource + 'static>(
        &mut self,
        mode: &InputMode,
        value: &str,
        listing: &mut Listing<S>,
    ) {
        let outcome = match mode {
            InputMode::TextFilter => value
                .parse::<ColumnFilterArg>()
                .map(|arg| listing.view_mut().apply_filter(&arg)),
            InputMode::RangeFilter => {
                ColumnFilterArg::parse_range(value).map(|arg| listing.view_mut().apply_filter(&arg))
            }
            InputMode::ToggleColumn => value.parse::<ColumnKey>().map(|column| {
                let visible = listing.view().visible_columns().contains(&column);
                listing.view_mut().set_column_visible(column, !visible);
            }),
            InputMode::Browse | InputMode::ConfirmPurge(_) => Ok(()),
        };
        match outcome {
            Ok(()) => {
                self.selected = 0;
                self.report(format!("applied {value}"));
            }
            Err(err) => self.report(err.to_string()),
        }
    }

    fn start_prompt(&mut self, mode: InputMode) {
        self.input.clear();
        self.input_mode = mode;
    }

    fn finish_prompt(&mut self) {
        self.input.clear();
        self.input_mode = InputMode::Browse;
    }

    fn record_update(&self, update: &ListingUpdate) {
        match update {
            ListingUpdate::RefreshFailed {
                trigger: Trigger::User,
                error,
                ..
            } => self.report(format!("refresh failed: {error}")),
            ListingUpdate::CacheWriteFailed { error } => self.report(format!("cache not saved: {error}")),
            ListingUpdate::Refreshed { missing, .. } if !missing.is_empty() => {
                self.report(format!("{} subgroups have unresolved samples (press m)", missing.len()))
            }
            _ => {}
        }
    }

    fn report(&self, message: String) {
        let mut state = self.state.borrow_mut();
        push_bounded(&mut state.logs, format!("[{}] {message}", timestamp()), LOGS_MAX);
        state.status = message;
    }

    fn set_busy(&self, busy: bool) {
        let mut state = self.state.borrow_mut();
        if busy && !state.busy {
            state.started = Instant::now();
        }
        state.busy = busy;
    }

    fn scroll_logs(&mut self, delta: i16) {
        let next = self.log_scroll as i32 + delta as i32;
        self.log_scroll = next.clamp(0, LOGS_MAX as i32) as u16;
    }
}

fn draw_ui<S: RemoteSampleSource + 'static>(
    frame: &mut ratatui::Frame,
    tui: &Tui,
    listing: &Listing<S>,
    state: &BrowseState,
    tick: usize,
) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(4),
        ])
        .split(frame.area());

    frame.render_widget(draw_header(tui, listing, state, tick), chunks[0]);
    match tui.view {
        View::Table => draw_table(frame, tui, listing, chunks[1]),
        View::Logs => frame.render_widget(draw_logs_view(state, tui.log_scroll), chunks[1]),
        View::Help => frame.render_widget(draw_help(), chunks[1]),
    }
    draw_command_line(frame, tui, state, chunks[2]);
}

fn draw_header<S: RemoteSampleSource + 'static>(
    tui: &Tui,
    listing: &Listing<S>,
    state: &BrowseState,
    tick: usize,
) -> Paragraph<'static> {
    let spinner = if state.busy {
        ["|", "/", "-", "\\"][tick % 4]
    } else {
        " "
    };
    let pagination = listing.view().pagination();
    let scope = listing.scope().key();
    let header_line = Line::from(vec![
        Span::styled(
            "SAMPLE-LISTING",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" "),
        Span::styled(env!("CARGO_PKG_VERSION"), Style::default().fg(Color::Gray)),
        Span::raw(format!(
            "   Page {}/{}   Rows {} of {}   ",
            pagination.page(),
            pagination.total_pages(),
            pagination.total_rows(),
            listing.view().table().row_count()
        )),
        Span::styled(spinner, Style::default().fg(Color::Green)),
    ]);

    let filters: Vec<String> = listing
        .view()
        .filter()
        .filters()
        .iter()
        .map(|(key, filter)| format!("{key}={filter}"))
        .collect();
    let busy_for = if state.busy {
        format!("   working {}s", state.started.elapsed().as_secs())
    } else {
        String::new()
    };
    let scope_line = Line::from(vec![
        Span::styled(
            format!("Scope: {}", truncate(&scope, 40)),
            Style::default().fg(Color::Gray),
        ),
        Span::styled(
            format!("   Role: {:?}", listing.prefilter().role),
            Style::default().fg(Color::Gray),
        ),
        Span::styled(
            if filters.is_empty() {
                "   Filters: none".to_string()
            } else {
                format!("   Filters: {}", filters.join(", "))
            },
            Style::default().fg(Color::Yellow),
        ),
        Span::styled(
            format!("   Changes: {}{busy_for}", tui.changes.get()),
            Style::default().fg(Color::Gray),
        ),
    ]);
    Paragraph::new(vec![header_line, scope_line])
        .alignment(Alignment::Left)
        .block(Block::default().borders(Borders::BOTTOM))
}

fn draw_table<S: RemoteSampleSource + 'static>(
    frame: &mut ratatui::Frame,
    tui: &Tui,
    listing: &Listing<S>,
    area: Rect,
) {
    let view = listing.view();
    let columns = view.column_count();
    let header_style = Style::default()
        .fg(Color::Cyan)
        .add_modifier(Modifier::BOLD);
    let header = Row::new(
        (0..columns).map(|column| TableCell::from(view.header_label(column).unwrap_or_default())),
    )
    .style(header_style);

    let mut widths: Vec<u16> = (0..columns)
        .map(|column| view.header_label(column).map_or(4, |label| label.chars().count() as u16))
        .collect();
    let mut rows = Vec::with_capacity(view.row_count());
    for row in 0..view.row_count() {
        let cells: Vec<String> = (0..columns)
            .map(|column| first_line(&view.cell_value(row, column).unwrap_or_default()))
            .collect();
        for (width, cell) in widths.iter_mut().zip(&cells) {
            *width = (*width).max(cell.chars().count() as u16).min(CELL_WIDTH_MAX);
        }
        let missing = view.row_at(row).is_some_and(|sample| sample.missing_sample);
        let style = if missing {
            Style::default().fg(Color::Yellow)
        } else {
            Style::default()
        };
        rows.push(Row::new(cells.into_iter().map(TableCell::from)).style(style));
    }

    let empty = rows.is_empty();
    let table = Table::new(rows, widths.into_iter().map(Constraint::Length))
        .header(header)
        .column_spacing(2)
        .row_highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .block(Block::default());
    let mut table_state = TableState::default().with_selected((!empty).then_some(tui.selected));
    frame.render_stateful_widget(table, area, &mut table_state);
}

fn draw_logs_view(state: &BrowseState, scroll: u16) -> Paragraph<'static> {
    let total = state.logs.len();
    let visible = 12usize;
    let start = total.saturating_sub(scroll as usize + visible);
    let mut lines = Vec::with_capacity(visible + 1);
    lines.push(Line::from(Span::styled(
        "LOGS (PgUp/PgDn to scroll)",
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    )));
    for line in state.logs.iter().skip(start).take(visible) {
        lines.push(Line::from(line.clone()));
    }
    Paragraph::new(lines)
        .block(Block::default())
        .wrap(Wrap { trim: true })
}

fn draw_help() -> Paragraph<'static> {
    let keys = [
        ("←/→ PgUp/PgDn", "previous / next page"),
        ("↑/↓", "select row"),
        ("r", "refresh the listing"),
        ("m", "fetch unresolved samples"),
        ("/", "filter: column=text or column=min..max"),
        ("#", "range filter: column=min..max"),
        ("c", "clear filters"),
        ("v", "show or hide a column"),
        ("x", "purge the selected sample"),
        ("l", "logs"),
        ("q", "quit"),
    ];
    let mut lines = vec![Line::from(Span::styled(
        "KEYS",
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    ))];
    for (key, action) in keys {
        lines.push(Line::from(vec![
            Span::styled(format!("{key:<16}"), Style::default().fg(Color::Yellow)),
            Span::raw(action),
        ]));
    }
    let columns: Vec<&str> = ColumnKey::ALL.iter().map(|key| key.as_str()).collect();
    lines.push(Line::from(""));
    lines.push(Line::from(format!("Columns: {}", columns.join(" "))));
    Paragraph::new(lines).wrap(Wrap { trim: true })
}

fn draw_command_line(frame: &mut ratatui::Frame, tui: &Tui, state: &BrowseState, area: Rect) {
    let prefix = tui.input_mode.prompt();
    let prefix_width = prefix.chars().count() as u16;
    let mut lines = vec![
        Line::from(vec![
            Span::styled(
                prefix,
                Style::default()
                    .fg(Color::Cyan)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(tui.input.clone(), Style::default().fg(Color::White)),
        ]),
        Line::from(vec![
            Span::styled("= ", Style::default().fg(Color::DarkGray)),
            Span::styled(state.status.clone(), Style::default().fg(Color::DarkGray)),
        ]),
    ];
    if let Some(event) = state.events.back() {
        lines.push(Line::from(Span::styled(
            format!("- {event}"),
            Style::default().fg(Color::Gray),
        )));
    }
    let para = Paragraph::new(lines).block(Block::default().borders(Borders::TOP));
    frame.render_widget(para, area);

    if tui.input_mode != InputMode::Browse {
        let offset = prefix_width.saturating_add(tui.input.chars().count() as u16);
        let cursor_x = area
            .x
            .saturating_add(offset)
            .min(area.x.saturating_add(area.width.saturating_sub(1)));
        frame.set_cursor_position((cursor_x, area.y.saturating_add(1)));
    }
}

fn first_line(cell: &str) -> String {
    cell.lines().next().unwrap_or("").to_string()
}

fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }
    let mut out: String = value.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn push_bounded(buffer: &mut VecDeque<String>, item: String, max: usize) {
    buffer.push_back(item);
    while buffer.len() > max {
        buffer.pop_front();
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}
