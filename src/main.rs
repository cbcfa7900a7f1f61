use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use std::{fs::File, io};

use anyhow::{Context, Result};
use capflow::{Config, DetailArtifact, DetailNode, Error, Generation, Loader, LoaderEvent, Source, SummaryRow};
use clap::Parser;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph},
    Terminal,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "capflow")]
#[command(version, about = "Browse packet captures through tshark")]
struct Cli {
    /// Capture file to read (or to write when capturing from an interface)
    file: Option<PathBuf>,

    /// Display filter
    filter: Option<String>,

    /// Capture from this interface
    #[arg(short, long)]
    interface: Option<String>,

    /// Keep following the file as it grows
    #[arg(short, long)]
    follow: bool,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where to write the log (the terminal belongs to the viewer)
    #[arg(long, default_value = "capflow.log")]
    log: PathBuf,
}

impl Cli {
    fn source(&self) -> Result<Source> {
        match (&self.interface, &self.file) {
            (Some(interface), file) => Ok(Source::Interface {
                interface: interface.clone(),
                capture_file: file
                    .clone()
                    .unwrap_or_else(|| std::env::temp_dir().join(format!("capflow-{}.pcap", std::process::id()))),
            }),
            (None, Some(file)) if self.follow => Ok(Source::Live(file.clone())),
            (None, Some(file)) => Ok(Source::File(file.clone())),
            (None, None) => anyhow::bail!("need a capture file or --interface"),
        }
    }
}

/// What a detail request came back with
type DetailReply = (u64, capflow::Result<Option<Arc<DetailArtifact>>>);

struct App {
    generation: Generation,
    filter: String,
    editing: Option<String>,
    rows: Vec<SummaryRow>,
    list_state: ListState,
    detail: Option<Arc<DetailArtifact>>,
    requested: Option<u64>,
    /// In-flight decode for `requested`; aborting it kills the decoder
    detail_task: Option<tokio::task::JoinHandle<()>>,
    status: String,
}

impl App {
    fn new(filter: String) -> Self {
        Self {
            generation: 0,
            filter,
            editing: None,
            rows: Vec::new(),
            list_state: ListState::default(),
            detail: None,
            requested: None,
            detail_task: None,
            status: String::from("Starting"),
        }
    }

    fn apply(&mut self, event: LoaderEvent) {
        match event {
            LoaderEvent::Started {
                generation,
                incremental,
            } => {
                self.generation = generation;
                if !incremental {
                    self.rows.clear();
                    self.list_state.select(None);
                    self.detail = None;
                    self.requested = None;
                    if let Some(task) = self.detail_task.take() {
                        task.abort();
                    }
                }
                self.status = format!("Loading (generation {})", generation);
            }
            LoaderEvent::Row(tagged) if tagged.generation == self.generation => {
                self.rows.push(tagged.payload);
                if self.list_state.selected().is_none() {
                    self.list_state.select(Some(0));
                }
            }
            LoaderEvent::Warning(tagged) if tagged.generation == self.generation => {
                self.status = format!("Warning: {}", tagged.payload.reason);
            }
            LoaderEvent::Completed { generation, rows } if generation == self.generation => {
                self.status = format!("{} packets ({} new)", self.rows.len(), rows);
            }
            LoaderEvent::Failed { generation, error } if generation == self.generation => {
                self.status = format!("Load failed: {}", error);
            }
            LoaderEvent::CaptureStopped { error } => {
                self.status = match error {
                    Some(error) => format!("Capture stopped: {}", error),
                    None => String::from("Capture stopped"),
                };
            }
            _ => {}
        }
    }

    fn selected_index(&self) -> Option<u64> {
        self.list_state
            .selected()
            .and_then(|i| self.rows.get(i))
            .map(|row| row.index)
    }

    fn move_selection(&mut self, delta: isize) {
        if self.rows.is_empty() {
            return;
        }
        let last = self.rows.len() - 1;
        let i = match self.list_state.selected() {
            Some(i) => (i as isize + delta).clamp(0, last as isize) as usize,
            None => 0,
        };
        self.list_state.select(Some(i));
    }
}

fn row_line(row: &SummaryRow) -> String {
    let cell = |value: &Option<String>| value.clone().unwrap_or_default();
    format!(
        "{:>6} {:<14} {:<20} {:<20} {:<8} {:>6} {}",
        row.index,
        cell(&row.timestamp),
        cell(&row.source),
        cell(&row.destination),
        cell(&row.protocol),
        row.length.map(|l| l.to_string()).unwrap_or_default(),
        cell(&row.info),
    )
}

fn protocol_color(protocol: Option<&str>) -> Color {
    match protocol.unwrap_or_default() {
        "TLSv1.2" | "TLSv1.3" | "TLS" => Color::Magenta,
        "DNS" | "MDNS" => Color::Blue,
        "SSH" | "SSHv2" => Color::Green,
        "HTTP" => Color::Yellow,
        "ARP" => Color::Cyan,
        _ => Color::Gray,
    }
}

fn tree_lines(nodes: &[DetailNode], depth: usize, out: &mut Vec<String>) {
    for node in nodes.iter().filter(|n| !n.hidden) {
        out.push(format!("{}{}", "  ".repeat(depth), node.label()));
        tree_lines(&node.children, depth + 1, out);
    }
}

fn hex_lines(bytes: &[u8]) -> Vec<String> {
    bytes
        .chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            let ascii: String = chunk
                .iter()
                .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
                .collect();
            format!("{:04x}  {:<32}  {}", i * 16, hex::encode(chunk), ascii)
        })
        .collect()
}

fn init_logging(path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating log file {}", path.display()))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("capflow=info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::sync::Mutex::new(file)).with_ansi(false))
        .with(filter)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;
    let config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    config.validate()?;
    let source = cli.source()?;

    let (loader, mut events) = Loader::new(config);
    let loader = Arc::new(loader);
    let mut app = App::new(cli.filter.clone().unwrap_or_default());
    app.generation = loader.request(source.clone(), app.filter.clone());
    info!("Viewing {:?}", source);

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run(&mut terminal, &loader, &mut app, &mut events, &source).await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;

    if let Err(e) = loader.shutdown().await {
        error!("Shutdown failed: {}", e);
    }
    result
}

async fn run(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    loader: &Arc<Loader>,
    app: &mut App,
    events: &mut tokio::sync::mpsc::UnboundedReceiver<LoaderEvent>,
    source: &Source,
) -> Result<()> {
    let (detail_tx, detail_rx) = mpsc::channel::<DetailReply>();
    terminal.clear()?;

    loop {
        while let Ok(event) = events.try_recv() {
            app.apply(event);
        }
        while let Ok((index, reply)) = detail_rx.try_recv() {
            if Some(index) != app.selected_index() {
                continue;
            }
            app.detail_task = None;
            match reply {
                Ok(detail) => app.detail = detail,
                // A newer generation started; ask again under it
                Err(Error::Superseded(_)) => app.requested = None,
                Err(e) => app.status = format!("Detail for packet {} failed: {}", index, e),
            }
        }

        // Fetch the tree for a newly selected packet
        if let Some(index) = app.selected_index() {
            if app.requested != Some(index) {
                app.requested = Some(index);
                if let Some(task) = app.detail_task.take() {
                    task.abort();
                }
                app.detail = loader.cached(index);
                if app.detail.is_none() {
                    let loader = loader.clone();
                    let tx = detail_tx.clone();
                    app.detail_task = Some(tokio::spawn(async move {
                        let reply = loader.detail(index).await;
                        let _ = tx.send((index, reply));
                    }));
                }
            }
        }

        terminal.draw(|f| {
            let outer = Layout::default()
                .direction(Direction::Vertical)
                .constraints([Constraint::Percentage(55), Constraint::Min(5), Constraint::Length(1)])
                .split(f.size());
            let lower = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
                .split(outer[1]);

            let items: Vec<ListItem> = app
                .rows
                .iter()
                .map(|row| {
                    ListItem::new(row_line(row)).style(Style::default().fg(protocol_color(row.protocol.as_deref())))
                })
                .collect();
            let title = if app.filter.is_empty() {
                String::from(" Packets ")
            } else {
                format!(" Packets [{}] ", app.filter)
            };
            let list = List::new(items)
                .block(Block::default().title(title).borders(Borders::ALL))
                .highlight_style(Style::default().add_modifier(Modifier::BOLD).fg(Color::Yellow))
                .highlight_symbol(">> ");
            f.render_stateful_widget(list, outer[0], &mut app.list_state);

            let mut tree = Vec::new();
            let mut bytes = Vec::new();
            if let Some(detail) = &app.detail {
                tree_lines(&detail.protos, 0, &mut tree);
                bytes = hex_lines(&detail.raw_bytes());
            }
            let tree: Vec<Line> = tree.into_iter().map(Line::from).collect();
            f.render_widget(
                Paragraph::new(tree).block(Block::default().title(" Detail ").borders(Borders::ALL)),
                lower[0],
            );
            let bytes: Vec<Line> = bytes.into_iter().map(Line::from).collect();
            f.render_widget(
                Paragraph::new(bytes).block(Block::default().title(" Bytes ").borders(Borders::ALL)),
                lower[1],
            );

            let status = match &app.editing {
                Some(input) => Line::from(vec![
                    Span::styled("Filter: ", Style::default().fg(Color::Cyan)),
                    Span::raw(input.as_str()),
                ]),
                None => Line::from(Span::styled(app.status.as_str(), Style::default().fg(Color::Gray))),
            };
            f.render_widget(Paragraph::new(status), outer[2]);
        })?;

        if !event::poll(Duration::from_millis(16))? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };

        if let Some(input) = app.editing.as_mut() {
            match key.code {
                KeyCode::Char(c) => input.push(c),
                KeyCode::Backspace => {
                    input.pop();
                }
                KeyCode::Enter => {
                    app.filter = input.trim().to_string();
                    app.editing = None;
                    app.generation = loader.request(source.clone(), app.filter.clone());
                }
                KeyCode::Esc => app.editing = None,
                _ => {}
            }
            continue;
        }

        match key.code {
            KeyCode::Char('q') => break,
            KeyCode::Char('/') => app.editing = Some(app.filter.clone()),
            KeyCode::Char('s') => {
                if let Some(generation) = loader.stop() {
                    app.status = format!("Stopped generation {} at {} packets", generation, app.rows.len());
                }
            }
            KeyCode::Char('r') => {
                if let Some(generation) = loader.reload() {
                    app.generation = generation;
                }
            }
            KeyCode::Down => app.move_selection(1),
            KeyCode::Up => app.move_selection(-1),
            KeyCode::PageDown => app.move_selection(20),
            KeyCode::PageUp => app.move_selection(-20),
            KeyCode::Home => app.move_selection(isize::MIN / 2),
            KeyCode::End => app.move_selection(isize::MAX / 2),
            _ => {}
        }
    }
    Ok(())
}
