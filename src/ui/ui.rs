use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph},
    Frame,
};
use ratatui_image::{picker::Picker, protocol::StatefulProtocol, Resize, StatefulImage};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use tachi_reader::backend::cache::PageKey;
use tachi_reader::backend::models::{Chapter, Manga};
use tachi_reader::backend::preferences::{
    choice_label, max_size_choices, padding_choices, ImageScale, ReaderModeSettings,
    ReaderPreferences,
};
use tachi_reader::reader::chapter::ReaderChapter;
use tachi_reader::reader::loader::{PageList, PageStatus, ReaderPage};
use tachi_reader::reader::menu::ReaderMenu;
use tachi_reader::reader::model::PageMove;
use tachi_reader::reader::pager::PagerState;
use tachi_reader::reader::state::ReaderState;

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub enum View {
    #[default]
    ChapterList,
    Reader,
}

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub enum AppState {
    #[default]
    Loading,
    Ready,
}

/// Everything the reader screen holds while a chapter is open.
pub struct ReaderView {
    pub menu: ReaderMenu,
    pub pager: PagerState,
    pub pages: PageList,
    pub pages_rx: watch::Receiver<PageList>,
    pub page_moves: broadcast::Receiver<PageMove>,
    pub chapter: watch::Receiver<Option<Arc<ReaderChapter>>>,
    pub state: watch::Receiver<ReaderState>,
    pub settings_open: watch::Receiver<bool>,
    /// 0-based page last handed to the menu as progress.
    pub reported_page: Option<usize>,
    pub reported_offset: Option<i32>,
    pub mode_cursor: usize,
}

impl ReaderView {
    pub fn new(menu: ReaderMenu) -> Self {
        Self {
            pages_rx: menu.pages(),
            page_moves: menu.page_moves(),
            chapter: menu.chapter(),
            state: menu.state(),
            settings_open: menu.settings_menu_open(),
            pages: PageList::from(Vec::new()),
            pager: PagerState::default(),
            reported_page: None,
            reported_offset: None,
            mode_cursor: 0,
            menu,
        }
    }

    pub fn current_page(&self) -> Option<&Arc<ReaderPage>> {
        self.pages.get(self.pager.current_page())
    }
}

pub struct App {
    pub state: AppState,
    pub loading_message: String,
    pub view: View,
    pub manga: Option<Manga>,
    pub chapters: Vec<Chapter>,
    pub chapter_list_state: ListState,
    pub reader: Option<ReaderView>,
    pub preferences: ReaderPreferences,
    pub picker: Picker,
    pub page_images: HashMap<PageKey, StatefulProtocol>,
    pub pending_images: HashSet<PageKey>,
    pub failed_images: HashMap<PageKey, String>,
    pub page_rows: u16,
    pub status_message: Option<String>,
}

impl App {
    pub fn new(preferences: ReaderPreferences) -> Self {
        let picker = Picker::from_query_stdio().unwrap_or_else(|e| {
            log::warn!("Terminal graphics query failed, using half blocks: {}", e);
            Picker::halfblocks()
        });

        Self {
            state: AppState::Loading,
            loading_message: "Initializing...".to_string(),
            view: View::ChapterList,
            manga: None,
            chapters: Vec::new(),
            chapter_list_state: ListState::default(),
            reader: None,
            preferences,
            picker,
            page_images: HashMap::new(),
            pending_images: HashSet::new(),
            failed_images: HashMap::new(),
            page_rows: 0,
            status_message: None,
        }
    }

    pub fn set_loading(&mut self, message: &str) {
        self.state = AppState::Loading;
        self.loading_message = message.to_string();
    }

    pub fn set_ready(&mut self) {
        self.state = AppState::Ready;
    }

    pub fn set_chapters(&mut self, chapters: Vec<Chapter>) {
        let selected = self
            .chapter_list_state
            .selected()
            .unwrap_or_else(|| chapters.iter().position(|c| !c.read).unwrap_or(0));
        self.chapter_list_state
            .select((!chapters.is_empty()).then(|| selected.min(chapters.len() - 1)));
        self.chapters = chapters;
    }

    pub fn selected_chapter(&self) -> Option<&Chapter> {
        self.chapters.get(self.chapter_list_state.selected()?)
    }

    pub fn open_reader(&mut self, menu: ReaderMenu) {
        self.reader = Some(ReaderView::new(menu));
        self.view = View::Reader;
    }

    /// Leaves the reader, returning it so the caller can save progress.
    pub fn close_reader(&mut self) -> Option<ReaderView> {
        self.view = View::ChapterList;
        self.page_images.clear();
        self.pending_images.clear();
        self.failed_images.clear();
        self.reader.take()
    }

    pub fn add_page_image(&mut self, key: PageKey, image: image::DynamicImage) {
        self.pending_images.remove(&key);
        let protocol = self.picker.new_resize_protocol(image);
        self.page_images.insert(key, protocol);
    }

    pub fn fail_page_image(&mut self, key: PageKey, message: String) {
        self.pending_images.remove(&key);
        self.failed_images.insert(key, message);
    }

    /// Drops decoded pages that left the window around `current`.
    pub fn prune_page_images(&mut self, current: PageKey, look_ahead: usize) {
        retain_window(&mut self.page_images, current, look_ahead);
        retain_window(&mut self.failed_images, current, look_ahead);
    }
}

/// Whether `key` is the page before `current`, `current` itself, or one of
/// the `look_ahead` pages after it, in the same chapter.
pub fn in_image_window(current: PageKey, look_ahead: usize, key: &PageKey) -> bool {
    key.chapter == current.chapter
        && key.page + 1 >= current.page
        && key.page <= current.page + look_ahead
}

fn retain_window<V>(map: &mut HashMap<PageKey, V>, current: PageKey, look_ahead: usize) {
    map.retain(|key, _| in_image_window(current, look_ahead, key));
}

pub fn resize_for(scale: ImageScale) -> Resize {
    match scale {
        ImageScale::OriginalSize => Resize::Crop(None),
        ImageScale::SmartFit => Resize::Fit(None),
        ImageScale::FitScreen
        | ImageScale::FitWidth
        | ImageScale::FitHeight
        | ImageScale::Stretch => Resize::Scale(None),
    }
}

/// Where a page is drawn inside `area`: narrowed to the mode's max width and,
/// in continuous modes, inset by the page gap.
pub fn page_area(area: Rect, settings: &ReaderModeSettings) -> Rect {
    let mut page = area;
    if let Some(width) = settings.max_width_cells()
        && width < page.width
    {
        page.x += (page.width - width) / 2;
        page.width = width;
    }
    if settings.continuous {
        let gap = settings.padding_cells().min(page.height.saturating_sub(1) / 2);
        page.y += gap;
        page.height -= gap * 2;
    }
    page
}

/// Edits `mode` for one settings key and returns the status line to show.
/// `None` means `key` does not edit a setting.
pub fn edit_mode_setting(preferences: &ReaderPreferences, mode: &str, key: char) -> Option<String> {
    let edit: fn(&mut ReaderModeSettings) = match key {
        'c' => |s: &mut ReaderModeSettings| s.continuous = !s.continuous,
        'o' => |s: &mut ReaderModeSettings| s.direction = s.direction.next(),
        'p' => ReaderModeSettings::cycle_padding,
        's' => ReaderModeSettings::cycle_max_size,
        'f' => |s: &mut ReaderModeSettings| s.fit_size = !s.fit_size,
        'i' => |s: &mut ReaderModeSettings| s.image_scale = s.image_scale.next(),
        _ => return None,
    };
    if preferences.mode_settings(mode).default_mode {
        return Some(format!("{} is built in, press a to add a custom mode", mode));
    }
    if preferences.update_mode_settings(mode, edit) {
        Some(format!("Updated {}", mode))
    } else {
        Some(format!("{} not found", mode))
    }
}

pub fn ui(f: &mut Frame, app: &mut App) {
    let area = f.area();
    match (app.state, app.view) {
        (AppState::Loading, _) => draw_loading_screen(f, area, &app.loading_message),
        (AppState::Ready, View::ChapterList) => draw_chapter_list(f, app),
        (AppState::Ready, View::Reader) => draw_reader(f, app),
    }
}

fn spinner() -> &'static str {
    let spinner_frames = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    spinner_frames[(millis / 100) as usize % spinner_frames.len()]
}

fn draw_loading_screen(f: &mut Frame, area: Rect, message: &str) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title("Manga Reader")
        .border_style(Style::default().fg(Color::Cyan));

    let inner = block.inner(area);
    f.render_widget(block, area);

    let center_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage(40),
            Constraint::Length(3),
            Constraint::Length(2),
            Constraint::Percentage(40),
        ])
        .split(inner);

    let loading_text = Line::from(vec![
        Span::styled(
            format!(" {} ", spinner()),
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled(
            "Loading...",
            Style::default()
                .fg(Color::White)
                .add_modifier(Modifier::BOLD),
        ),
    ]);

    let loading_paragraph = Paragraph::new(loading_text).alignment(Alignment::Center);
    f.render_widget(loading_paragraph, center_layout[1]);

    let message = Paragraph::new(message)
        .style(Style::default().fg(Color::DarkGray))
        .alignment(Alignment::Center);
    f.render_widget(message, center_layout[2]);
}

fn draw_chapter_list(f: &mut Frame, app: &mut App) {
    let area = f.area();
    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(5), Constraint::Length(3)])
        .split(area);

    let title = app
        .manga
        .as_ref()
        .map(|m| m.title.clone())
        .unwrap_or_else(|| "Chapters".to_string());
    let width = root[0].width.saturating_sub(4) as usize;

    let items: Vec<ListItem> = app
        .chapters
        .iter()
        .map(|chapter| {
            let style = if chapter.read {
                Style::default().fg(Color::DarkGray)
            } else {
                Style::default().fg(Color::White)
            };
            let mut spans = vec![Span::styled(
                truncate_text(&chapter.name, width.saturating_sub(16)),
                style,
            )];
            if !chapter.read && chapter.last_page_read > 0 {
                spans.push(Span::styled(
                    format!("  page {}", chapter.last_page_read),
                    Style::default().fg(Color::Cyan),
                ));
            }
            ListItem::new(Line::from(spans))
        })
        .collect();

    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(truncate_text(&title, width))
                .border_style(Style::default().fg(Color::Cyan)),
        )
        .highlight_style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("▶ ");
    f.render_stateful_widget(list, root[0], &mut app.chapter_list_state);

    draw_footer(
        f,
        root[1],
        &[("↑/↓", "select"), ("Enter", "read"), ("r", "refresh"), ("q", "quit")],
        app.status_message.as_deref(),
    );
}

fn draw_reader(f: &mut Frame, app: &mut App) {
    let area = f.area();
    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(3), Constraint::Length(3)])
        .split(area);
    app.page_rows = root[0].height;

    let Some(reader) = app.reader.as_ref() else {
        return;
    };

    let state = reader.state.borrow().clone();
    if reader.pages.is_empty() {
        match state.error() {
            Some(e) => draw_error(f, root[0], &format!("{}", e), "Esc: back  r: reload"),
            None => draw_loading_screen(f, root[0], &format!("Chapter {}", state.phase())),
        }
    } else {
        draw_page(f, root[0], reader, &mut app.page_images, &app.failed_images);
    }

    let chapter_name = reader
        .chapter
        .borrow()
        .as_ref()
        .map(|c| c.chapter.name.clone())
        .unwrap_or_default();
    let page = if reader.pages.is_empty() {
        "-".to_string()
    } else {
        format!("{}/{}", reader.pager.current_page() + 1, reader.pages.len())
    };
    let status = format!(
        "{}  {}  {}  [{}]",
        chapter_name,
        page,
        reader.menu.reader_mode(),
        state.phase()
    );
    draw_footer(
        f,
        root[1],
        &[("←/→", "page"), ("n/p", "chapter"), ("m", "modes"), ("Esc", "back")],
        Some(app.status_message.as_deref().unwrap_or(&status)),
    );

    if *reader.settings_open.borrow() {
        draw_settings_overlay(f, area, reader, &app.preferences);
    }
}

fn draw_page(
    f: &mut Frame,
    area: Rect,
    reader: &ReaderView,
    page_images: &mut HashMap<PageKey, StatefulProtocol>,
    failed_images: &HashMap<PageKey, String>,
) {
    let Some(page) = reader.current_page() else {
        return;
    };
    let number = page.index + 1;
    let settings = reader.menu.reader_mode_settings();
    match page.status() {
        PageStatus::Ready(_) => {
            if let Some(message) = failed_images.get(&page.key()) {
                draw_error(
                    f,
                    area,
                    &format!("Page {} could not be decoded: {}", number, message),
                    "r: retry",
                );
                return;
            }
            match page_images.get_mut(&page.key()) {
                Some(state) => {
                    let image_widget =
                        StatefulImage::new().resize(resize_for(settings.image_scale));
                    f.render_stateful_widget(image_widget, page_area(area, &settings), state);
                }
                None => draw_loading_screen(f, area, &format!("Decoding page {}", number)),
            }
        }
        PageStatus::Error(e) => draw_error(
            f,
            area,
            &format!("Page {} failed: {}", number, e),
            "r: retry",
        ),
        PageStatus::Queued | PageStatus::Loading => {
            draw_loading_screen(f, area, &format!("Page {}", number))
        }
    }
}

fn draw_error(f: &mut Frame, area: Rect, message: &str, hint: &str) {
    let text = vec![
        Line::from(""),
        Line::from(Span::styled(
            message.to_string(),
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )),
        Line::from(Span::styled(hint.to_string(), Style::default().fg(Color::DarkGray))),
    ];
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Red));
    let p = Paragraph::new(text).block(block).alignment(Alignment::Center);
    f.render_widget(p, area);
}

const SETTINGS_LINES: u16 = 7;

fn draw_settings_overlay(
    f: &mut Frame,
    area: Rect,
    reader: &ReaderView,
    preferences: &ReaderPreferences,
) {
    let modes = preferences.modes();
    let active = reader.menu.reader_mode();
    let selected = modes.get(reader.mode_cursor).cloned().unwrap_or_default();
    let settings = preferences.mode_settings(&selected);

    let height = (modes.len() as u16 + 2 + SETTINGS_LINES + 2).min(area.height);
    let width = 52.min(area.width);
    let popup = Rect::new(
        area.x + (area.width - width) / 2,
        area.y + (area.height - height) / 2,
        width,
        height,
    );
    let parts = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(3), Constraint::Length(SETTINGS_LINES + 2)])
        .split(popup);

    let items: Vec<ListItem> = modes
        .iter()
        .map(|mode| {
            let marker = if *mode == active { "● " } else { "  " };
            ListItem::new(format!("{}{}", marker, mode))
        })
        .collect();
    let mut state = ListState::default().with_selected(Some(reader.mode_cursor));
    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Reader mode")
                .border_style(Style::default().fg(Color::Yellow)),
        )
        .highlight_style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD));

    f.render_widget(Clear, popup);
    f.render_stateful_widget(list, parts[0], &mut state);

    let yes_no = |on: bool| if on { "on" } else { "off" };
    let lines = vec![
        Line::from(format!("c  Continuous   {}", yes_no(settings.continuous))),
        Line::from(format!("o  Direction    {}", settings.direction.label())),
        Line::from(format!(
            "p  Padding      {}",
            choice_label(&padding_choices(), settings.padding)
        )),
        Line::from(format!("i  Image scale  {}", settings.image_scale.label())),
        Line::from(format!("f  Fit size     {}", yes_no(settings.fit_size))),
        Line::from(format!(
            "s  Max size     {}",
            choice_label(&max_size_choices(settings.direction), settings.max_size)
        )),
        Line::from(Span::styled(
            "Enter: use for manga  d: default  a: add mode",
            Style::default().fg(Color::DarkGray),
        )),
    ];
    let title = if settings.default_mode {
        format!("{} (built in)", selected)
    } else {
        selected
    };
    let details = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .title(title)
            .border_style(Style::default().fg(Color::Yellow)),
    );
    f.render_widget(details, parts[1]);
}

fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        format!(
            "{}...",
            text.chars()
                .take(max_len.saturating_sub(3))
                .collect::<String>()
        )
    }
}

fn draw_footer(f: &mut Frame, area: Rect, keys: &[(&str, &str)], status: Option<&str>) {
    let mut spans = Vec::new();
    if let Some(status) = status {
        spans.push(Span::styled(
            format!("{}  ", status),
            Style::default().fg(Color::White),
        ));
    }
    for (key, action) in keys {
        spans.push(Span::styled(*key, Style::default().fg(Color::Yellow)));
        spans.push(Span::raw(format!(": {}  ", action)));
    }

    let p = Paragraph::new(Line::from(spans))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Cyan)),
        )
        .alignment(Alignment::Center);
    f.render_widget(p, area);
}
