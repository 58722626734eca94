mod ui;

use anyhow::Context;
use clap::Parser;
use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures::StreamExt;
use image::DynamicImage;
use ratatui::{backend::CrosstermBackend, Terminal};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast::error::TryRecvError, mpsc};

use tachi_reader::backend::cache::{PageCache, PageKey};
use tachi_reader::backend::models::{Chapter, Manga, PageBytes};
use tachi_reader::backend::preferences::ReaderPreferences;
use tachi_reader::backend::server::{MangaRepository, ServerClient};
use tachi_reader::config::{cache_dir, Config, ReaderConfig};
use tachi_reader::reader::loader::PageStatus;
use tachi_reader::reader::menu::{ReaderMenu, ReaderMenuParams};
use tachi_reader::reader::model::{Navigation, PageTarget};
use tachi_reader::reader::pager::PagerState;
use tachi_reader::reader::scope::TaskScope;
use ui::ui::{edit_mode_setting, ui, App, ReaderView, View};

const PROGRESS_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Terminal manga reader for Tachidesk-compatible servers.
#[derive(Parser, Debug)]
#[command(name = "tachi-reader", version, about)]
struct Args {
    /// Id of the manga on the server
    manga_id: i64,

    /// Open this chapter index directly instead of the chapter list
    #[arg(long)]
    chapter: Option<u32>,

    /// Server base url, overrides the config file and TACHI_READER_SERVER
    #[arg(long)]
    server: Option<String>,

    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    log_file: Option<PathBuf>,
}

enum BackgroundTask {
    MangaLoaded { manga: Manga },
    ChaptersLoaded { chapters: Vec<Chapter> },
    PageDecoded { key: PageKey, image: DynamicImage },
    PageDecodeFailed { key: PageKey, message: String },
    Failed { message: String },
}

/// Shared handles the event loop needs to open readers.
struct Session {
    repository: Arc<dyn MangaRepository>,
    cache: PageCache,
    reader_config: ReaderConfig,
    background: TaskScope,
    manga_id: i64,
}

fn init_logging(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(file)))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_file = args
        .log_file
        .clone()
        .unwrap_or_else(|| cache_dir().join("reader.log"));
    init_logging(&log_file)?;

    let mut config = Config::load(args.config.as_deref()).context("loading config")?;
    if let Some(server) = args.server.clone() {
        config.server.url = server;
    }
    log::info!("Using server {}", config.server.url);

    let client = ServerClient::new(&config.server).context("building http client")?;
    let ctx = Session {
        repository: Arc::new(client),
        cache: PageCache::from_config(&config.cache),
        reader_config: config.reader.clone(),
        background: TaskScope::new("background"),
        manga_id: args.manga_id,
    };

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(ReaderPreferences::load());
    let (task_tx, mut task_rx) = mpsc::unbounded_channel::<BackgroundTask>();

    app.set_loading("Connecting to server...");
    terminal.draw(|f| ui(f, &mut app))?;

    spawn_manga_loader(&ctx, task_tx.clone());
    spawn_chapters_loader(&ctx, task_tx.clone());
    if let Some(chapter_index) = args.chapter {
        open_reader(&mut app, &ctx, chapter_index);
    }

    let res = run_app(&mut terminal, &mut app, &ctx, &mut task_rx, task_tx).await;

    // progress of the open chapter goes out before the runtime stops
    if let Some(reader) = app.close_reader() {
        reader.menu.send_progress();
    }

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if tokio::time::timeout(PROGRESS_FLUSH_TIMEOUT, ctx.background.drain())
        .await
        .is_err()
    {
        log::warn!(
            "Gave up on {} pending progress writes",
            ctx.background.in_flight()
        );
    }

    if let Err(err) = res {
        eprintln!("{err}");
    }
    Ok(())
}

fn spawn_manga_loader(ctx: &Session, tx: mpsc::UnboundedSender<BackgroundTask>) {
    let repository = Arc::clone(&ctx.repository);
    let manga_id = ctx.manga_id;
    tokio::spawn(async move {
        match repository.get_manga(manga_id).await {
            Ok(manga) => {
                let _ = tx.send(BackgroundTask::MangaLoaded { manga });
            }
            Err(e) => {
                log::warn!("Error loading manga {}: {}", manga_id, e);
                let _ = tx.send(BackgroundTask::Failed {
                    message: e.to_string(),
                });
            }
        }
    });
}

fn spawn_chapters_loader(ctx: &Session, tx: mpsc::UnboundedSender<BackgroundTask>) {
    let repository = Arc::clone(&ctx.repository);
    let manga_id = ctx.manga_id;
    tokio::spawn(async move {
        match repository.get_chapters(manga_id).await {
            Ok(chapters) => {
                let _ = tx.send(BackgroundTask::ChaptersLoaded { chapters });
            }
            Err(e) => {
                log::warn!("Error loading chapters of manga {}: {}", manga_id, e);
                let _ = tx.send(BackgroundTask::Failed {
                    message: e.to_string(),
                });
            }
        }
    });
}

fn spawn_page_decoder(key: PageKey, bytes: PageBytes, tx: mpsc::UnboundedSender<BackgroundTask>) {
    tokio::task::spawn_blocking(move || match image::load_from_memory(&bytes) {
        Ok(image) => {
            let _ = tx.send(BackgroundTask::PageDecoded { key, image });
        }
        Err(e) => {
            log::warn!("Error decoding page {} of {}: {}", key.page, key.chapter, e);
            let _ = tx.send(BackgroundTask::PageDecodeFailed {
                key,
                message: e.to_string(),
            });
        }
    });
}

fn open_reader(app: &mut App, ctx: &Session, chapter_index: u32) {
    log::info!("Opening chapter {} of manga {}", chapter_index, ctx.manga_id);
    let menu = ReaderMenu::new(
        ReaderMenuParams {
            manga_id: ctx.manga_id,
            chapter_index,
        },
        Arc::clone(&ctx.repository),
        app.preferences.clone(),
        ctx.cache.clone(),
        &ctx.reader_config,
        ctx.background.clone(),
    );
    app.status_message = None;
    app.open_reader(menu);
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    ctx: &Session,
    task_rx: &mut mpsc::UnboundedReceiver<BackgroundTask>,
    task_tx: mpsc::UnboundedSender<BackgroundTask>,
) -> io::Result<()> {
    let mut event_stream = EventStream::new();

    loop {
        sync_reader(app, &ctx.reader_config, &task_tx).await;
        terminal.draw(|f| ui(f, app))?;

        tokio::select! {
            // redraw tick for spinners and page status
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}

            Some(Ok(event)) = event_stream.next() => {
                if let Event::Key(key) = event
                    && key.kind == KeyEventKind::Press
                {
                    if key.code == KeyCode::Char('q') {
                        return Ok(());
                    }
                    match app.view {
                        View::ChapterList => handle_chapter_list_input(app, ctx, key.code, &task_tx),
                        View::Reader => handle_reader_input(app, ctx, key.code, &task_tx),
                    }
                }
            }

            Some(task) = task_rx.recv() => {
                match task {
                    BackgroundTask::MangaLoaded { manga } => {
                        app.manga = Some(manga);
                    }
                    BackgroundTask::ChaptersLoaded { chapters } => {
                        app.set_chapters(chapters);
                        app.status_message = None;
                        app.set_ready();
                    }
                    BackgroundTask::PageDecoded { key, image } => {
                        app.add_page_image(key, image);
                    }
                    BackgroundTask::PageDecodeFailed { key, message } => {
                        app.fail_page_image(key, message);
                    }
                    BackgroundTask::Failed { message } => {
                        app.status_message = Some(message);
                        app.set_ready();
                    }
                }
            }
        }
    }
}

/// Feeds the menu's outputs into the pager and the pager's position back
/// into the menu.
async fn sync_reader(
    app: &mut App,
    config: &ReaderConfig,
    task_tx: &mpsc::UnboundedSender<BackgroundTask>,
) {
    let rows = app.page_rows as i32;
    let Some(reader) = app.reader.as_mut() else {
        return;
    };

    let settings = reader.menu.reader_mode_settings();
    let continuous = settings.continuous;
    let item_size = if continuous {
        rows + rows / 2 + settings.padding_cells() as i32
    } else {
        rows
    };

    if reader.pages_rx.has_changed().unwrap_or(false) {
        reader.pages = reader.pages_rx.borrow_and_update().clone();
        let start = (*reader.menu.current_page().borrow()).saturating_sub(1);
        reader.pager = PagerState::new(start).with_animation(
            config.animation_frames,
            Duration::from_millis(config.frame_millis),
        );
        reader.pager.set_viewport(rows, 0, 0);
        reader.pager.set_items(vec![item_size; reader.pages.len()]);
        if continuous {
            let offset = *reader.menu.current_page_offset().borrow();
            reader.pager.scroll_to_page_offset(start, offset);
        }
        // the restored position is already known to the menu
        reader.reported_page = Some(start);
        reader.reported_offset = Some(reader.pager.current_page_offset());
    } else if (rows != reader.pager.list().viewport_size()
        || reader.pager.list().item_size(0) != Some(item_size))
        && !reader.pages.is_empty()
    {
        let page = reader.pager.current_page();
        reader.pager.set_viewport(rows, 0, 0);
        reader.pager.set_items(vec![item_size; reader.pages.len()]);
        reader.pager.scroll_to_page(page);
    }

    loop {
        let page_move = match reader.page_moves.try_recv() {
            Ok(page_move) => page_move,
            Err(TryRecvError::Lagged(skipped)) => {
                log::debug!("Skipped {} page moves", skipped);
                continue;
            }
            Err(_) => break,
        };
        match page_move.resolve(reader.pages.len()) {
            PageTarget::Index(index) => reader.pager.animate_scroll_to_page(index).await,
            PageTarget::NextChapter => {
                reader.menu.next_chapter();
            }
            PageTarget::PreviousChapter => {
                reader.menu.prev_chapter();
            }
            PageTarget::Stay => {}
        }
    }

    if !reader.pages.is_empty() {
        let page = reader.pager.current_page();
        if reader.reported_page != Some(page) {
            reader.reported_page = Some(page);
            reader.menu.progress(page + 1);
        }
        if continuous {
            let offset = reader.pager.current_page_offset();
            if reader.reported_offset != Some(offset) {
                reader.reported_offset = Some(offset);
                reader.menu.update_last_page_read_offset(offset);
            }
        }
    }

    let Some(page) = reader.current_page() else {
        return;
    };
    let key = page.key();
    if let PageStatus::Ready(bytes) = page.status()
        && !app.page_images.contains_key(&key)
        && !app.failed_images.contains_key(&key)
        && app.pending_images.insert(key)
    {
        spawn_page_decoder(key, bytes, task_tx.clone());
    }
    app.prune_page_images(key, config.look_ahead);
}

fn handle_chapter_list_input(
    app: &mut App,
    ctx: &Session,
    key: KeyCode,
    task_tx: &mpsc::UnboundedSender<BackgroundTask>,
) {
    match key {
        KeyCode::Up => {
            let selected = app.chapter_list_state.selected().unwrap_or(0);
            if selected > 0 {
                app.chapter_list_state.select(Some(selected - 1));
            }
        }
        KeyCode::Down => {
            let selected = app.chapter_list_state.selected().unwrap_or(0);
            if selected + 1 < app.chapters.len() {
                app.chapter_list_state.select(Some(selected + 1));
            }
        }
        KeyCode::Enter => {
            if let Some(index) = app.selected_chapter().map(|c| c.index) {
                open_reader(app, ctx, index);
            }
        }
        KeyCode::Char('r') => {
            app.set_loading("Refreshing chapters...");
            spawn_chapters_loader(ctx, task_tx.clone());
        }
        _ => {}
    }
}

fn handle_reader_input(
    app: &mut App,
    ctx: &Session,
    key: KeyCode,
    task_tx: &mpsc::UnboundedSender<BackgroundTask>,
) {
    let rows = app.page_rows as i32;
    let modes = app.preferences.modes();
    let Some(reader) = app.reader.as_mut() else {
        return;
    };

    if *reader.settings_open.borrow() {
        app.status_message = handle_settings_input(reader, &app.preferences, key, &modes);
        return;
    }

    let continuous = reader.menu.reader_mode_settings().continuous;
    match key {
        KeyCode::Esc => {
            if let Some(reader) = app.close_reader() {
                reader.menu.send_progress();
            }
            spawn_chapters_loader(ctx, task_tx.clone());
        }
        KeyCode::Left => reader.menu.navigate(Navigation::Left),
        KeyCode::Right => reader.menu.navigate(Navigation::Right),
        KeyCode::Up | KeyCode::Down if continuous => {
            let delta = (rows * 2 / 3).max(1);
            reader
                .pager
                .nudge(if key == KeyCode::Up { -delta } else { delta });
        }
        KeyCode::Up => reader.menu.navigate(Navigation::Prev),
        KeyCode::Down => reader.menu.navigate(Navigation::Next),
        KeyCode::Char('n') => {
            reader.menu.next_chapter();
        }
        KeyCode::Char('p') => {
            reader.menu.prev_chapter();
        }
        KeyCode::Char('m') => {
            let active = reader.menu.reader_mode();
            reader.mode_cursor = modes.iter().position(|m| *m == active).unwrap_or(0);
            reader.menu.navigate(Navigation::Menu);
        }
        KeyCode::Char('r') => {
            if reader.pages.is_empty() {
                reader.menu.reload();
            } else if let Some(page) = reader.current_page().cloned() {
                if app.failed_images.remove(&page.key()).is_none() {
                    reader.menu.retry(&page);
                }
            }
        }
        _ => {}
    }
}

/// Returns a status line for the footer when the key changed something.
fn handle_settings_input(
    reader: &mut ReaderView,
    preferences: &ReaderPreferences,
    key: KeyCode,
    modes: &[String],
) -> Option<String> {
    if matches!(key, KeyCode::Esc | KeyCode::Char('m')) {
        reader.menu.navigate(Navigation::Menu);
        return None;
    }
    let selected = modes.get(reader.mode_cursor)?.clone();
    match key {
        KeyCode::Up => {
            reader.mode_cursor = reader.mode_cursor.saturating_sub(1);
            None
        }
        KeyCode::Down => {
            if reader.mode_cursor + 1 < modes.len() {
                reader.mode_cursor += 1;
            }
            None
        }
        KeyCode::Enter => {
            reader.menu.set_manga_reader_mode(&selected);
            reader.menu.set_settings_menu_open(false);
            Some(format!("Reading this manga in {}", selected))
        }
        KeyCode::Char('d') => {
            preferences.set_mode(&selected);
            Some(format!("{} is the default mode", selected))
        }
        KeyCode::Char('a') => {
            let added = preferences.add_custom_mode();
            reader.mode_cursor = modes.len();
            Some(format!("Added {}", added))
        }
        KeyCode::Char(c) => edit_mode_setting(preferences, &selected, c),
        _ => None,
    }
}
