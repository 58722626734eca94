//! The reader screen's orchestrator.
//!
//! [`ReaderMenu`] owns the chapter being read and its neighbours, turns
//! navigation intents into [`PageMove`] events for the pager, and reports
//! reading progress back to the server. Page numbers here are 1-based.

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::chapter::{ReaderChapter, ViewerChapters};
use super::loader::{ChapterLoader, PageList, PagesState, ReaderPage};
use super::model::{MoveTo, Navigation, PageMove};
use super::scope::TaskScope;
use super::state::{ReaderState, ReaderStateMachine, Transition};
use crate::backend::cache::PageCache;
use crate::backend::models::{Chapter, ChapterFlags, Manga, DEFAULT_READER_MODE};
use crate::backend::preferences::{Direction, ReaderModeSettings, ReaderPreferences};
use crate::backend::server::MangaRepository;
use crate::config::ReaderConfig;

const PAGE_MOVE_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderMenuParams {
    pub manga_id: i64,
    pub chapter_index: u32,
}

pub struct ReaderMenu {
    inner: Arc<MenuInner>,
}

struct MenuInner {
    params: ReaderMenuParams,
    repository: Arc<dyn MangaRepository>,
    preferences: ReaderPreferences,
    loader: ChapterLoader,
    look_ahead: usize,
    scope: TaskScope,
    background: TaskScope,
    manga: watch::Sender<Option<Manga>>,
    viewer: ViewerChapters,
    state: ReaderStateMachine,
    pages: watch::Sender<PageList>,
    current_page: watch::Sender<usize>,
    current_page_offset: watch::Sender<i32>,
    settings_menu_open: watch::Sender<bool>,
    page_moves: broadcast::Sender<PageMove>,
}

fn empty_pages() -> PageList {
    Arc::from(Vec::<Arc<ReaderPage>>::new())
}

impl ReaderMenu {
    /// Creates the orchestrator and starts loading the manga and chapter.
    ///
    /// `background` runs progress writes. It is expected to outlive the
    /// menu, so a write issued while the screen closes still reaches the
    /// server.
    pub fn new(
        params: ReaderMenuParams,
        repository: Arc<dyn MangaRepository>,
        preferences: ReaderPreferences,
        cache: PageCache,
        config: &ReaderConfig,
        background: TaskScope,
    ) -> Self {
        let (page_moves, _) = broadcast::channel(PAGE_MOVE_BUFFER);
        let loader = ChapterLoader::new(
            Arc::clone(&repository),
            cache,
            config.max_concurrent_pages,
        );
        let menu = Self {
            inner: Arc::new(MenuInner {
                params,
                repository,
                preferences,
                loader,
                look_ahead: config.look_ahead,
                scope: TaskScope::new(format!("reader {}", params.manga_id)),
                background,
                manga: watch::Sender::new(None),
                viewer: ViewerChapters::new(),
                state: ReaderStateMachine::new(),
                pages: watch::Sender::new(empty_pages()),
                current_page: watch::Sender::new(1),
                current_page_offset: watch::Sender::new(0),
                settings_menu_open: watch::Sender::new(false),
                page_moves,
            }),
        };
        menu.init();
        menu
    }

    /// (Re)loads the manga and the requested chapter.
    pub fn init(&self) -> JoinHandle<Option<()>> {
        let inner = Arc::clone(&self.inner);
        self.inner.scope.spawn(async move {
            inner.state.reset();
            if inner.init_manga().await {
                inner.init_chapters(inner.params.chapter_index).await;
            }
        })
    }

    /// Retries the page list of a chapter that failed to load, or starts
    /// over when no chapter got that far.
    pub fn reload(&self) {
        let failed = self
            .inner
            .viewer
            .current()
            .filter(|chapter| chapter.page_loader().is_some_and(|loader| loader.failed()));
        match failed {
            Some(chapter) => {
                self.inner.loader.load_chapter(&chapter);
            }
            None => {
                self.init();
            }
        }
    }

    pub fn params(&self) -> ReaderMenuParams {
        self.inner.params
    }

    pub fn state(&self) -> watch::Receiver<ReaderState> {
        self.inner.state.subscribe()
    }

    pub fn state_transitions(&self) -> broadcast::Receiver<Transition> {
        self.inner.state.transitions()
    }

    pub fn manga(&self) -> watch::Receiver<Option<Manga>> {
        self.inner.manga.subscribe()
    }

    pub fn pages(&self) -> watch::Receiver<PageList> {
        self.inner.pages.subscribe()
    }

    pub fn current_page(&self) -> watch::Receiver<usize> {
        self.inner.current_page.subscribe()
    }

    pub fn current_page_offset(&self) -> watch::Receiver<i32> {
        self.inner.current_page_offset.subscribe()
    }

    pub fn settings_menu_open(&self) -> watch::Receiver<bool> {
        self.inner.settings_menu_open.subscribe()
    }

    pub fn page_moves(&self) -> broadcast::Receiver<PageMove> {
        self.inner.page_moves.subscribe()
    }

    pub fn chapter(&self) -> watch::Receiver<Option<Arc<ReaderChapter>>> {
        self.inner.viewer.subscribe_current()
    }

    pub fn previous_chapter(&self) -> watch::Receiver<Option<Arc<ReaderChapter>>> {
        self.inner.viewer.subscribe_previous()
    }

    pub fn next_chapter_slot(&self) -> watch::Receiver<Option<Arc<ReaderChapter>>> {
        self.inner.viewer.subscribe_next()
    }

    pub fn reader_mode(&self) -> String {
        self.inner.reader_mode()
    }

    pub fn reader_mode_settings(&self) -> ReaderModeSettings {
        self.inner
            .preferences
            .mode_settings(&self.inner.reader_mode())
    }

    pub fn navigate(&self, navigation: Navigation) {
        let direction = self.reader_mode_settings().direction;
        let move_to = match navigation {
            Navigation::Menu => {
                let open = *self.inner.settings_menu_open.borrow();
                self.set_settings_menu_open(!open);
                None
            }
            Navigation::Next => Some(MoveTo::Next),
            Navigation::Prev => Some(MoveTo::Previous),
            Navigation::Right => Some(match direction {
                Direction::Left => MoveTo::Previous,
                _ => MoveTo::Next,
            }),
            Navigation::Left => Some(match direction {
                Direction::Left => MoveTo::Next,
                _ => MoveTo::Previous,
            }),
        };
        if let Some(to) = move_to {
            let from = *self.inner.current_page.borrow();
            log::debug!("Navigate {:?} from {}", to, from);
            let _ = self.inner.page_moves.send(PageMove::Direction { to, from });
        }
    }

    pub fn navigate_to_page(&self, page: usize) {
        log::info!("Navigate to {}", page);
        let _ = self.inner.page_moves.send(PageMove::Page(page));
    }

    /// Reports the page the pager settled on.
    pub fn progress(&self, page: usize) {
        log::info!("Progressed to {}", page);
        self.inner.current_page.send_replace(page);
        self.inner.on_page_changed(page);
    }

    pub fn retry(&self, page: &Arc<ReaderPage>) -> bool {
        log::info!("Retrying page {} of {}", page.index, page.chapter);
        match self.inner.viewer.current() {
            Some(chapter) => chapter
                .page_loader()
                .is_some_and(|loader| loader.retry_page(page)),
            None => false,
        }
    }

    pub fn set_settings_menu_open(&self, open: bool) {
        self.inner.settings_menu_open.send_replace(open);
    }

    pub fn set_manga_reader_mode(&self, mode: &str) -> JoinHandle<Option<()>> {
        let inner = Arc::clone(&self.inner);
        let mode = mode.to_string();
        self.inner.scope.spawn(async move {
            let manga = inner.manga.borrow().clone();
            if let Some(manga) = manga {
                if let Err(e) = inner.repository.update_manga_meta(&manga, &mode).await {
                    log::warn!("Error saving reader mode {} for manga {}: {}", mode, manga.id, e);
                }
            }
            inner.init_manga().await;
        })
    }

    pub fn prev_chapter(&self) -> JoinHandle<Option<()>> {
        let inner = Arc::clone(&self.inner);
        self.inner.scope.spawn(async move {
            let Some(prev) = inner.viewer.previous() else {
                return;
            };
            inner.switch_chapter(prev.chapter.index).await;
        })
    }

    pub fn next_chapter(&self) -> JoinHandle<Option<()>> {
        let inner = Arc::clone(&self.inner);
        self.inner.scope.spawn(async move {
            // moving on from the last page finishes the chapter
            let page = *inner.current_page.borrow();
            inner.mark_read_on_last_page(page);
            let Some(next) = inner.viewer.next() else {
                return;
            };
            inner.switch_chapter(next.chapter.index).await;
        })
    }

    /// Saves the last page read of the current chapter in the background.
    pub fn send_progress(&self) {
        self.inner.send_progress();
    }

    pub fn update_last_page_read_offset(&self, offset: i32) {
        self.inner.current_page_offset.send_replace(offset);
        let Some(chapter) = self.inner.viewer.current() else {
            return;
        };
        let repository = Arc::clone(&self.inner.repository);
        let chapter = chapter.chapter.clone();
        self.inner.background.spawn(async move {
            if let Err(e) = repository.update_chapter_meta(&chapter, offset).await {
                log::warn!("Error saving page offset of chapter {}: {}", chapter.key(), e);
            }
        });
    }

    /// Stops everything tied to this screen. Background writes keep going.
    pub fn dispose(&self) {
        self.inner.viewer.recycle();
        self.inner.scope.cancel();
    }
}

impl Drop for ReaderMenu {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl MenuInner {
    fn reader_mode(&self) -> String {
        let manga_mode = self
            .manga
            .borrow()
            .as_ref()
            .map(|manga| manga.meta.reader_mode.clone())
            .filter(|mode| mode != DEFAULT_READER_MODE && self.preferences.has_mode(mode));
        manga_mode.unwrap_or_else(|| self.preferences.mode())
    }

    async fn init_manga(&self) -> bool {
        match self.repository.get_manga(self.params.manga_id).await {
            Ok(manga) => {
                self.manga.send_replace(Some(manga));
                true
            }
            Err(e) => {
                log::warn!("Error loading manga {}: {}", self.params.manga_id, e);
                self.state.start_loading();
                self.state.fail(Arc::new(e));
                false
            }
        }
    }

    async fn switch_chapter(self: &Arc<Self>, chapter_index: u32) {
        log::info!("Switching to chapter {}", chapter_index);
        self.state.reset();
        self.send_progress();
        self.init_chapters(chapter_index).await;
    }

    fn reset_values(&self) {
        self.viewer.recycle();
        self.pages.send_replace(empty_pages());
        self.current_page.send_replace(1);
        self.current_page_offset.send_replace(0);
    }

    async fn init_chapters(self: &Arc<Self>, chapter_index: u32) {
        self.reset_values();
        self.state.start_loading();

        let manga_id = self.params.manga_id;
        let chapter = match self.repository.get_chapter(manga_id, chapter_index).await {
            Ok(chapter) => chapter,
            Err(e) => {
                log::warn!("Error getting chapter {} of manga {}: {}", chapter_index, manga_id, e);
                self.state.fail(Arc::new(e));
                return;
            }
        };
        let chapter = ReaderChapter::new(chapter, &self.scope);

        // mirror the chapter's lifecycle before its loader can move it
        let mut transitions = chapter.state().transitions();
        let inner = Arc::clone(self);
        chapter.scope().spawn(async move {
            while let Ok(transition) = transitions.recv().await {
                inner.state.transition(transition.to);
            }
        });

        let mut pages = self.loader.load_chapter(&chapter);
        self.viewer.set_current(Arc::clone(&chapter));

        let inner = Arc::clone(self);
        self.scope
            .spawn(async move { inner.load_neighbours(manga_id, chapter_index).await });

        let last_page_read = chapter.chapter.last_page_read as usize;
        if last_page_read != 0 {
            let page = match chapter.chapter.page_count() {
                Some(count) => last_page_read.min(count),
                None => last_page_read,
            };
            self.current_page.send_replace(page);
        }
        let offset = chapter.chapter.meta.page_offset;
        if offset != 0 {
            self.current_page_offset.send_replace(offset);
        }

        let inner = Arc::clone(self);
        chapter.scope().spawn(async move {
            let loaded = pages
                .wait_for(|state| matches!(state, PagesState::Success(_)))
                .await
                .map(|state| state.clone());
            if let Ok(PagesState::Success(list)) = loaded {
                inner.pages.send_replace(list);
                let page = *inner.current_page.borrow();
                if let Some((chapter, _)) = inner.current_pages() {
                    inner.load_around(&chapter, page);
                }
            }
        });
    }

    async fn load_neighbours(self: &Arc<Self>, manga_id: i64, chapter_index: u32) {
        let chapters = match self.repository.get_chapters(manga_id).await {
            Ok(chapters) => chapters,
            Err(e) => {
                log::warn!("Error getting chapter list of manga {}: {}", manga_id, e);
                Vec::new()
            }
        };

        let find = |index: Option<u32>| -> Option<Chapter> {
            let index = index?;
            chapters.iter().find(|c| c.index == index).cloned()
        };
        if let Some(next) = find(chapter_index.checked_add(1)) {
            self.viewer
                .prefetch_next(ReaderChapter::new(next, &self.scope));
        }
        if let Some(prev) = find(chapter_index.checked_sub(1)) {
            self.viewer
                .prefetch_previous(ReaderChapter::new(prev, &self.scope));
        }
    }

    /// The current chapter with its page list, once that list is published.
    fn current_pages(&self) -> Option<(Arc<ReaderChapter>, PageList)> {
        let chapter = self.viewer.current()?;
        let pages = self.pages.borrow().clone();
        if pages.first().is_none_or(|p| p.chapter != chapter.key()) {
            return None;
        }
        Some((chapter, pages))
    }

    fn load_around(&self, chapter: &ReaderChapter, page: usize) {
        if let Some(loader) = chapter.page_loader() {
            loader.load_around(page.saturating_sub(1), self.look_ahead);
        }
    }

    fn on_page_changed(&self, page: usize) {
        if let Some((chapter, _)) = self.current_pages() {
            self.load_around(&chapter, page);
        }
        self.mark_read_on_last_page(page);
    }

    fn mark_read_on_last_page(&self, page: usize) {
        let Some((chapter, pages)) = self.current_pages() else {
            return;
        };
        if page == pages.len() && chapter.mark_read_once() {
            self.mark_chapter_read(&chapter);
        }
    }

    fn mark_chapter_read(&self, chapter: &ReaderChapter) {
        log::info!("Marking chapter {} read", chapter.key());
        let repository = Arc::clone(&self.repository);
        let chapter = chapter.chapter.clone();
        self.scope.spawn(async move {
            if let Err(e) = repository
                .update_chapter_flags(&chapter, ChapterFlags::read())
                .await
            {
                log::warn!("Error marking chapter {} read: {}", chapter.key(), e);
            }
        });
    }

    fn send_progress(&self) {
        let Some(chapter) = self.viewer.current() else {
            return;
        };
        if chapter.chapter.read {
            return;
        }
        let page = *self.current_page.borrow() as u32;
        let repository = Arc::clone(&self.repository);
        let chapter = chapter.chapter.clone();
        self.background.spawn(async move {
            if let Err(e) = repository
                .update_chapter_flags(&chapter, ChapterFlags::last_page_read(page))
                .await
            {
                log::warn!("Error saving progress of chapter {}: {}", chapter.key(), e);
            }
        });
    }
}
