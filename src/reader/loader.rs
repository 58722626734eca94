use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};

use super::chapter::ReaderChapter;
use super::scope::TaskScope;
use super::state::ReaderStateMachine;
use crate::backend::cache::{PageCache, PageKey};
use crate::backend::models::{Chapter, ChapterKey, PageBytes};
use crate::backend::server::MangaRepository;
use crate::error::{Error, Result};

#[derive(Clone)]
pub enum PageStatus {
    Queued,
    Loading,
    Ready(PageBytes),
    Error(Arc<Error>),
}

impl fmt::Debug for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageStatus::Queued => f.write_str("Queued"),
            PageStatus::Loading => f.write_str("Loading"),
            PageStatus::Ready(bytes) => write!(f, "Ready({} bytes)", bytes.len()),
            PageStatus::Error(e) => write!(f, "Error({})", e),
        }
    }
}

impl PageStatus {
    pub fn bytes(&self) -> Option<&PageBytes> {
        match self {
            PageStatus::Ready(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// One page of a chapter. Its status is only written by the chapter's loader.
#[derive(Debug)]
pub struct ReaderPage {
    pub chapter: ChapterKey,
    pub index: usize,
    status: watch::Sender<PageStatus>,
}

impl ReaderPage {
    fn new(chapter: ChapterKey, index: usize) -> Arc<Self> {
        Arc::new(Self {
            chapter,
            index,
            status: watch::Sender::new(PageStatus::Queued),
        })
    }

    pub fn key(&self) -> PageKey {
        PageKey::new(self.chapter, self.index)
    }

    pub fn status(&self) -> PageStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PageStatus> {
        self.status.subscribe()
    }

    /// Claims the page for a fetch. Only one caller wins.
    fn begin_load(&self) -> bool {
        self.status.send_if_modified(|status| {
            if matches!(status, PageStatus::Queued) {
                *status = PageStatus::Loading;
                true
            } else {
                false
            }
        })
    }

    fn requeue_failed(&self) -> bool {
        self.status.send_if_modified(|status| {
            if matches!(status, PageStatus::Error(_)) {
                *status = PageStatus::Queued;
                true
            } else {
                false
            }
        })
    }

    fn set_status(&self, status: PageStatus) {
        self.status.send_replace(status);
    }
}

pub type PageList = Arc<[Arc<ReaderPage>]>;

#[derive(Debug, Clone)]
pub enum PagesState {
    Queue,
    Success(PageList),
    Error(Arc<Error>),
}

/// Hands out a [`PageLoader`] per chapter. All loaders share the cache and
/// the bound on concurrent page downloads.
#[derive(Clone)]
pub struct ChapterLoader {
    repository: Arc<dyn MangaRepository>,
    cache: PageCache,
    fetch_limit: Arc<Semaphore>,
}

impl ChapterLoader {
    pub fn new(repository: Arc<dyn MangaRepository>, cache: PageCache, max_concurrent: usize) -> Self {
        Self {
            repository,
            cache,
            fetch_limit: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    /// Attaches a loader to `chapter` on first use and starts resolving its
    /// page list. Later calls reuse the attached loader and retry a failed list.
    pub fn load_chapter(&self, chapter: &ReaderChapter) -> watch::Receiver<PagesState> {
        if let Some(loader) = chapter.page_loader() {
            loader.restart();
            return loader.pages();
        }

        let loader = chapter.attach_loader(Arc::new(PageLoader {
            chapter: chapter.chapter.clone(),
            repository: Arc::clone(&self.repository),
            cache: self.cache.clone(),
            scope: chapter.scope().clone(),
            state: Arc::clone(chapter.state()),
            fetch_limit: Arc::clone(&self.fetch_limit),
            pages: watch::Sender::new(PagesState::Queue),
        }));
        loader.start();
        loader.pages()
    }
}

pub struct PageLoader {
    chapter: Chapter,
    repository: Arc<dyn MangaRepository>,
    cache: PageCache,
    scope: TaskScope,
    state: Arc<ReaderStateMachine>,
    fetch_limit: Arc<Semaphore>,
    pages: watch::Sender<PagesState>,
}

impl PageLoader {
    pub fn pages(&self) -> watch::Receiver<PagesState> {
        self.pages.subscribe()
    }

    pub fn page_list(&self) -> Option<PageList> {
        match &*self.pages.borrow() {
            PagesState::Success(pages) => Some(Arc::clone(pages)),
            _ => None,
        }
    }

    pub fn page(&self, index: usize) -> Option<Arc<ReaderPage>> {
        self.page_list()?.get(index).cloned()
    }

    fn start(self: &Arc<Self>) {
        let loader = Arc::clone(self);
        self.scope.spawn(async move { loader.resolve().await });
    }

    pub fn failed(&self) -> bool {
        matches!(*self.pages.borrow(), PagesState::Error(_))
    }

    /// Re-resolves the page list after a failure.
    pub fn restart(self: &Arc<Self>) {
        if !self.failed() {
            return;
        }
        log::info!("Reloading pages of chapter {}", self.chapter.key());
        self.state.reset();
        self.pages.send_replace(PagesState::Queue);
        self.start();
    }

    async fn resolve(&self) {
        self.state.start_loading();
        match self.fetch_page_list().await {
            Ok(pages) => {
                log::info!("Chapter {} has {} pages", self.chapter.key(), pages.len());
                self.pages.send_replace(PagesState::Success(pages));
                self.state.finish_loading();
            }
            Err(e) => {
                log::warn!("Error loading pages of chapter {}: {}", self.chapter.key(), e);
                let e = Arc::new(e);
                self.pages.send_replace(PagesState::Error(Arc::clone(&e)));
                self.state.fail(e);
            }
        }
    }

    async fn fetch_page_list(&self) -> Result<PageList> {
        let key = self.chapter.key();
        let count = match self.chapter.page_count() {
            Some(count) => count,
            None => self
                .repository
                .get_chapter(key.manga_id, key.index)
                .await?
                .page_count()
                .ok_or(Error::NoPages(key))?,
        };
        Ok((0..count).map(|index| ReaderPage::new(key, index)).collect())
    }

    /// Starts downloading `page` unless it is already loading or loaded.
    pub fn load_page(self: &Arc<Self>, page: &Arc<ReaderPage>) -> bool {
        if !page.begin_load() {
            return false;
        }
        let loader = Arc::clone(self);
        let page = Arc::clone(page);
        self.scope.spawn(async move { loader.fetch(&page).await });
        true
    }

    /// Loads the page at `index` plus `look_ahead` pages after it.
    pub fn load_around(self: &Arc<Self>, index: usize, look_ahead: usize) {
        let Some(pages) = self.page_list() else {
            return;
        };
        for page in pages.iter().skip(index).take(look_ahead + 1) {
            self.load_page(page);
        }
    }

    pub fn retry_page(self: &Arc<Self>, page: &Arc<ReaderPage>) -> bool {
        if !page.requeue_failed() {
            return false;
        }
        log::info!("Retrying page {} of chapter {}", page.index, page.chapter);
        self.load_page(page)
    }

    async fn fetch(&self, page: &ReaderPage) {
        let key = page.key();
        if let Some(bytes) = self.cache.get_page(&key).await {
            page.set_status(PageStatus::Ready(bytes));
            return;
        }

        let result = {
            let Ok(_permit) = self.fetch_limit.acquire().await else {
                return;
            };
            self.repository.get_chapter_page(&self.chapter, page.index).await
        };
        let result = result.and_then(|bytes| check_image(key, bytes));

        // a recycled chapter keeps nothing it was still downloading
        if self.scope.is_cancelled() {
            log::debug!("Dropping page {} of recycled chapter {}", page.index, page.chapter);
            return;
        }

        match result {
            Ok(bytes) => {
                self.cache.insert_page(key, bytes.clone()).await;
                page.set_status(PageStatus::Ready(bytes));
            }
            Err(e) => {
                log::warn!("Failed to load page {} of chapter {}: {}", page.index, page.chapter, e);
                page.set_status(PageStatus::Error(Arc::new(e)));
            }
        }
    }
}

fn check_image(key: PageKey, bytes: PageBytes) -> Result<PageBytes> {
    match image::guess_format(&bytes) {
        Ok(_) => Ok(bytes),
        Err(_) => Err(Error::NotAnImage {
            chapter: key.chapter,
            page: key.page,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::testing::{chapter, eventually, png, FakeRepository};
    use std::time::Duration;

    fn setup(repo: &Arc<FakeRepository>) -> (ChapterLoader, TaskScope) {
        let loader = ChapterLoader::new(repo.clone(), PageCache::new(32, 1 << 20), 3);
        (loader, TaskScope::new("test"))
    }

    async fn loaded_pages(rx: &mut watch::Receiver<PagesState>) -> PageList {
        let state = tokio::time::timeout(
            Duration::from_secs(1),
            rx.wait_for(|s| !matches!(s, PagesState::Queue)),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        match state {
            PagesState::Success(pages) => pages,
            other => panic!("expected pages, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn resolves_page_list_and_state() {
        let repo = Arc::new(FakeRepository::with_chapters(1, &[(1, 5)]));
        let (loader, scope) = setup(&repo);
        let reader_chapter = ReaderChapter::new(chapter(1, 1, 5), &scope);

        let mut rx = loader.load_chapter(&reader_chapter);
        let pages = loaded_pages(&mut rx).await;
        assert_eq!(pages.len(), 5);
        assert_eq!(pages[4].index, 4);
        eventually(|| reader_chapter.state().phase() == crate::reader::state::ReaderPhase::Loaded).await;
    }

    #[tokio::test]
    async fn unknown_page_count_asks_the_server() {
        let repo = Arc::new(FakeRepository::with_chapters(1, &[(2, 7)]));
        let (loader, scope) = setup(&repo);
        let mut unresolved = chapter(1, 2, 0);
        unresolved.page_count = Some(-1);
        let reader_chapter = ReaderChapter::new(unresolved, &scope);

        let pages = loaded_pages(&mut loader.load_chapter(&reader_chapter)).await;
        assert_eq!(pages.len(), 7);
    }

    #[tokio::test]
    async fn missing_chapter_ends_in_error() {
        let repo = Arc::new(FakeRepository::with_chapters(1, &[]));
        let (loader, scope) = setup(&repo);
        let reader_chapter = ReaderChapter::new(chapter(1, 9, 0), &scope);

        let mut rx = loader.load_chapter(&reader_chapter);
        rx.wait_for(|s| matches!(s, PagesState::Error(_))).await.unwrap();
        eventually(|| reader_chapter.state().phase() == crate::reader::state::ReaderPhase::Error).await;
    }

    #[tokio::test]
    async fn load_page_is_idempotent() {
        let repo = Arc::new(FakeRepository::with_chapters(1, &[(1, 3)]));
        let gate = repo.hold_pages();
        let (loader, scope) = setup(&repo);
        let reader_chapter = ReaderChapter::new(chapter(1, 1, 3), &scope);
        let pages = loaded_pages(&mut loader.load_chapter(&reader_chapter)).await;
        let page_loader = reader_chapter.page_loader().unwrap();

        assert!(page_loader.load_page(&pages[0]));
        assert!(!page_loader.load_page(&pages[0]));
        eventually(|| repo.page_fetches() == 1).await;
        gate.add_permits(10);

        let mut status = pages[0].subscribe();
        status.wait_for(|s| matches!(s, PageStatus::Ready(_))).await.unwrap();
        assert!(!page_loader.load_page(&pages[0]));
        assert_eq!(repo.page_fetches(), 1);
        assert!(loader.cache().has_page(&pages[0].key()).await);
    }

    #[tokio::test]
    async fn cached_pages_skip_the_network() {
        let repo = Arc::new(FakeRepository::with_chapters(1, &[(1, 2)]));
        let (loader, scope) = setup(&repo);
        let reader_chapter = ReaderChapter::new(chapter(1, 1, 2), &scope);
        let pages = loaded_pages(&mut loader.load_chapter(&reader_chapter)).await;
        loader.cache().insert_page(pages[1].key(), png(1)).await;

        reader_chapter.page_loader().unwrap().load_page(&pages[1]);
        let mut status = pages[1].subscribe();
        status.wait_for(|s| matches!(s, PageStatus::Ready(_))).await.unwrap();
        assert_eq!(repo.page_fetches(), 0);
    }

    #[tokio::test]
    async fn failed_page_does_not_affect_siblings_and_can_retry() {
        let repo = Arc::new(FakeRepository::with_chapters(1, &[(1, 3)]));
        repo.fail_page(1);
        let (loader, scope) = setup(&repo);
        let reader_chapter = ReaderChapter::new(chapter(1, 1, 3), &scope);
        let pages = loaded_pages(&mut loader.load_chapter(&reader_chapter)).await;
        let page_loader = reader_chapter.page_loader().unwrap();

        page_loader.load_around(0, 2);
        let mut failed = pages[1].subscribe();
        failed.wait_for(|s| matches!(s, PageStatus::Error(_))).await.unwrap();
        for index in [0, 2] {
            let mut ok = pages[index].subscribe();
            ok.wait_for(|s| matches!(s, PageStatus::Ready(_))).await.unwrap();
        }
        assert_eq!(
            reader_chapter.state().phase(),
            crate::reader::state::ReaderPhase::Loaded
        );

        // only failed pages can be retried
        assert!(!page_loader.retry_page(&pages[0]));
        repo.heal_page(1);
        assert!(page_loader.retry_page(&pages[1]));
        failed.wait_for(|s| matches!(s, PageStatus::Ready(_))).await.unwrap();
        assert_eq!(repo.page_fetches(), 4);
    }

    #[tokio::test]
    async fn non_image_payload_is_a_page_error() {
        let repo = Arc::new(FakeRepository::with_chapters(1, &[(1, 1)]));
        repo.serve_garbage();
        let (loader, scope) = setup(&repo);
        let reader_chapter = ReaderChapter::new(chapter(1, 1, 1), &scope);
        let pages = loaded_pages(&mut loader.load_chapter(&reader_chapter)).await;

        reader_chapter.page_loader().unwrap().load_page(&pages[0]);
        let mut status = pages[0].subscribe();
        status.wait_for(|s| matches!(s, PageStatus::Error(_))).await.unwrap();
        assert!(!loader.cache().has_page(&pages[0].key()).await);
    }

    #[tokio::test]
    async fn recycled_chapter_writes_nothing_to_cache() {
        let repo = Arc::new(FakeRepository::with_chapters(1, &[(1, 5)]));
        let gate = repo.hold_pages();
        let (loader, scope) = setup(&repo);
        let reader_chapter = ReaderChapter::new(chapter(1, 1, 5), &scope);
        let pages = loaded_pages(&mut loader.load_chapter(&reader_chapter)).await;

        reader_chapter.page_loader().unwrap().load_around(0, 2);
        eventually(|| repo.page_fetches() == 3).await;

        reader_chapter.recycle();
        gate.add_permits(10);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(loader.cache().chapter_pages(reader_chapter.key()).await, 0);
        assert!(pages.iter().all(|p| p.status().bytes().is_none()));
    }
}
