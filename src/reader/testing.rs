//! In-memory server used by the reader tests.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::backend::models::{
    Chapter, ChapterFlags, ChapterKey, ChapterMeta, Manga, MangaMeta, PageBytes,
};
use crate::backend::server::MangaRepository;
use crate::error::{Error, Result};

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

pub fn png(tag: u8) -> PageBytes {
    let mut bytes = PNG_SIGNATURE.to_vec();
    bytes.push(tag);
    bytes.into()
}

pub fn chapter(manga_id: i64, index: u32, pages: i32) -> Chapter {
    Chapter {
        id: manga_id * 1000 + index as i64,
        name: format!("Chapter {}", index),
        manga_id,
        index,
        read: false,
        last_page_read: 0,
        page_count: Some(pages),
        meta: ChapterMeta::default(),
    }
}

/// Polls `condition` until it holds, failing the test after a second.
pub async fn eventually(condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}

pub struct FakeRepository {
    manga: Mutex<Manga>,
    chapters: Mutex<Vec<Chapter>>,
    page_fetches: AtomicUsize,
    failing_pages: Mutex<HashSet<usize>>,
    garbage: AtomicBool,
    fail_chapter_list: AtomicBool,
    fail_writes: AtomicBool,
    rejected_writes: AtomicUsize,
    page_gate: Mutex<Option<Arc<Semaphore>>>,
    flag_gate: Mutex<Option<Arc<Semaphore>>>,
    flag_updates: Mutex<Vec<(ChapterKey, ChapterFlags)>>,
    meta_updates: Mutex<Vec<(ChapterKey, i32)>>,
}

impl FakeRepository {
    /// `chapters` lists `(index, page_count)` pairs.
    pub fn with_chapters(manga_id: i64, chapters: &[(u32, i32)]) -> Self {
        Self {
            manga: Mutex::new(Manga {
                id: manga_id,
                title: "Test Manga".to_string(),
                author: None,
                status: None,
                meta: MangaMeta::default(),
            }),
            chapters: Mutex::new(
                chapters
                    .iter()
                    .map(|&(index, pages)| chapter(manga_id, index, pages))
                    .collect(),
            ),
            page_fetches: AtomicUsize::new(0),
            failing_pages: Mutex::new(HashSet::new()),
            garbage: AtomicBool::new(false),
            fail_chapter_list: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            rejected_writes: AtomicUsize::new(0),
            page_gate: Mutex::new(None),
            flag_gate: Mutex::new(None),
            flag_updates: Mutex::new(Vec::new()),
            meta_updates: Mutex::new(Vec::new()),
        }
    }

    pub fn edit_chapter(&self, index: u32, edit: impl FnOnce(&mut Chapter)) {
        let mut chapters = self.chapters.lock().unwrap();
        if let Some(chapter) = chapters.iter_mut().find(|c| c.index == index) {
            edit(chapter);
        }
    }

    /// Page fetches block until permits are added to the returned gate.
    pub fn hold_pages(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.page_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn hold_flag_updates(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.flag_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn fail_page(&self, page: usize) {
        self.failing_pages.lock().unwrap().insert(page);
    }

    pub fn heal_page(&self, page: usize) {
        self.failing_pages.lock().unwrap().remove(&page);
    }

    pub fn serve_garbage(&self) {
        self.garbage.store(true, Ordering::SeqCst);
    }

    pub fn fail_chapter_list(&self) {
        self.fail_chapter_list.store(true, Ordering::SeqCst);
    }

    /// Flag and meta updates fail until [`FakeRepository::accept_writes`].
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn accept_writes(&self) {
        self.fail_writes.store(false, Ordering::SeqCst);
    }

    pub fn rejected_writes(&self) -> usize {
        self.rejected_writes.load(Ordering::SeqCst)
    }

    pub fn page_fetches(&self) -> usize {
        self.page_fetches.load(Ordering::SeqCst)
    }

    pub fn flag_updates(&self) -> Vec<(ChapterKey, ChapterFlags)> {
        self.flag_updates.lock().unwrap().clone()
    }

    pub fn read_marks(&self, index: u32) -> usize {
        self.flag_updates()
            .iter()
            .filter(|(key, flags)| key.index == index && flags.read == Some(true))
            .count()
    }

    pub fn meta_updates(&self) -> Vec<(ChapterKey, i32)> {
        self.meta_updates.lock().unwrap().clone()
    }

    fn reject_write(&self, url: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            self.rejected_writes.fetch_add(1, Ordering::SeqCst);
            return Err(unavailable(url));
        }
        Ok(())
    }

    fn gate(slot: &Mutex<Option<Arc<Semaphore>>>) -> Option<Arc<Semaphore>> {
        slot.lock().unwrap().clone()
    }
}

fn unavailable(url: &str) -> Error {
    Error::Status {
        status: 503,
        url: url.to_string(),
    }
}

#[async_trait]
impl MangaRepository for FakeRepository {
    async fn get_manga(&self, manga_id: i64) -> Result<Manga> {
        let manga = self.manga.lock().unwrap().clone();
        if manga.id != manga_id {
            return Err(Error::MangaNotFound(manga_id));
        }
        Ok(manga)
    }

    async fn get_chapters(&self, manga_id: i64) -> Result<Vec<Chapter>> {
        if self.fail_chapter_list.load(Ordering::SeqCst) {
            return Err(unavailable("chapters"));
        }
        let chapters = self.chapters.lock().unwrap();
        Ok(chapters
            .iter()
            .filter(|c| c.manga_id == manga_id)
            .cloned()
            .collect())
    }

    async fn get_chapter(&self, manga_id: i64, index: u32) -> Result<Chapter> {
        let chapters = self.chapters.lock().unwrap();
        chapters
            .iter()
            .find(|c| c.manga_id == manga_id && c.index == index)
            .cloned()
            .ok_or(Error::ChapterNotFound(ChapterKey { manga_id, index }))
    }

    async fn get_chapter_page(&self, chapter: &Chapter, page: usize) -> Result<PageBytes> {
        self.page_fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = Self::gate(&self.page_gate) {
            let _permit = gate.acquire().await;
        }
        if self.failing_pages.lock().unwrap().contains(&page) {
            return Err(unavailable("page"));
        }
        if self.garbage.load(Ordering::SeqCst) {
            return Ok(PageBytes::from(&b"<html>oops</html>"[..]));
        }
        Ok(png((chapter.index as usize * 100 + page) as u8))
    }

    async fn update_chapter_flags(&self, chapter: &Chapter, flags: ChapterFlags) -> Result<()> {
        if let Some(gate) = Self::gate(&self.flag_gate) {
            let _permit = gate.acquire().await;
        }
        self.reject_write("flags")?;
        self.flag_updates
            .lock()
            .unwrap()
            .push((chapter.key(), flags));
        Ok(())
    }

    async fn update_chapter_meta(&self, chapter: &Chapter, page_offset: i32) -> Result<()> {
        self.reject_write("meta")?;
        self.meta_updates
            .lock()
            .unwrap()
            .push((chapter.key(), page_offset));
        Ok(())
    }

    async fn update_manga_meta(&self, manga: &Manga, reader_mode: &str) -> Result<()> {
        let mut stored = self.manga.lock().unwrap();
        if stored.id != manga.id {
            return Err(Error::MangaNotFound(manga.id));
        }
        stored.meta.reader_mode = reader_mode.to_string();
        Ok(())
    }
}
