use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;

use super::loader::PageLoader;
use super::scope::TaskScope;
use super::state::ReaderStateMachine;
use crate::backend::models::{Chapter, ChapterKey};

/// A chapter opened in the reader, with its own task group and lifecycle.
///
/// Dropping or recycling it cancels every page download it started.
pub struct ReaderChapter {
    pub chapter: Chapter,
    scope: TaskScope,
    state: Arc<ReaderStateMachine>,
    page_loader: OnceLock<Arc<PageLoader>>,
    marked_read: AtomicBool,
}

impl ReaderChapter {
    pub fn new(chapter: Chapter, parent: &TaskScope) -> Arc<Self> {
        let scope = parent.child(format!("chapter {}", chapter.key()));
        Arc::new(Self {
            chapter,
            scope,
            state: Arc::new(ReaderStateMachine::new()),
            page_loader: OnceLock::new(),
            marked_read: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> ChapterKey {
        self.chapter.key()
    }

    pub fn scope(&self) -> &TaskScope {
        &self.scope
    }

    pub fn state(&self) -> &Arc<ReaderStateMachine> {
        &self.state
    }

    pub fn page_loader(&self) -> Option<&Arc<PageLoader>> {
        self.page_loader.get()
    }

    pub(crate) fn attach_loader(&self, loader: Arc<PageLoader>) -> Arc<PageLoader> {
        Arc::clone(self.page_loader.get_or_init(|| loader))
    }

    pub fn recycle(&self) {
        self.scope.cancel();
    }

    pub fn is_recycled(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// True the first time it is called for a chapter the server has not
    /// already marked read.
    pub fn mark_read_once(&self) -> bool {
        !self.chapter.read && !self.marked_read.swap(true, Ordering::SeqCst)
    }
}

impl Drop for ReaderChapter {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

type Slot = watch::Sender<Option<Arc<ReaderChapter>>>;

/// Previous, current and next chapter. Each slot is swapped in one step, so
/// an observer sees either the old chapter or the new one, never a mix.
pub struct ViewerChapters {
    prev: Slot,
    curr: Slot,
    next: Slot,
}

fn replace(slot: &Slot, chapter: Option<Arc<ReaderChapter>>) {
    let incoming = chapter.clone();
    let old = slot.send_replace(chapter);
    if let Some(old) = old {
        let same = incoming.is_some_and(|new| Arc::ptr_eq(&new, &old));
        if !same {
            old.recycle();
        }
    }
}

impl ViewerChapters {
    pub fn new() -> Self {
        Self {
            prev: watch::Sender::new(None),
            curr: watch::Sender::new(None),
            next: watch::Sender::new(None),
        }
    }

    pub fn current(&self) -> Option<Arc<ReaderChapter>> {
        self.curr.borrow().clone()
    }

    pub fn previous(&self) -> Option<Arc<ReaderChapter>> {
        self.prev.borrow().clone()
    }

    pub fn next(&self) -> Option<Arc<ReaderChapter>> {
        self.next.borrow().clone()
    }

    pub fn subscribe_current(&self) -> watch::Receiver<Option<Arc<ReaderChapter>>> {
        self.curr.subscribe()
    }

    pub fn subscribe_previous(&self) -> watch::Receiver<Option<Arc<ReaderChapter>>> {
        self.prev.subscribe()
    }

    pub fn subscribe_next(&self) -> watch::Receiver<Option<Arc<ReaderChapter>>> {
        self.next.subscribe()
    }

    pub fn set_current(&self, chapter: Arc<ReaderChapter>) {
        replace(&self.curr, Some(chapter));
    }

    pub fn prefetch_next(&self, chapter: Arc<ReaderChapter>) {
        replace(&self.next, Some(chapter));
    }

    pub fn prefetch_previous(&self, chapter: Arc<ReaderChapter>) {
        replace(&self.prev, Some(chapter));
    }

    pub fn recycle(&self) {
        for slot in [&self.prev, &self.curr, &self.next] {
            replace(slot, None);
        }
    }
}

impl Default for ViewerChapters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::testing::chapter;

    #[test]
    fn set_current_recycles_the_previous_current() {
        let scope = TaskScope::new("test");
        let viewer = ViewerChapters::new();
        let first = ReaderChapter::new(chapter(1, 1, 10), &scope);
        let second = ReaderChapter::new(chapter(1, 2, 10), &scope);

        viewer.set_current(Arc::clone(&first));
        viewer.set_current(Arc::clone(&first));
        assert!(!first.is_recycled());

        viewer.set_current(Arc::clone(&second));
        assert!(first.is_recycled());
        assert!(!second.is_recycled());
        assert_eq!(viewer.current().unwrap().key(), second.key());
    }

    #[test]
    fn prefetch_leaves_current_alone() {
        let scope = TaskScope::new("test");
        let viewer = ViewerChapters::new();
        let current = ReaderChapter::new(chapter(1, 2, 10), &scope);
        viewer.set_current(Arc::clone(&current));
        viewer.prefetch_next(ReaderChapter::new(chapter(1, 3, 10), &scope));
        viewer.prefetch_previous(ReaderChapter::new(chapter(1, 1, 10), &scope));

        assert_eq!(viewer.current().unwrap().key().index, 2);
        assert_eq!(viewer.next().unwrap().key().index, 3);
        assert_eq!(viewer.previous().unwrap().key().index, 1);
        assert!(!current.is_recycled());
    }

    #[test]
    fn recycle_clears_every_slot() {
        let scope = TaskScope::new("test");
        let viewer = ViewerChapters::new();
        let current = ReaderChapter::new(chapter(1, 2, 10), &scope);
        let next = ReaderChapter::new(chapter(1, 3, 10), &scope);
        viewer.set_current(Arc::clone(&current));
        viewer.prefetch_next(Arc::clone(&next));

        viewer.recycle();
        assert!(viewer.current().is_none());
        assert!(viewer.next().is_none());
        assert!(current.is_recycled());
        assert!(next.is_recycled());
    }

    #[test]
    fn mark_read_fires_once() {
        let scope = TaskScope::new("test");
        let unread = ReaderChapter::new(chapter(1, 1, 10), &scope);
        assert!(unread.mark_read_once());
        assert!(!unread.mark_read_once());

        let mut read = chapter(1, 2, 10);
        read.read = true;
        assert!(!ReaderChapter::new(read, &scope).mark_read_once());
    }
}
