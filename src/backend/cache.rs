use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::models::{ChapterKey, PageBytes};
use crate::config::CacheConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub chapter: ChapterKey,
    pub page: usize,
}

impl PageKey {
    pub fn new(chapter: ChapterKey, page: usize) -> Self {
        Self { chapter, page }
    }
}

/// In-memory LRU of downloaded pages, bounded by entry count and total bytes.
///
/// The lock only guards bookkeeping; fetches happen outside of it, so a slow
/// download never holds up lookups for other pages.
#[derive(Clone)]
pub struct PageCache {
    inner: Arc<RwLock<PageCacheInner>>,
}

struct PageCacheInner {
    pages: LruCache<PageKey, PageBytes>,
    bytes: usize,
    max_bytes: usize,
}

impl PageCache {
    pub fn new(max_pages: usize, max_bytes: usize) -> Self {
        let capacity = NonZeroUsize::new(max_pages).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(RwLock::new(PageCacheInner {
                pages: LruCache::new(capacity),
                bytes: 0,
                max_bytes,
            })),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_pages, config.max_bytes)
    }

    /// Marks the page as most recently used.
    pub async fn get_page(&self, key: &PageKey) -> Option<PageBytes> {
        let mut inner = self.inner.write().await;
        inner.pages.get(key).cloned()
    }

    pub async fn insert_page(&self, key: PageKey, bytes: PageBytes) {
        let mut inner = self.inner.write().await;
        inner.insert(key, bytes);
    }

    pub async fn has_page(&self, key: &PageKey) -> bool {
        let inner = self.inner.read().await;
        inner.pages.contains(key)
    }

    pub async fn remove_page(&self, key: &PageKey) -> Option<PageBytes> {
        let mut inner = self.inner.write().await;
        let removed = inner.pages.pop(key)?;
        inner.bytes = inner.bytes.saturating_sub(removed.len());
        Some(removed)
    }

    pub async fn chapter_pages(&self, chapter: ChapterKey) -> usize {
        let inner = self.inner.read().await;
        inner
            .pages
            .iter()
            .filter(|(key, _)| key.chapter == chapter)
            .count()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.pages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn total_bytes(&self) -> usize {
        self.inner.read().await.bytes
    }
}

impl PageCacheInner {
    fn insert(&mut self, key: PageKey, bytes: PageBytes) {
        if bytes.len() > self.max_bytes {
            log::debug!(
                "Page {} of {} is larger than the cache ({} bytes), not caching",
                key.page,
                key.chapter,
                bytes.len()
            );
            if let Some(stale) = self.pages.pop(&key) {
                self.bytes = self.bytes.saturating_sub(stale.len());
            }
            return;
        }

        self.bytes += bytes.len();
        if let Some((old_key, old)) = self.pages.push(key, bytes) {
            self.bytes = self.bytes.saturating_sub(old.len());
            if old_key != key {
                log::trace!("Evicted page {} of {}", old_key.page, old_key.chapter);
            }
        }

        while self.bytes > self.max_bytes {
            match self.pages.pop_lru() {
                Some((old_key, old)) => {
                    self.bytes = self.bytes.saturating_sub(old.len());
                    log::trace!("Evicted page {} of {}", old_key.page, old_key.chapter);
                }
                None => break,
            }
        }
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAPTER: ChapterKey = ChapterKey {
        manga_id: 1,
        index: 1,
    };

    fn key(page: usize) -> PageKey {
        PageKey::new(CHAPTER, page)
    }

    fn bytes(len: usize) -> PageBytes {
        vec![7u8; len].into()
    }

    #[tokio::test]
    async fn put_then_get_returns_value() {
        let cache = PageCache::new(4, 1024);
        let value = bytes(10);
        cache.insert_page(key(0), value.clone()).await;
        assert_eq!(cache.get_page(&key(0)).await, Some(value));
        assert!(cache.get_page(&key(1)).await.is_none());
    }

    #[tokio::test]
    async fn evicts_least_recently_accessed_by_count() {
        let cache = PageCache::new(2, 1024);
        cache.insert_page(key(0), bytes(1)).await;
        cache.insert_page(key(1), bytes(1)).await;
        // touch 0 so 1 becomes the oldest
        cache.get_page(&key(0)).await;
        cache.insert_page(key(2), bytes(1)).await;

        assert!(cache.has_page(&key(0)).await);
        assert!(!cache.has_page(&key(1)).await);
        assert!(cache.has_page(&key(2)).await);
        assert_eq!(cache.total_bytes().await, 2);
    }

    #[tokio::test]
    async fn evicts_by_byte_budget() {
        let cache = PageCache::new(10, 100);
        cache.insert_page(key(0), bytes(40)).await;
        cache.insert_page(key(1), bytes(40)).await;
        cache.insert_page(key(2), bytes(40)).await;

        assert!(!cache.has_page(&key(0)).await);
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.total_bytes().await, 80);
    }

    #[tokio::test]
    async fn replacing_a_key_keeps_byte_count_right() {
        let cache = PageCache::new(10, 100);
        cache.insert_page(key(0), bytes(30)).await;
        cache.insert_page(key(0), bytes(50)).await;
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.total_bytes().await, 50);

        cache.remove_page(&key(0)).await;
        assert!(cache.is_empty().await);
        assert_eq!(cache.total_bytes().await, 0);
    }

    #[tokio::test]
    async fn oversized_page_is_skipped() {
        let cache = PageCache::new(10, 16);
        cache.insert_page(key(0), bytes(8)).await;
        cache.insert_page(key(1), bytes(17)).await;
        assert!(cache.has_page(&key(0)).await);
        assert!(!cache.has_page(&key(1)).await);
    }

    #[tokio::test]
    async fn oversized_replacement_drops_the_old_bytes() {
        let cache = PageCache::new(10, 16);
        cache.insert_page(key(0), bytes(8)).await;
        cache.insert_page(key(0), bytes(17)).await;
        assert!(!cache.has_page(&key(0)).await);
        assert!(cache.is_empty().await);
        assert_eq!(cache.total_bytes().await, 0);
    }
}
