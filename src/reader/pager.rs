//! Page tracking over a virtualized, scrollable list of pages.
//!
//! [`LazyList`] models the scrolling surface: item sizes, viewport, content
//! padding and the scroll position, all in pixels (rows in the terminal).
//! [`PagerState`] turns its visible geometry into a single current page and
//! snaps to one item after every gesture.

use std::time::Duration;
use tokio::sync::watch;

/// A visible item. `offset` is measured from the top edge of the viewport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemInfo {
    pub index: usize,
    pub offset: i32,
    pub size: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutInfo {
    pub visible_items: Vec<ItemInfo>,
    pub viewport_size: i32,
    pub before_padding: i32,
    pub after_padding: i32,
}

impl LayoutInfo {
    /// The item with the largest overlap with the padded viewport. The first
    /// one wins a tie.
    pub fn most_visible_item(&self) -> Option<ItemInfo> {
        let end_limit = self.viewport_size - self.after_padding;
        let mut best: Option<(ItemInfo, i32)> = None;
        for item in &self.visible_items {
            let start = item.offset.max(0);
            let end = (item.offset + item.size).min(end_limit);
            let overlap = end - start;
            if best.is_none_or(|(_, max)| overlap > max) {
                best = Some((*item, overlap));
            }
        }
        best.map(|(item, _)| item)
    }

    fn container_size(&self) -> i32 {
        self.viewport_size - self.before_padding - self.after_padding
    }

    /// Distance an item has to travel to sit centered in the container.
    fn distance_to_snap_position(&self, item: &ItemInfo) -> f32 {
        let desired = self.before_padding as f32 + self.container_size() as f32 / 2.0
            - item.size as f32 / 2.0;
        item.offset as f32 - desired
    }

    /// Closest snap distance at or before the center, and at or after it.
    pub fn snap_offset_bounds(&self) -> (Option<f32>, Option<f32>) {
        let mut lower: Option<f32> = None;
        let mut upper: Option<f32> = None;
        for item in &self.visible_items {
            let offset = self.distance_to_snap_position(item);
            if offset <= 0.0 && lower.is_none_or(|l| offset > l) {
                lower = Some(offset);
            }
            if offset >= 0.0 && upper.is_none_or(|u| offset < u) {
                upper = Some(offset);
            }
        }
        (lower, upper)
    }

    /// Average size of the visible items.
    pub fn snap_step_size(&self) -> f32 {
        if self.visible_items.is_empty() {
            return 0.0;
        }
        let total: i32 = self.visible_items.iter().map(|item| item.size).sum();
        total as f32 / self.visible_items.len() as f32
    }
}

#[derive(Debug, Clone, Default)]
pub struct LazyList {
    item_sizes: Vec<i32>,
    viewport_size: i32,
    before_padding: i32,
    after_padding: i32,
    scroll_offset: i32,
}

impl LazyList {
    pub fn new(viewport_size: i32, before_padding: i32, after_padding: i32) -> Self {
        Self {
            viewport_size: viewport_size.max(0),
            before_padding: before_padding.max(0),
            after_padding: after_padding.max(0),
            ..Self::default()
        }
    }

    pub fn set_viewport(&mut self, viewport_size: i32, before_padding: i32, after_padding: i32) {
        self.viewport_size = viewport_size.max(0);
        self.before_padding = before_padding.max(0);
        self.after_padding = after_padding.max(0);
        self.clamp();
    }

    pub fn set_items(&mut self, sizes: Vec<i32>) {
        self.item_sizes = sizes.into_iter().map(|size| size.max(1)).collect();
        self.clamp();
    }

    pub fn item_count(&self) -> usize {
        self.item_sizes.len()
    }

    pub fn item_size(&self, index: usize) -> Option<i32> {
        self.item_sizes.get(index).copied()
    }

    pub fn viewport_size(&self) -> i32 {
        self.viewport_size
    }

    pub fn scroll_offset(&self) -> i32 {
        self.scroll_offset
    }

    fn item_start(&self, index: usize) -> i32 {
        self.before_padding + self.item_sizes.iter().take(index).sum::<i32>()
    }

    fn max_scroll(&self) -> i32 {
        let content = self.item_start(self.item_sizes.len()) + self.after_padding;
        (content - self.viewport_size).max(0)
    }

    fn clamp(&mut self) {
        self.scroll_offset = self.scroll_offset.clamp(0, self.max_scroll());
    }

    /// Scroll offset that puts `index` at the start of the content area.
    pub fn offset_for_item(&self, index: usize) -> i32 {
        let index = index.min(self.item_sizes.len().saturating_sub(1));
        (self.item_start(index) - self.before_padding).clamp(0, self.max_scroll())
    }

    pub fn scroll_to(&mut self, offset: i32) {
        self.scroll_offset = offset;
        self.clamp();
    }

    pub fn scroll_to_item(&mut self, index: usize) {
        self.scroll_to(self.offset_for_item(index));
    }

    /// Returns how much was actually scrolled.
    pub fn scroll_by(&mut self, delta: i32) -> i32 {
        let before = self.scroll_offset;
        self.scroll_to(before + delta);
        self.scroll_offset - before
    }

    pub fn layout_info(&self) -> LayoutInfo {
        let mut visible_items = Vec::new();
        let mut position = self.before_padding;
        for (index, &size) in self.item_sizes.iter().enumerate() {
            let offset = position - self.scroll_offset;
            position += size;
            if offset >= self.viewport_size {
                break;
            }
            if offset + size > 0 {
                visible_items.push(ItemInfo {
                    index,
                    offset,
                    size,
                });
            }
        }
        LayoutInfo {
            visible_items,
            viewport_size: self.viewport_size,
            before_padding: self.before_padding,
            after_padding: self.after_padding,
        }
    }
}

/// Current page of a pager, always derived from what is actually on screen.
pub struct PagerState {
    current_page: watch::Sender<usize>,
    list: LazyList,
    frames: u32,
    frame: Duration,
}

impl PagerState {
    pub fn new(current_page: usize) -> Self {
        Self {
            current_page: watch::Sender::new(current_page),
            list: LazyList::default(),
            frames: 6,
            frame: Duration::from_millis(16),
        }
    }

    pub fn with_animation(mut self, frames: u32, frame: Duration) -> Self {
        self.frames = frames.max(1);
        self.frame = frame;
        self
    }

    pub fn current_page(&self) -> usize {
        *self.current_page.borrow()
    }

    pub fn set_current_page(&self, page: usize) {
        self.current_page.send_if_modified(|current| {
            if *current == page {
                return false;
            }
            *current = page;
            true
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.current_page.subscribe()
    }

    pub fn list(&self) -> &LazyList {
        &self.list
    }

    pub fn layout_info(&self) -> LayoutInfo {
        self.list.layout_info()
    }

    pub fn most_visible_page_layout_info(&self) -> Option<ItemInfo> {
        self.list.layout_info().most_visible_item()
    }

    pub fn update_current_page_from_layout(&self) {
        if let Some(item) = self.most_visible_page_layout_info() {
            self.set_current_page(item.index);
        }
    }

    pub fn set_viewport(&mut self, viewport_size: i32, before_padding: i32, after_padding: i32) {
        self.list
            .set_viewport(viewport_size, before_padding, after_padding);
        self.update_current_page_from_layout();
    }

    /// Replaces the items. An empty list picks up at the current page once
    /// items arrive.
    pub fn set_items(&mut self, sizes: Vec<i32>) {
        let was_empty = self.list.item_count() == 0;
        self.list.set_items(sizes);
        if was_empty && self.list.item_count() > 0 {
            self.list.scroll_to_item(self.current_page());
        }
        self.update_current_page_from_layout();
    }

    pub fn scroll_to_page(&mut self, page: usize) {
        self.list.scroll_to_item(page);
        self.update_current_page_from_layout();
    }

    /// Scrolls to `offset` past the start of `page`.
    pub fn scroll_to_page_offset(&mut self, page: usize, offset: i32) {
        self.list.scroll_to(self.list.offset_for_item(page) + offset);
        self.update_current_page_from_layout();
    }

    /// How far the list is scrolled past the start of the current page.
    pub fn current_page_offset(&self) -> i32 {
        if self.list.item_count() == 0 {
            return 0;
        }
        self.list.scroll_offset() - self.list.offset_for_item(self.current_page())
    }

    /// Scrolls in `frames` steps; the current page follows whatever is most
    /// visible after each step.
    pub async fn animate_scroll_to_page(&mut self, page: usize) {
        let start = self.list.scroll_offset();
        let target = self.list.offset_for_item(page);
        let frames = self.frames as i32;
        for step in 1..=frames {
            self.list.scroll_to(start + (target - start) * step / frames);
            self.update_current_page_from_layout();
            if step < frames {
                tokio::time::sleep(self.frame).await;
            }
        }
    }

    pub fn drag(&mut self, delta: i32) -> i32 {
        let consumed = self.list.scroll_by(delta);
        self.update_current_page_from_layout();
        consumed
    }

    /// Ends a gesture on exactly one item: forward flings go to the next snap
    /// point, backward flings to the previous one, a release without velocity
    /// to the nearest. Never moves further than one average item.
    pub fn fling(&mut self, velocity: f32) {
        let layout = self.list.layout_info();
        let (lower, upper) = layout.snap_offset_bounds();
        let distance = if velocity > 0.0 {
            upper.or(lower)
        } else if velocity < 0.0 {
            lower.or(upper)
        } else {
            match (lower, upper) {
                (Some(l), Some(u)) => Some(if -l <= u { l } else { u }),
                (l, u) => l.or(u),
            }
        };

        let step = layout.snap_step_size();
        if let Some(distance) = distance {
            let distance = if step > 0.0 {
                distance.clamp(-step, step)
            } else {
                distance
            };
            self.list.scroll_by(distance.round() as i32);
        }
        self.update_current_page_from_layout();
    }

    /// A drag released with velocity in the direction of the drag.
    pub fn nudge(&mut self, delta: i32) {
        self.drag(delta);
        self.fling(delta.signum() as f32);
    }
}

impl Default for PagerState {
    fn default() -> Self {
        Self::new(0)
    }
}
