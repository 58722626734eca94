/// Navigation intents coming from input regions or keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Navigation {
    Menu,
    Next,
    Prev,
    Right,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveTo {
    Next,
    Previous,
}

/// Page-turn events sent to the pager. Page numbers are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMove {
    Direction { to: MoveTo, from: usize },
    Page(usize),
}

/// Where a [`PageMove`] lands, as a 0-based pager index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTarget {
    Index(usize),
    NextChapter,
    PreviousChapter,
    Stay,
}

impl PageMove {
    pub fn resolve(self, page_count: usize) -> PageTarget {
        if page_count == 0 {
            return PageTarget::Stay;
        }
        match self {
            PageMove::Direction {
                to: MoveTo::Next,
                from,
            } => {
                if from >= page_count {
                    PageTarget::NextChapter
                } else {
                    PageTarget::Index(from)
                }
            }
            PageMove::Direction {
                to: MoveTo::Previous,
                from,
            } => {
                if from <= 1 {
                    PageTarget::PreviousChapter
                } else {
                    PageTarget::Index(from.min(page_count + 1) - 2)
                }
            }
            PageMove::Page(page) => PageTarget::Index(page.clamp(1, page_count) - 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directional_moves_step_one_page() {
        let next = PageMove::Direction { to: MoveTo::Next, from: 3 };
        assert_eq!(next.resolve(10), PageTarget::Index(3));
        let prev = PageMove::Direction { to: MoveTo::Previous, from: 3 };
        assert_eq!(prev.resolve(10), PageTarget::Index(1));
    }

    #[test]
    fn moves_past_either_end_switch_chapter() {
        let next = PageMove::Direction { to: MoveTo::Next, from: 10 };
        assert_eq!(next.resolve(10), PageTarget::NextChapter);
        let prev = PageMove::Direction { to: MoveTo::Previous, from: 1 };
        assert_eq!(prev.resolve(10), PageTarget::PreviousChapter);
    }

    #[test]
    fn explicit_pages_are_clamped() {
        assert_eq!(PageMove::Page(0).resolve(5), PageTarget::Index(0));
        assert_eq!(PageMove::Page(5).resolve(5), PageTarget::Index(4));
        assert_eq!(PageMove::Page(99).resolve(5), PageTarget::Index(4));
        assert_eq!(PageMove::Page(2).resolve(0), PageTarget::Stay);
    }
}
