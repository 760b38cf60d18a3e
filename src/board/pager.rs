//! Incremental "infinite scroll" window over the sorted rows.
//!
//! The window starts at one page, grows by one page per `load_more`, and is
//! never reported larger than the number of rows it is applied to.

pub const DEFAULT_PAGE_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    page_size: usize,
    requested: usize,
}

impl Window {
    pub fn new(page_size: usize) -> Self {
        let page_size = page_size.max(1);
        Window {
            page_size,
            requested: page_size,
        }
    }

    /// Rows to show out of `total`.
    pub fn size(&self, total: usize) -> usize {
        self.requested.min(total)
    }

    pub fn has_more(&self, total: usize) -> bool {
        self.size(total) < total
    }

    /// Grow by one page, capped at `total`. Returns whether anything changed.
    pub fn load_more(&mut self, total: usize) -> bool {
        let current = self.size(total);
        if current >= total {
            return false;
        }
        self.requested = (current + self.page_size).min(total);
        true
    }

    pub fn reset(&mut self) {
        self.requested = self.page_size;
    }
}

impl Default for Window {
    fn default() -> Self {
        Window::new(DEFAULT_PAGE_SIZE)
    }
}
