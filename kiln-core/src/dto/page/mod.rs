//! Pagination DTOs

use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 200;

/// One page of a listing, newest first unless stated otherwise
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Total number of matching items across all pages
    pub total: u64,
    /// 1-based page number
    pub page: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    pub fn empty(page: u32, page_size: u32) -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            page,
            page_size,
        }
    }

    pub fn has_more(&self) -> bool {
        u64::from(self.page) * u64::from(self.page_size) < self.total
    }
}

/// Normalizes user supplied paging into `(page, page_size, offset)`
pub fn normalize(page: Option<u32>, page_size: Option<u32>) -> (u32, u32, u64) {
    let page = page.unwrap_or(1).max(1);
    let page_size = page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = u64::from(page - 1) * u64::from(page_size);
    (page, page_size, offset)
}
