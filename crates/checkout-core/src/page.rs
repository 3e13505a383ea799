//! # Pagination
//!
//! 1-indexed page requests and the page metadata the storefront renders.

use crate::error::{ShopError, ShopResult};
use serde::{Deserialize, Serialize};

/// A request for one page of results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    page: u64,
    page_size: u64,
}

impl PageRequest {
    /// Build a page request. Page 0 is treated as page 1.
    pub fn new(page: u64, page_size: u64) -> ShopResult<Self> {
        if page_size == 0 {
            return Err(ShopError::InvalidRequest(
                "page size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            page: page.max(1),
            page_size,
        })
    }

    pub fn page(&self) -> u64 {
        self.page
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Number of items to skip
    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

/// One page of results plus navigation metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: u64,
    pub current_page: u64,
    pub page_size: u64,
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub next_page: u64,
    pub previous_page: u64,
    pub last_page: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total_count: u64, request: PageRequest) -> Self {
        let page = request.page();
        let page_size = request.page_size();
        Self {
            items,
            total_count,
            current_page: page,
            page_size,
            has_next_page: page.saturating_mul(page_size) < total_count,
            has_previous_page: page > 1,
            next_page: page + 1,
            previous_page: page - 1,
            last_page: total_count.div_ceil(page_size),
        }
    }

    /// Slice one page out of an already-filtered list
    pub fn from_slice(all: &[T], request: PageRequest) -> Self
    where
        T: Clone,
    {
        let total_count = all.len() as u64;
        let items = all
            .iter()
            .skip(usize::try_from(request.offset()).unwrap_or(usize::MAX))
            .take(usize::try_from(request.page_size()).unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Self::new(items, total_count, request)
    }
}
