//! Pagination helpers for list endpoints

use serde::{Deserialize, Serialize};

/// Default page size if not specified
pub const DEFAULT_PAGE_SIZE: i64 = 25;
/// Maximum allowed page size
pub const MAX_PAGE_SIZE: i64 = 100;
/// Default page number (1-indexed for API consumers)
pub const DEFAULT_PAGE: i64 = 1;

/// Standard pagination query parameters
#[derive(Debug, Clone, Deserialize)]
pub struct PaginationParams {
    /// Page number (1-indexed)
    #[serde(default = "default_page")]
    pub page: i64,
    /// Number of items per page
    #[serde(default = "default_per_page")]
    pub per_page: i64,
}

fn default_page() -> i64 {
    DEFAULT_PAGE
}

fn default_per_page() -> i64 {
    DEFAULT_PAGE_SIZE
}

impl PaginationParams {
    /// SQL OFFSET value
    pub fn offset(&self) -> i64 {
        (self.page.max(1) - 1) * self.limit()
    }

    /// SQL LIMIT value
    pub fn limit(&self) -> i64 {
        self.per_page.clamp(1, MAX_PAGE_SIZE)
    }
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            per_page: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Pagination metadata returned with list responses
#[derive(Debug, Clone, Serialize)]
pub struct PaginationMeta {
    pub page: i64,
    pub per_page: i64,
    pub total: i64,
    pub total_pages: i64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl PaginationMeta {
    pub fn new(page: i64, per_page: i64, total: i64) -> Self {
        let total_pages = (total + per_page - 1) / per_page;
        Self {
            page,
            per_page,
            total,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
        }
    }
}

/// Standard paginated response wrapper
#[derive(Debug, Clone, Serialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub meta: PaginationMeta,
}

impl<T> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, params: &PaginationParams, total: i64) -> Self {
        Self {
            data,
            meta: PaginationMeta::new(params.page.max(1), params.limit(), total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_offset() {
        let params = PaginationParams { page: 3, per_page: 25 };
        assert_eq!(params.offset(), 50);
        assert_eq!(params.limit(), 25);
    }

    #[test]
    fn test_pagination_clamps() {
        let params = PaginationParams { page: -1, per_page: 500 };
        assert_eq!(params.offset(), 0);
        assert_eq!(params.limit(), MAX_PAGE_SIZE);
    }

    #[test]
    fn test_pagination_meta() {
        let meta = PaginationMeta::new(2, 25, 100);
        assert_eq!(meta.total_pages, 4);
        assert!(meta.has_next);
        assert!(meta.has_prev);

        let single = PaginationMeta::new(1, 25, 3);
        assert_eq!(single.total_pages, 1);
        assert!(!single.has_next);
    }
}
