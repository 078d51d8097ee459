//! Shared value types.

use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

/// One-based page request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawPageRequest")]
pub struct PageRequest {
    pub page: usize,
    pub limit: usize,
}

/// Wire form; every deserialized request is clamped through [`PageRequest::new`].
#[derive(Deserialize)]
struct RawPageRequest {
    #[serde(default = "first_page")]
    page: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn first_page() -> usize {
    1
}

fn default_limit() -> usize {
    DEFAULT_PAGE_SIZE
}

impl From<RawPageRequest> for PageRequest {
    fn from(raw: RawPageRequest) -> Self {
        Self::new(raw.page, raw.limit)
    }
}

impl PageRequest {
    /// Clamps `page` to at least 1 and `limit` to `1..=MAX_PAGE_SIZE`.
    pub fn new(page: usize, limit: usize) -> Self {
        Self {
            page: page.max(1),
            limit: limit.clamp(1, MAX_PAGE_SIZE),
        }
    }

    /// The fields are public, so out-of-range values are clamped here too.
    pub fn offset(&self) -> usize {
        self.page.max(1).saturating_sub(1).saturating_mul(self.effective_limit())
    }

    fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }

    /// Slice an already ordered result set.
    pub fn apply<T>(&self, items: Vec<T>) -> Page<T> {
        let total = items.len();
        let items = items
            .into_iter()
            .skip(self.offset())
            .take(self.effective_limit())
            .collect();
        Page {
            items,
            total,
            page: self.page.max(1),
            limit: self.effective_limit(),
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, DEFAULT_PAGE_SIZE)
    }
}

/// A page of results with the unpaginated total
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            limit: self.limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_request_clamps() {
        let req = PageRequest::new(0, 1000);
        assert_eq!(req.page, 1);
        assert_eq!(req.limit, MAX_PAGE_SIZE);
    }

    #[test]
    fn test_apply_pagination() {
        let page = PageRequest::new(2, 3).apply((1..=8).collect::<Vec<_>>());
        assert_eq!(page.items, vec![4, 5, 6]);
        assert_eq!(page.total, 8);

        let last = PageRequest::new(3, 3).apply((1..=8).collect::<Vec<_>>());
        assert_eq!(last.items, vec![7, 8]);

        let beyond = PageRequest::new(5, 3).apply((1..=8).collect::<Vec<_>>());
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.total, 8);
    }

    #[test]
    fn test_deserialized_request_is_clamped() {
        let req: PageRequest = serde_json::from_str(r#"{"page":0,"limit":0}"#).unwrap();
        assert_eq!(req, PageRequest::new(1, 1));

        let page = req.apply(vec![1, 2, 3]);
        assert_eq!(page.items, vec![1]);
        assert_eq!(page.total, 3);

        let defaults: PageRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(defaults, PageRequest::default());
    }

    #[test]
    fn test_out_of_range_fields_do_not_panic() {
        let req = PageRequest { page: 0, limit: 0 };
        assert_eq!(req.offset(), 0);
        assert_eq!(req.apply(vec!["a", "b"]).items, vec!["a"]);

        let huge = PageRequest { page: usize::MAX, limit: usize::MAX };
        assert!(huge.apply(vec![1, 2, 3]).items.is_empty());
    }
}
