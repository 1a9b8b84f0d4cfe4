//! One materialized page of a larger result set.

use std::ops::Index;

use serde::de::DeserializeOwned;
use serde_json::Value as Json;

use crate::StorageError;

/// A page as returned by an engine: the raw documents plus the total number
/// of results when the engine can compute it cheaply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageSlice {
    pub items: Vec<Json>,
    pub total_count: Option<u64>,
}

/// An immutable view over one page of a larger result set.
#[derive(Debug, Clone, PartialEq)]
pub struct PagedResult<T> {
    items: Vec<T>,
    page_number: u64,
    page_size: u64,
    total_count: Option<u64>,
}

impl<T> PagedResult<T> {
    /// Create a page. `page_number` is 1-based.
    pub fn new(items: Vec<T>, page_number: u64, page_size: u64, total_count: Option<u64>) -> Self {
        Self {
            items,
            page_number,
            page_size,
            total_count,
        }
    }

    /// The items physically materialized on this page, in page order.
    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    /// Number of items on this page.
    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The current page number. The first page is 1.
    pub fn page_number(&self) -> u64 {
        self.page_number
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// The total number of results, of which this page is a subset.
    pub fn total_count(&self) -> Option<u64> {
        self.total_count
    }

    /// `ceil(total_count / page_size)`, when the total is known.
    pub fn total_pages(&self) -> Option<u64> {
        let total = self.total_count?;
        if self.page_size == 0 {
            return Some(0);
        }
        Some(total.div_ceil(self.page_size))
    }

    /// Zero-based index of the first item of this page within the whole result.
    pub fn first_index_on_page(&self) -> u64 {
        self.page_number.saturating_sub(1).saturating_mul(self.page_size)
    }

    /// Zero-based index of the last item of this page, or `None` for an empty page.
    pub fn last_index_on_page(&self) -> Option<u64> {
        let count = self.items.len() as u64;
        if count == 0 {
            return None;
        }
        Some(self.first_index_on_page().saturating_add(count - 1))
    }

    pub fn has_previous_page(&self) -> bool {
        self.page_number > 1
    }

    /// Whether a following page exists. Without a known total, a full page
    /// is taken to mean more results may follow.
    pub fn has_next_page(&self) -> bool {
        match self.total_pages() {
            Some(pages) => self.page_number < pages,
            None => self.page_size > 0 && self.items.len() as u64 == self.page_size,
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}

impl<T: DeserializeOwned> PagedResult<T> {
    /// Adapt an engine page into a typed result.
    pub fn from_slice(slice: PageSlice, page_number: u64, page_size: u64) -> Result<Self, StorageError> {
        let items = slice
            .items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<T>, _>>()?;
        Ok(Self::new(items, page_number, page_size, slice.total_count))
    }
}

impl<T> Index<usize> for PagedResult<T> {
    type Output = T;

    fn index(&self, index: usize) -> &Self::Output {
        &self.items[index]
    }
}

impl<T> IntoIterator for PagedResult<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a PagedResult<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_second_page_of_ten() {
        let page = PagedResult::new(vec![3, 4, 5], 2, 3, Some(10));
        assert_eq!(page.first_index_on_page(), 3);
        assert_eq!(page.last_index_on_page(), Some(5));
        assert_eq!(page.total_pages(), Some(4));
        assert!(page.has_previous_page());
        assert!(page.has_next_page());
        assert_eq!(page[0], 3);
    }

    #[test]
    fn test_last_page_and_empty_page() {
        let last = PagedResult::new(vec![9], 4, 3, Some(10));
        assert!(!last.has_next_page());
        assert_eq!(last.last_index_on_page(), Some(9));

        let empty: PagedResult<i32> = PagedResult::new(vec![], 5, 3, Some(10));
        assert_eq!(empty.first_index_on_page(), 12);
        assert_eq!(empty.last_index_on_page(), None);
        assert!(!empty.has_next_page());
    }

    #[test]
    fn test_unknown_total() {
        let page = PagedResult::new(vec![1, 2], 1, 2, None);
        assert_eq!(page.total_pages(), None);
        assert!(page.has_next_page());
        assert!(!page.has_previous_page());
    }

    #[test]
    fn test_from_slice_deserializes_items() {
        let slice = PageSlice {
            items: vec![json!(1), json!(2)],
            total_count: Some(2),
        };
        let page: PagedResult<i64> = PagedResult::from_slice(slice, 1, 5).unwrap();
        assert_eq!(page.count(), 2);
        assert_eq!(page.into_items(), vec![1, 2]);
    }
}
