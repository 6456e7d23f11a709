//! Paging and sorting for repository listings

use crate::task::TaskInfo;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    Asc,
    Desc,
}

/// Sortable columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortField {
    SubmitTime,
    TaskId,
}

impl SortField {
    pub fn column(&self) -> &'static str {
        match self {
            SortField::SubmitTime => "submit_time",
            SortField::TaskId => "task_id",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: SortField,
    pub order: Order,
}

impl Sort {
    pub fn asc(field: SortField) -> Self {
        Self {
            field,
            order: Order::Asc,
        }
    }

    pub fn desc(field: SortField) -> Self {
        Self {
            field,
            order: Order::Desc,
        }
    }
}

/// A page request, `index` is 0-based
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub index: usize,
    pub size: usize,
    pub sorts: Vec<Sort>,
}

impl Page {
    pub fn new(index: usize, size: usize, sorts: Vec<Sort>) -> Self {
        Self { index, size, sorts }
    }

    /// First page, oldest submission first
    pub fn oldest_first(size: usize) -> Self {
        Self::new(0, size, vec![Sort::asc(SortField::SubmitTime)])
    }

    pub fn offset(&self) -> usize {
        self.index.saturating_mul(self.size)
    }

    /// `ORDER BY` clause; ties fall back to ascending id
    pub fn order_by_sql(&self) -> String {
        let mut parts: Vec<String> = self
            .sorts
            .iter()
            .map(|s| {
                let dir = match s.order {
                    Order::Asc => "ASC",
                    Order::Desc => "DESC",
                };
                format!("{} {}", s.field.column(), dir)
            })
            .collect();
        if !self.sorts.iter().any(|s| s.field == SortField::TaskId) {
            parts.push("task_id ASC".to_string());
        }
        format!("ORDER BY {}", parts.join(", "))
    }

    /// Comparator matching `order_by_sql`
    pub fn compare(&self, a: &TaskInfo, b: &TaskInfo) -> Ordering {
        for sort in &self.sorts {
            let ord = match sort.field {
                SortField::SubmitTime => a.submit_time.cmp(&b.submit_time),
                SortField::TaskId => a.task_id.cmp(&b.task_id),
            };
            let ord = match sort.order {
                Order::Asc => ord,
                Order::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.task_id.cmp(&b.task_id)
    }
}

/// One page of results plus the total count
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult<T> {
    pub elements: Vec<T>,
    pub index: usize,
    pub total: usize,
}

impl<T> PageResult<T> {
    pub fn into_elements(self) -> Vec<T> {
        self.elements
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_by_sql() {
        assert_eq!(
            Page::oldest_first(10).order_by_sql(),
            "ORDER BY submit_time ASC, task_id ASC"
        );
        let page = Page::new(2, 5, vec![Sort::desc(SortField::TaskId)]);
        assert_eq!(page.order_by_sql(), "ORDER BY task_id DESC");
        assert_eq!(page.offset(), 10);
    }
}
