//! Paginated list results.

use crate::{
    sql::db::{Executor, Row, Select},
    Error, Result,
};
use serde::{Deserialize, Serialize};

/// The largest page a client may request.
pub const MAX_PER_PAGE: u64 = 200;

/// Which page of a list to load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PageRequest {
    /// 1-based page number.
    pub page: u64,
    pub per_page: u64,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 20,
        }
    }
}

impl PageRequest {
    pub fn new(page: u64, per_page: u64) -> Self {
        Self { page, per_page }.normalized()
    }

    /// Clamp the request to a valid page number and size.
    pub fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            per_page: self.per_page.clamp(1, MAX_PER_PAGE),
        }
    }

    /// The number of items before this page, saturating at the largest offset SQL accepts.
    pub fn offset(&self) -> u64 {
        self.page
            .saturating_sub(1)
            .saturating_mul(self.per_page)
            .min(i64::MAX as u64)
    }
}

/// One page of a list.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u64,
    pub per_page: u64,
    /// Total number of items across all pages.
    pub total: u64,
    pub total_pages: u64,
}

impl<T> Page<T> {
    /// Paginate a list which has already been loaded in full.
    pub fn from_items(items: Vec<T>, page: PageRequest) -> Self {
        let page = page.normalized();
        let total = items.len() as u64;
        Page {
            items: items
                .into_iter()
                .skip(usize::try_from(page.offset()).unwrap_or(usize::MAX))
                .take(page.per_page as usize)
                .collect(),
            page: page.page,
            per_page: page.per_page,
            total,
            total_pages: total.div_ceil(page.per_page),
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            page: self.page,
            per_page: self.per_page,
            total: self.total,
            total_pages: self.total_pages,
        }
    }
}

/// Load one page of the rows selected by `select`, converting each with `convert`.
pub async fn load<E, T>(
    exec: &E,
    select: Select,
    page: PageRequest,
    convert: impl Fn(&Row) -> Result<T>,
) -> Result<Page<T>>
where
    E: Executor,
{
    let page = page.normalized();
    let total = exec.count(&select).await.map_err(Error::db)?;
    let rows = exec
        .fetch(&select.offset(page.offset()).limit(page.per_page))
        .await
        .map_err(Error::db)?;
    Ok(Page {
        items: rows.iter().map(convert).collect::<Result<_>>()?,
        page: page.page,
        per_page: page.per_page,
        total,
        total_pages: total.div_ceil(page.per_page),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sql::db::{memory, Insert, SchemaColumn, Table, Type};

    #[test]
    fn test_normalize() {
        assert_eq!(PageRequest::new(0, 0), PageRequest::new(1, 1));
        assert_eq!(PageRequest::new(3, 1000).per_page, MAX_PER_PAGE);
        assert_eq!(PageRequest::new(3, 10).offset(), 20);
        assert_eq!(PageRequest::new(u64::MAX, MAX_PER_PAGE).offset(), i64::MAX as u64);
        assert_eq!(
            PageRequest {
                page: 0,
                per_page: 0
            }
            .offset(),
            0
        );
    }

    #[test]
    fn test_from_items() {
        let page = Page::from_items((1..=7).collect(), PageRequest::new(2, 3));
        assert_eq!(page.items, [4, 5, 6]);
        assert_eq!(page.total, 7);
        assert_eq!(page.total_pages, 3);

        let page = Page::from_items(Vec::<i32>::new(), PageRequest::default());
        assert!(page.items.is_empty());
        assert_eq!(page.total_pages, 0);

        let page = Page::from_items((1..=7).collect(), PageRequest::new(u64::MAX, 3));
        assert!(page.items.is_empty());
        assert_eq!(page.page, u64::MAX);
    }

    #[async_std::test]
    async fn test_load_pages() {
        const HEATS: Table = Table {
            name: "heats",
            columns: &[SchemaColumn::new("number", Type::Text)],
        };
        let db = memory::Connection::create();
        db.create_table(&HEATS).await.unwrap();
        db.insert(
            &Insert::into_table(HEATS.name, ["number"])
                .rows((1..=5).map(|i| vec![format!("H{i}").into()])),
        )
        .await
        .unwrap();

        let page = load(&db, Select::from(HEATS.name), PageRequest::new(3, 2), |row| {
            Ok(row.get::<String>("number")?)
        })
        .await
        .unwrap();
        assert_eq!(page.items, ["H5"]);
        assert_eq!(page.total, 5);
        assert_eq!(page.total_pages, 3);

        let page = load(&db, Select::from(HEATS.name), PageRequest::new(u64::MAX, 2), |row| {
            Ok(row.get::<String>("number")?)
        })
        .await
        .unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.total, 5);
    }
}
