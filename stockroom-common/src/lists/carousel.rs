//! Stagnation carousel
//!
//! Walks the active items of one department whose `mt_months` falls in the
//! selected bucket, ordered by `mt_months` descending then SKU ascending.
//! Pages are fetched with a keyset cursor, so the walk stays cheap on large
//! catalogs and every call to [`CarouselSelector::stream`] starts over.
//!
//! The selector only reads the catalog; turning candidates into list lines
//! is the caller's job.

use super::StagnationFilter;
use crate::catalog::Item;
use crate::Result;
use futures::Stream;
use sqlx::SqlitePool;

const DEFAULT_PAGE_SIZE: i64 = 50;

/// Position after the last item handed out
#[derive(Debug, Clone, PartialEq)]
struct Cursor {
    mt_months: f64,
    sku: String,
}

#[derive(Debug, Clone)]
pub struct CarouselSelector {
    pool: SqlitePool,
    dept_code: String,
    filter: StagnationFilter,
    page_size: i64,
}

impl CarouselSelector {
    pub fn new(pool: SqlitePool, dept_code: impl Into<String>, filter: StagnationFilter) -> Self {
        Self {
            pool,
            dept_code: dept_code.into(),
            filter,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn filter(&self) -> StagnationFilter {
        self.filter
    }

    async fn page(&self, after: Option<&Cursor>) -> Result<Vec<Item>> {
        let (low, high) = self.filter.bounds();
        let items = sqlx::query_as::<_, Item>(
            r#"
            SELECT * FROM items
            WHERE dept_code = ?1
              AND is_active = 1
              AND mt_months >= ?2
              AND (?3 IS NULL OR mt_months < ?3)
              AND (?4 IS NULL OR mt_months < ?4 OR (mt_months = ?4 AND sku > ?5))
            ORDER BY mt_months DESC, sku ASC
            LIMIT ?6
            "#,
        )
        .bind(&self.dept_code)
        .bind(low)
        .bind(high)
        .bind(after.map(|c| c.mt_months))
        .bind(after.map(|c| c.sku.as_str()))
        .bind(self.page_size)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    /// Lazy, finite sequence of candidates. Each call restarts from the top.
    pub fn stream(&self) -> impl Stream<Item = Result<Item>> + '_ {
        async_stream::try_stream! {
            let mut cursor: Option<Cursor> = None;
            loop {
                let page = self.page(cursor.as_ref()).await?;
                let exhausted = (page.len() as i64) < self.page_size;
                for item in page {
                    cursor = Some(Cursor {
                        mt_months: item.mt_months,
                        sku: item.sku.clone(),
                    });
                    yield item;
                }
                if exhausted {
                    break;
                }
            }
        }
    }

    /// Number of candidates currently in the bucket
    pub async fn count(&self) -> Result<i64> {
        let (low, high) = self.filter.bounds();
        let count = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM items
            WHERE dept_code = ?1 AND is_active = 1
              AND mt_months >= ?2 AND (?3 IS NULL OR mt_months < ?3)
            "#,
        )
        .bind(&self.dept_code)
        .bind(low)
        .bind(high)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// First candidate not already on `list_id`
    pub async fn next_unlisted(&self, list_id: i64) -> Result<Option<Item>> {
        let (low, high) = self.filter.bounds();
        let item = sqlx::query_as::<_, Item>(
            r#"
            SELECT * FROM items i
            WHERE i.dept_code = ?1
              AND i.is_active = 1
              AND i.mt_months >= ?2
              AND (?3 IS NULL OR i.mt_months < ?3)
              AND NOT EXISTS (SELECT 1 FROM list_items li WHERE li.list_id = ?4 AND li.item_id = i.id)
            ORDER BY i.mt_months DESC, i.sku ASC
            LIMIT 1
            "#,
        )
        .bind(&self.dept_code)
        .bind(low)
        .bind(high)
        .bind(list_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(item)
    }
}
