//! Postgres-backed catalog store.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Row, Transaction, query, query_as};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use super::{CatalogStore, ListingWrite, ScanFinalization, StoreError};
use crate::catalog::{
    ChangeType, HistoryEntry, Listing, ListingAttributes, ListingSnapshot, NewHistoryEntry,
    ScanLog, ScanSummary, Seller, SellerProfile,
};

const UPSERT_SELLER_SQL: &str = include_str!("sql/upsert_seller.sql");
const GET_SELLER_SQL: &str = include_str!("sql/get_seller.sql");
const GET_LISTINGS_BY_IDS_SQL: &str = include_str!("sql/get_listings_by_ids.sql");
const GET_LISTING_SQL: &str = include_str!("sql/get_listing.sql");
const GET_SELLER_LISTINGS_SQL: &str = include_str!("sql/get_seller_listings.sql");
const TOUCH_LISTING_SQL: &str = include_str!("sql/touch_listing.sql");
const UPSERT_LISTING_SQL: &str = include_str!("sql/upsert_listing.sql");
const DEACTIVATE_MISSING_SQL: &str = include_str!("sql/deactivate_missing.sql");
const INSERT_HISTORY_SQL: &str = include_str!("sql/insert_history.sql");
const GET_LISTING_HISTORY_SQL: &str = include_str!("sql/get_listing_history.sql");
const INSERT_SCAN_LOG_SQL: &str = include_str!("sql/insert_scan_log.sql");
const GET_SCAN_LOGS_SQL: &str = include_str!("sql/get_scan_logs.sql");

#[derive(Debug, Clone)]
pub struct PgStoreSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Server-side limit applied to every listing batch transaction.
    pub batch_statement_timeout: Duration,
    /// Server-side limit for the deactivation + scan log transaction.
    pub finalize_statement_timeout: Duration,
    pub auto_migrate: bool,
}

impl Default for PgStoreSettings {
    fn default() -> Self {
        Self {
            max_connections: 8,
            acquire_timeout: Duration::from_secs(10),
            batch_statement_timeout: Duration::from_secs(60),
            finalize_statement_timeout: Duration::from_secs(30),
            auto_migrate: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
    settings: PgStoreSettings,
}

impl PgCatalogStore {
    /// Opens the pool and, when enabled, applies the bundled migrations.
    pub async fn connect(database_url: &str, settings: PgStoreSettings) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await?;
        info!(target = "catalog.store", max_connections = settings.max_connections, "db_connected");

        let store = Self { pool, settings };
        if store.settings.auto_migrate {
            info!(target = "catalog.store", "running migrations (AUTO_MIGRATE=on)");
            store.migrate().await?;
        } else {
            debug!(target = "catalog.store", "AUTO_MIGRATE disabled; skipping migrations");
        }
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn begin(&self, statement_timeout: Duration) -> Result<Transaction<'_, Postgres>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let stmt = format!("SET LOCAL statement_timeout = '{}ms'", statement_timeout.as_millis());
        query(&stmt).execute(&mut *tx).await?;
        Ok(tx)
    }

    async fn insert_history(
        tx: &mut Transaction<'_, Postgres>,
        entry: &NewHistoryEntry,
    ) -> Result<(), StoreError> {
        query(INSERT_HISTORY_SQL)
            .bind(&entry.listing_id)
            .bind(entry.change_type.as_str())
            .bind(Json(&entry.snapshot))
            .bind(entry.recorded_at)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn upsert_listing(
        tx: &mut Transaction<'_, Postgres>,
        listing: &Listing,
    ) -> Result<(), StoreError> {
        let attributes = &listing.attributes;
        query(UPSERT_LISTING_SQL)
            .bind(&listing.id)
            .bind(&listing.seller_phone)
            .bind(&listing.raw_name)
            .bind(&listing.raw_description)
            .bind(listing.price)
            .bind(&listing.currency)
            .bind(&listing.availability)
            .bind(&attributes.model_name)
            .bind(&attributes.storage_gb)
            .bind(&attributes.color)
            .bind(&attributes.warranty)
            .bind(&attributes.battery_health)
            .bind(&listing.data_hash)
            .bind(listing.is_active)
            .bind(listing.first_seen_at)
            .bind(listing.last_seen_at)
            .bind(listing.last_modified_at)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

fn count_to_i64(field: &str, value: usize) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::InvalidData(format!("{field} out of range")))
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn upsert_seller(&self, profile: &SellerProfile) -> Result<Seller, StoreError> {
        let seller = query_as::<Postgres, Seller>(UPSERT_SELLER_SQL)
            .bind(&profile.phone)
            .bind(&profile.name)
            .bind(&profile.city)
            .bind(&profile.catalogue_url)
            .fetch_one(&self.pool)
            .await?;
        Ok(seller)
    }

    async fn seller(&self, phone: &str) -> Result<Option<Seller>, StoreError> {
        let seller = query_as::<Postgres, Seller>(GET_SELLER_SQL)
            .bind(phone)
            .fetch_optional(&self.pool)
            .await?;
        Ok(seller)
    }

    async fn load_listings(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, Listing>, StoreError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = query_as::<Postgres, Listing>(GET_LISTINGS_BY_IDS_SQL)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| (row.id.clone(), row)).collect())
    }

    async fn apply_batch(&self, writes: &[ListingWrite]) -> Result<(), StoreError> {
        let mut tx = self.begin(self.settings.batch_statement_timeout).await?;

        for write in writes {
            match write {
                ListingWrite::Touch { id, seen_at } => {
                    let result = query(TOUCH_LISTING_SQL)
                        .bind(id)
                        .bind(seen_at)
                        .execute(&mut *tx)
                        .await?;
                    if result.rows_affected() == 0 {
                        // dropping tx rolls back the writes made so far
                        return Err(StoreError::NotFound(id.clone()));
                    }
                }
                ListingWrite::Upsert { listing, history } => {
                    Self::upsert_listing(&mut tx, listing).await?;
                    Self::insert_history(&mut tx, history).await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn finalize_scan(&self, scan: &ScanFinalization) -> Result<Vec<Listing>, StoreError> {
        let mut tx = self.begin(self.settings.finalize_statement_timeout).await?;

        let deactivated = query_as::<Postgres, Listing>(DEACTIVATE_MISSING_SQL)
            .bind(&scan.seller_phone)
            .bind(&scan.seen_ids)
            .bind(scan.scan_time)
            .fetch_all(&mut *tx)
            .await?;

        for row in &deactivated {
            let entry = NewHistoryEntry {
                listing_id: row.id.clone(),
                change_type: ChangeType::Deactivated,
                snapshot: ListingSnapshot::capture(row, &scan.context),
                recorded_at: scan.scan_time,
            };
            Self::insert_history(&mut tx, &entry).await?;
        }

        let summary = &scan.summary;
        query(INSERT_SCAN_LOG_SQL)
            .bind(&summary.seller_phone)
            .bind(summary.scan_time)
            .bind(count_to_i64("products_found", summary.products_found)?)
            .bind(count_to_i64("products_new", summary.products_new)?)
            .bind(count_to_i64("products_updated", summary.products_updated)?)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(deactivated)
    }

    async fn listing(&self, id: &str) -> Result<Option<Listing>, StoreError> {
        let row = query_as::<Postgres, Listing>(GET_LISTING_SQL)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn seller_listings(&self, phone: &str) -> Result<Vec<Listing>, StoreError> {
        let rows = query_as::<Postgres, Listing>(GET_SELLER_LISTINGS_SQL)
            .bind(phone)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn listing_history(&self, listing_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let rows = query_as::<Postgres, HistoryEntry>(GET_LISTING_HISTORY_SQL)
            .bind(listing_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn scan_logs(&self, seller_phone: &str) -> Result<Vec<ScanLog>, StoreError> {
        let rows = query_as::<Postgres, ScanLog>(GET_SCAN_LOGS_SQL)
            .bind(seller_phone)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

impl<'r> FromRow<'r, PgRow> for Seller {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            phone: row.try_get("phone")?,
            name: row.try_get("name")?,
            city: row.try_get("city")?,
            catalogue_url: row.try_get("catalogue_url")?,
            is_active: row.try_get("is_active")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for Listing {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            seller_phone: row.try_get("seller_phone")?,
            raw_name: row.try_get("raw_name")?,
            raw_description: row.try_get("raw_description")?,
            price: row.try_get("price_raw")?,
            currency: row.try_get("currency")?,
            availability: row.try_get("availability")?,
            attributes: ListingAttributes {
                model_name: row.try_get("model_name")?,
                storage_gb: row.try_get("storage_gb")?,
                color: row.try_get("color")?,
                warranty: row.try_get("warranty")?,
                battery_health: row.try_get("battery_health")?,
            },
            data_hash: row.try_get("data_hash")?,
            is_active: row.try_get("is_active")?,
            first_seen_at: row.try_get("first_seen_at")?,
            last_seen_at: row.try_get("last_seen_at")?,
            last_modified_at: row.try_get("last_modified_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for HistoryEntry {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        let raw_change: String = row.try_get("change_type")?;
        let change_type =
            ChangeType::parse(&raw_change).ok_or_else(|| sqlx::Error::ColumnDecode {
                index: "change_type".to_string(),
                source: format!("unknown change type {raw_change}").into(),
            })?;
        let Json(snapshot) = row.try_get::<Json<ListingSnapshot>, _>("snapshot")?;

        Ok(Self {
            id: row.try_get("id")?,
            listing_id: row.try_get("listing_id")?,
            change_type,
            snapshot,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for ScanLog {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            summary: ScanSummary {
                seller_phone: row.try_get("seller_phone")?,
                scan_time: row.try_get("scan_time")?,
                products_found: count_column(row, "products_found")?,
                products_new: count_column(row, "products_new")?,
                products_updated: count_column(row, "products_updated")?,
            },
        })
    }
}

fn count_column(row: &PgRow, column: &str) -> sqlx::Result<usize> {
    let value: i64 = row.try_get(column)?;
    usize::try_from(value).map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}
