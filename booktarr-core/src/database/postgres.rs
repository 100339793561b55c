//! Postgres implementation of the persistence gateway.
//!
//! Every write runs inside an explicit transaction; the unique partial
//! index on `editions.isbn_13` backs the canonical-key invariant even
//! under concurrent upserts.

use async_trait::async_trait;
use booktarr_model::{
    Book, BookId, BookWithEdition, CanonicalRecord, Edition, EditionId, Isbn, Isbn13,
    MetadataSource, Series, SeriesId, SeriesStatus, SeriesVolume, VolumeId, VolumeStatus,
};
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::database::LibraryRepository;
use crate::error::{CoreError, Result};

#[derive(Clone)]
pub struct PostgresLibraryRepository {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresLibraryRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresLibraryRepository").finish()
    }
}

impl PostgresLibraryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CoreError::Database(format!("migration failed: {e}")))
    }

    async fn fetch_pair(
        tx: &mut Transaction<'_, Postgres>,
        edition_id: EditionId,
    ) -> Result<BookWithEdition> {
        let row = sqlx::query(
            r#"
            SELECT e.id AS edition_id, e.book_id, e.isbn_10, e.isbn_13, e.publisher,
                   e.release_date, e.page_count, e.language AS edition_language, e.format,
                   e.cover_url, e.pricing, e.metadata_source, e.enriched_at, e.created_at,
                   b.title, b.authors, b.series_name, b.series_position, b.categories,
                   b.description, b.language AS book_language, b.original_title,
                   b.added_at, b.updated_at
            FROM editions e
            JOIN books b ON b.id = e.book_id
            WHERE e.id = $1
            "#,
        )
        .bind(edition_id.as_uuid())
        .fetch_one(&mut **tx)
        .await?;

        pair_from_row(&row)
    }
}

fn pair_from_row(row: &PgRow) -> Result<BookWithEdition> {
    let book = Book {
        id: BookId(row.try_get("book_id")?),
        title: row.try_get("title")?,
        authors: json_column(row, "authors")?,
        series_name: row.try_get("series_name")?,
        series_position: int_column(row, "series_position")?,
        categories: json_column(row, "categories")?,
        description: row.try_get("description")?,
        language: row.try_get("book_language")?,
        original_title: row.try_get("original_title")?,
        added_at: row.try_get("added_at")?,
        updated_at: row.try_get("updated_at")?,
    };

    let edition = Edition {
        id: EditionId(row.try_get("edition_id")?),
        book_id: book.id,
        isbn_10: isbn10_column(row, "isbn_10")?,
        isbn_13: isbn13_column(row, "isbn_13")?,
        publisher: row.try_get("publisher")?,
        release_date: row.try_get("release_date")?,
        page_count: int_column(row, "page_count")?,
        language: row.try_get("edition_language")?,
        format: row.try_get("format")?,
        cover_url: row.try_get("cover_url")?,
        pricing: json_column(row, "pricing")?,
        metadata_source: MetadataSource::from_name(
            &row.try_get::<String, _>("metadata_source")?,
        ),
        enriched_at: row.try_get("enriched_at")?,
        created_at: row.try_get("created_at")?,
    };

    Ok(BookWithEdition { book, edition })
}

fn series_from_row(row: &PgRow) -> Result<Series> {
    Ok(Series {
        id: SeriesId(row.try_get("id")?),
        name: row.try_get("name")?,
        total_volumes: int_column(row, "total_volumes")?,
        status: SeriesStatus::from_name(&row.try_get::<String, _>("status")?),
        metadata_source: MetadataSource::from_name(&row.try_get::<String, _>("metadata_source")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn volume_from_row(row: &PgRow) -> Result<SeriesVolume> {
    let position: i32 = row.try_get("position")?;
    Ok(SeriesVolume {
        id: VolumeId(row.try_get("id")?),
        series_id: SeriesId(row.try_get("series_id")?),
        position: u32::try_from(position)
            .map_err(|_| CoreError::Database(format!("negative volume position {position}")))?,
        book_id: row.try_get::<Option<Uuid>, _>("book_id")?.map(BookId),
        status: VolumeStatus::from_name(&row.try_get::<String, _>("status")?),
        created_at: row.try_get("created_at")?,
    })
}

fn json_column<T: serde::de::DeserializeOwned>(row: &PgRow, column: &str) -> Result<T> {
    let value: serde_json::Value = row.try_get(column)?;
    Ok(serde_json::from_value(value)?)
}

fn int_column(row: &PgRow, column: &str) -> Result<Option<u32>> {
    let value: Option<i32> = row.try_get(column)?;
    Ok(value.and_then(|n| u32::try_from(n).ok()))
}

fn isbn10_column(row: &PgRow, column: &str) -> Result<Option<booktarr_model::Isbn10>> {
    let value: Option<String> = row.try_get(column)?;
    value
        .map(|raw| {
            booktarr_model::Isbn10::new(&raw)
                .map_err(|e| CoreError::Database(format!("corrupt {column} column: {e}")))
        })
        .transpose()
}

fn isbn13_column(row: &PgRow, column: &str) -> Result<Option<Isbn13>> {
    let value: Option<String> = row.try_get(column)?;
    value
        .map(|raw| {
            Isbn13::new(&raw)
                .map_err(|e| CoreError::Database(format!("corrupt {column} column: {e}")))
        })
        .transpose()
}

fn json_param<T: serde::Serialize>(values: &[T]) -> Result<Option<serde_json::Value>> {
    if values.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_value(values)?))
}

fn author_set(authors: &[String]) -> Vec<String> {
    let mut set: Vec<String> = authors.iter().map(|a| a.trim().to_lowercase()).collect();
    set.sort();
    set
}

async fn update_book(
    tx: &mut Transaction<'_, Postgres>,
    book_id: BookId,
    record: &CanonicalRecord,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE books SET
            title = COALESCE($2, title),
            authors = COALESCE($3, authors),
            series_name = COALESCE($4, series_name),
            series_position = COALESCE($5, series_position),
            categories = COALESCE($6, categories),
            description = COALESCE($7, description),
            language = COALESCE($8, language),
            original_title = COALESCE($9, original_title),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(book_id.as_uuid())
    .bind(record.title.as_deref())
    .bind(json_param(&record.authors)?)
    .bind(record.series.as_deref())
    .bind(record.series_position.map(|p| p as i32))
    .bind(json_param(&record.categories)?)
    .bind(record.description.as_deref())
    .bind(record.language.as_deref())
    .bind(record.original_title.as_deref())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn update_edition(
    tx: &mut Transaction<'_, Postgres>,
    edition_id: EditionId,
    record: &CanonicalRecord,
) -> Result<()> {
    let enriched_at = record
        .source
        .filter(|s| matches!(s, MetadataSource::GoogleBooks | MetadataSource::OpenLibrary))
        .map(|_| Utc::now());

    sqlx::query(
        r#"
        UPDATE editions SET
            isbn_10 = COALESCE($2, isbn_10),
            isbn_13 = COALESCE($3, isbn_13),
            publisher = COALESCE($4, publisher),
            release_date = COALESCE($5, release_date),
            page_count = COALESCE($6, page_count),
            language = COALESCE($7, language),
            cover_url = COALESCE($8, cover_url),
            pricing = COALESCE($9, pricing),
            metadata_source = COALESCE($10, metadata_source),
            enriched_at = COALESCE($11, enriched_at)
        WHERE id = $1
        "#,
    )
    .bind(edition_id.as_uuid())
    .bind(record.isbn_10.as_ref().map(|i| i.as_str().to_string()))
    .bind(record.canonical_isbn13().map(Isbn13::into_string))
    .bind(record.publisher.as_deref())
    .bind(record.published_date)
    .bind(record.page_count.map(|p| p as i32))
    .bind(record.language.as_deref())
    .bind(record.thumbnail_url.as_deref())
    .bind(json_param(&record.pricing)?)
    .bind(record.source.map(|s| s.as_str()))
    .bind(enriched_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

#[async_trait]
impl LibraryRepository for PostgresLibraryRepository {
    async fn get_book_by_isbn(&self, isbn: &Isbn) -> Result<Option<BookWithEdition>> {
        let canonical = isbn.canonical();
        let row = sqlx::query(
            r#"
            SELECT e.id AS edition_id, e.book_id, e.isbn_10, e.isbn_13, e.publisher,
                   e.release_date, e.page_count, e.language AS edition_language, e.format,
                   e.cover_url, e.pricing, e.metadata_source, e.enriched_at, e.created_at,
                   b.title, b.authors, b.series_name, b.series_position, b.categories,
                   b.description, b.language AS book_language, b.original_title,
                   b.added_at, b.updated_at
            FROM editions e
            JOIN books b ON b.id = e.book_id
            WHERE e.isbn_13 = $1 OR e.isbn_10 = $2
            ORDER BY (e.isbn_13 = $1) DESC
            LIMIT 1
            "#,
        )
        .bind(canonical.as_str())
        .bind(isbn.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(pair_from_row).transpose()
    }

    fn all_edition_isbns(&self) -> BoxStream<'_, Result<Isbn13>> {
        sqlx::query("SELECT isbn_13 FROM editions WHERE isbn_13 IS NOT NULL ORDER BY isbn_13")
            .fetch(&self.pool)
            .map(|row| {
                let row = row?;
                let raw: String = row.try_get("isbn_13")?;
                Isbn13::new(&raw)
                    .map_err(|e| CoreError::Database(format!("corrupt isbn_13 column: {e}")))
            })
            .boxed()
    }

    async fn upsert_book_and_edition(&self, record: &CanonicalRecord) -> Result<BookWithEdition> {
        let canonical = record.canonical_isbn13();
        let mut tx = self.pool.begin().await?;

        // Canonical ISBN-13 first, then a legacy ISBN-10-only row that
        // gets its ISBN-13 backfilled by the update below.
        let mut edition_id: Option<EditionId> = None;
        if let Some(canonical) = &canonical {
            edition_id = sqlx::query("SELECT id FROM editions WHERE isbn_13 = $1")
                .bind(canonical.as_str())
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| row.try_get("id").map(EditionId))
                .transpose()?;
        }
        if edition_id.is_none() {
            if let Some(isbn10) = &record.isbn_10 {
                edition_id =
                    sqlx::query("SELECT id FROM editions WHERE isbn_10 = $1 AND isbn_13 IS NULL")
                        .bind(isbn10.as_str())
                        .fetch_optional(&mut *tx)
                        .await?
                        .map(|row| row.try_get("id").map(EditionId))
                        .transpose()?;
            }
        }

        if let Some(edition_id) = edition_id {
            let book_id: Uuid = sqlx::query("SELECT book_id FROM editions WHERE id = $1")
                .bind(edition_id.as_uuid())
                .fetch_one(&mut *tx)
                .await?
                .try_get("book_id")?;

            update_edition(&mut tx, edition_id, record).await?;
            update_book(&mut tx, BookId(book_id), record).await?;

            let pair = Self::fetch_pair(&mut tx, edition_id).await?;
            tx.commit().await?;
            return Ok(pair);
        }

        // No edition matched: resolve the book by (title, author set).
        let mut book_id: Option<BookId> = None;
        if let Some(title) = &record.title {
            let candidates =
                sqlx::query("SELECT id, authors FROM books WHERE lower(btrim(title)) = $1")
                    .bind(title.trim().to_lowercase())
                    .fetch_all(&mut *tx)
                    .await?;

            let wanted = author_set(&record.authors);
            for row in &candidates {
                let authors: Vec<String> = json_column(row, "authors")?;
                if author_set(&authors) == wanted {
                    book_id = Some(BookId(row.try_get("id")?));
                    break;
                }
            }
        }

        let book_id = match book_id {
            Some(book_id) => {
                update_book(&mut tx, book_id, record).await?;
                book_id
            }
            None => {
                let book_id = BookId::new();
                sqlx::query(
                    r#"
                    INSERT INTO books (id, title, authors, series_name, series_position,
                                       categories, description, language, original_title)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(book_id.as_uuid())
                .bind(record.title.as_deref().unwrap_or_default())
                .bind(serde_json::to_value(&record.authors)?)
                .bind(record.series.as_deref())
                .bind(record.series_position.map(|p| p as i32))
                .bind(serde_json::to_value(&record.categories)?)
                .bind(record.description.as_deref())
                .bind(record.language.as_deref())
                .bind(record.original_title.as_deref())
                .execute(&mut *tx)
                .await?;
                book_id
            }
        };

        // An ISBN-less record may still match an existing edition of
        // the same book by publisher and release date.
        let mut existing_edition: Option<EditionId> = None;
        if canonical.is_none() {
            existing_edition = sqlx::query(
                r#"
                SELECT id FROM editions
                WHERE book_id = $1 AND isbn_13 IS NULL
                  AND publisher IS NOT DISTINCT FROM $2
                  AND release_date IS NOT DISTINCT FROM $3
                LIMIT 1
                "#,
            )
            .bind(book_id.as_uuid())
            .bind(record.publisher.as_deref())
            .bind(record.published_date)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.try_get("id").map(EditionId))
            .transpose()?;
        }

        let edition_id = match existing_edition {
            Some(edition_id) => {
                update_edition(&mut tx, edition_id, record).await?;
                edition_id
            }
            None => {
                let edition_id = EditionId::new();
                let returned: Uuid = sqlx::query(
                    r#"
                    INSERT INTO editions (id, book_id, isbn_10, isbn_13, publisher,
                                          release_date, page_count, language, cover_url,
                                          pricing, metadata_source)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    ON CONFLICT (isbn_13) WHERE isbn_13 IS NOT NULL DO UPDATE SET
                        isbn_10 = EXCLUDED.isbn_10,
                        publisher = COALESCE(EXCLUDED.publisher, editions.publisher),
                        release_date = COALESCE(EXCLUDED.release_date, editions.release_date),
                        page_count = COALESCE(EXCLUDED.page_count, editions.page_count)
                    RETURNING id
                    "#,
                )
                .bind(edition_id.as_uuid())
                .bind(book_id.as_uuid())
                .bind(record.isbn_10.as_ref().map(|i| i.as_str().to_string()))
                .bind(canonical.as_ref().map(|i| i.as_str().to_string()))
                .bind(record.publisher.as_deref())
                .bind(record.published_date)
                .bind(record.page_count.map(|p| p as i32))
                .bind(record.language.as_deref())
                .bind(record.thumbnail_url.as_deref())
                .bind(serde_json::to_value(&record.pricing)?)
                .bind(record.source.unwrap_or(MetadataSource::Unknown).as_str())
                .fetch_one(&mut *tx)
                .await?
                .try_get("id")?;

                if returned != edition_id.to_uuid() {
                    debug!(isbn = ?canonical, "concurrent upsert resolved to existing edition");
                }
                EditionId(returned)
            }
        };

        let pair = Self::fetch_pair(&mut tx, edition_id).await?;
        tx.commit().await?;
        Ok(pair)
    }

    async fn upsert_series(&self, name: &str, total_volumes: Option<u32>) -> Result<Series> {
        let key = Series::canonical_key(name);
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO series (id, name, canonical_key, total_volumes)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (canonical_key) DO UPDATE SET
                total_volumes = CASE
                    WHEN EXCLUDED.total_volumes IS NULL THEN series.total_volumes
                    ELSE GREATEST(COALESCE(series.total_volumes, 0), EXCLUDED.total_volumes)
                END,
                updated_at = NOW()
            RETURNING id, name, total_volumes, status, metadata_source, created_at, updated_at
            "#,
        )
        .bind(SeriesId::new().as_uuid())
        .bind(name)
        .bind(&key)
        .bind(total_volumes.map(|t| t as i32))
        .fetch_one(&mut *tx)
        .await?;

        let series = series_from_row(&row)?;
        tx.commit().await?;
        Ok(series)
    }

    async fn link_volume(
        &self,
        series_id: SeriesId,
        position: u32,
        book_id: Option<BookId>,
    ) -> Result<SeriesVolume> {
        if position == 0 {
            return Err(CoreError::InvalidInput(
                "volume position must be positive".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            r#"
            SELECT id FROM series_volumes
            WHERE series_id = $1 AND position = $2
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(series_id.as_uuid())
        .bind(position as i32)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.try_get::<Uuid, _>("id"))
        .transpose()?;

        let row = match existing {
            Some(volume_id) => {
                sqlx::query(
                    r#"
                    UPDATE series_volumes SET
                        book_id = COALESCE($2, book_id),
                        status = CASE WHEN $2 IS NOT NULL THEN 'owned' ELSE status END
                    WHERE id = $1
                    RETURNING id, series_id, position, book_id, status, created_at
                    "#,
                )
                .bind(volume_id)
                .bind(book_id.map(|b| b.to_uuid()))
                .fetch_one(&mut *tx)
                .await?
            }
            None => {
                let status = if book_id.is_some() { "owned" } else { "missing" };
                sqlx::query(
                    r#"
                    INSERT INTO series_volumes (id, series_id, position, book_id, status)
                    VALUES ($1, $2, $3, $4, $5)
                    RETURNING id, series_id, position, book_id, status, created_at
                    "#,
                )
                .bind(VolumeId::new().as_uuid())
                .bind(series_id.as_uuid())
                .bind(position as i32)
                .bind(book_id.map(|b| b.to_uuid()))
                .bind(status)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        let volume = volume_from_row(&row)?;
        tx.commit().await?;
        Ok(volume)
    }

    async fn get_series_with_volumes(
        &self,
        name: &str,
    ) -> Result<Option<(Series, Vec<SeriesVolume>)>> {
        let key = Series::canonical_key(name);

        let Some(row) = sqlx::query(
            r#"
            SELECT id, name, total_volumes, status, metadata_source, created_at, updated_at
            FROM series WHERE canonical_key = $1
            "#,
        )
        .bind(&key)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };
        let series = series_from_row(&row)?;

        let rows = sqlx::query(
            r#"
            SELECT id, series_id, position, book_id, status, created_at
            FROM series_volumes
            WHERE series_id = $1
            ORDER BY position, created_at
            "#,
        )
        .bind(series.id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        let volumes = rows
            .iter()
            .map(volume_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(Some((series, volumes)))
    }

    async fn all_series(&self) -> Result<Vec<Series>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, total_volumes, status, metadata_source, created_at, updated_at
            FROM series ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(series_from_row).collect()
    }

    async fn set_series_total(&self, series_id: SeriesId, total_volumes: u32) -> Result<()> {
        let result =
            sqlx::query("UPDATE series SET total_volumes = $2, updated_at = NOW() WHERE id = $1")
                .bind(series_id.as_uuid())
                .bind(total_volumes as i32)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::Database(format!("unknown series {series_id}")));
        }
        Ok(())
    }

    async fn set_volume_status(&self, volume_id: VolumeId, status: VolumeStatus) -> Result<()> {
        let result = sqlx::query("UPDATE series_volumes SET status = $2 WHERE id = $1")
            .bind(volume_id.as_uuid())
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::Database(format!("unknown volume {volume_id}")));
        }
        Ok(())
    }

    async fn remove_volume(&self, volume_id: VolumeId) -> Result<()> {
        sqlx::query("DELETE FROM series_volumes WHERE id = $1")
            .bind(volume_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn unlink_volume_book(&self, volume_id: VolumeId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE series_volumes SET
                book_id = NULL,
                status = CASE WHEN status = 'owned' THEN 'missing' ELSE status END
            WHERE id = $1
            "#,
        )
        .bind(volume_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn book_exists(&self, book_id: BookId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 AS present FROM books WHERE id = $1")
            .bind(book_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn delete_book(&self, book_id: BookId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM books WHERE id = $1")
            .bind(book_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
