//! `Array` backend (§4.2): one typed array column per partition, the
//! simplest relational representation. Grounded on `lakehouse/
//! partition_cache.rs`'s raw `sqlx::query` + `Row::try_get` style rather than
//! the query builder, since the column type (and therefore the Rust type
//! `try_get` must decode into) depends on the partition's registered
//! datatype and is only known at runtime.

use crate::error::{CacheError, Result};
use crate::relational::{self, cache_table_name};
use crate::CacheBackend;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use partitioncache_core::{lock, CacheStatus, Datatype, FragmentHash, PartitionValue};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::RwLock;

pub const BACKEND_ID: &str = "array_pg";

pub struct ArrayBackend {
    pool: PgPool,
    prefix: String,
    datatypes: RwLock<HashMap<String, Datatype>>,
}

impl ArrayBackend {
    pub fn new(pool: PgPool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            datatypes: RwLock::new(HashMap::new()),
        }
    }

    async fn datatype_of(&self, pk: &str) -> Result<Datatype> {
        if let Some(dt) = self.datatypes.read().unwrap().get(pk) {
            return Ok(*dt);
        }
        let partitions = relational::list_partitions(&self.pool, &self.prefix).await?;
        let mut cache = self.datatypes.write().unwrap();
        for (k, v) in partitions {
            cache.insert(k, v);
        }
        cache
            .get(pk)
            .copied()
            .ok_or_else(|| CacheError::InvalidArgument(format!("partition key '{pk}' is not registered")))
    }

    fn table(&self, pk: &str) -> String {
        cache_table_name(&self.prefix, pk)
    }
}

fn column_type(datatype: Datatype) -> Result<&'static str> {
    match datatype {
        Datatype::Integer => Ok("BIGINT[]"),
        Datatype::Float => Ok("DOUBLE PRECISION[]"),
        Datatype::Text => Ok("TEXT[]"),
        Datatype::Timestamp => Ok("TIMESTAMPTZ[]"),
        Datatype::Geometry => Err(CacheError::DatatypeUnsupported {
            backend: BACKEND_ID.to_string(),
            datatype,
        }),
    }
}

#[async_trait]
impl CacheBackend for ArrayBackend {
    fn backend_id(&self) -> &'static str {
        BACKEND_ID
    }

    async fn register_partition_key(&self, pk: &str, datatype: Datatype) -> Result<()> {
        let col_type = column_type(datatype)?;
        let table = self.table(pk);
        let create_sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                query_hash TEXT PRIMARY KEY,
                partition_keys {col_type},
                partition_keys_count INT GENERATED ALWAYS AS (COALESCE(array_length(partition_keys, 1), 0)) STORED,
                is_null BOOLEAN NOT NULL DEFAULT false,
                status TEXT NOT NULL DEFAULT 'ok',
                last_seen TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        );
        relational::register_partition_key(&self.pool, &self.prefix, pk, datatype, None, &create_sql).await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_gin ON {table} USING GIN (partition_keys)"
        ))
        .execute(&self.pool)
        .await?;
        self.datatypes.write().unwrap().insert(pk.to_string(), datatype);
        Ok(())
    }

    async fn set(&self, hash: &FragmentHash, values: &[PartitionValue], pk: &str) -> Result<bool> {
        let datatype = self.datatype_of(pk).await?;
        let table = self.table(pk);
        let sql = format!(
            "INSERT INTO {table} (query_hash, partition_keys, is_null, last_seen)
             VALUES ($1, $2, false, now())
             ON CONFLICT (query_hash)
             DO UPDATE SET partition_keys = EXCLUDED.partition_keys, is_null = false, last_seen = now()"
        );
        match datatype {
            Datatype::Integer => {
                let v: Vec<i64> = values.iter().map(|p| p.as_integer()).collect::<partitioncache_core::Result<_>>()?;
                sqlx::query(&sql).bind(hash.as_str()).bind(v).execute(&self.pool).await?;
            }
            Datatype::Float => {
                let v: Vec<f64> = values
                    .iter()
                    .map(|p| match p {
                        PartitionValue::Float(f) => Ok(*f),
                        other => Err(CacheError::InvalidArgument(format!("expected float, got {other}"))),
                    })
                    .collect::<Result<_>>()?;
                sqlx::query(&sql).bind(hash.as_str()).bind(v).execute(&self.pool).await?;
            }
            Datatype::Text => {
                let v: Vec<String> = values.iter().map(|p| p.to_string()).collect();
                sqlx::query(&sql).bind(hash.as_str()).bind(v).execute(&self.pool).await?;
            }
            Datatype::Timestamp => {
                let v: Vec<DateTime<Utc>> = values
                    .iter()
                    .map(|p| match p {
                        PartitionValue::Timestamp(t) => Ok(*t),
                        other => Err(CacheError::InvalidArgument(format!("expected timestamp, got {other}"))),
                    })
                    .collect::<Result<_>>()?;
                sqlx::query(&sql).bind(hash.as_str()).bind(v).execute(&self.pool).await?;
            }
            Datatype::Geometry => {
                return Err(CacheError::DatatypeUnsupported {
                    backend: BACKEND_ID.to_string(),
                    datatype,
                })
            }
        }
        Ok(true)
    }

    async fn set_lazy(&self, hash: &FragmentHash, fragment_sql: &str, pk: &str) -> Result<bool> {
        let datatype = self.datatype_of(pk).await?;
        if datatype != Datatype::Integer && datatype != Datatype::Text {
            return Err(CacheError::InvalidArgument(
                "set_lazy only supports integer/text array partitions in this backend".to_string(),
            ));
        }
        let table = self.table(pk);
        sqlx::query(&format!(
            "INSERT INTO {table} (query_hash, partition_keys, is_null, last_seen)
             SELECT $1, array_agg(DISTINCT t.v), false, now()
             FROM ({fragment_sql}) AS t(v)
             ON CONFLICT (query_hash)
             DO UPDATE SET partition_keys = EXCLUDED.partition_keys, is_null = false, last_seen = now()"
        ))
        .bind(hash.as_str())
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    async fn get(&self, hash: &FragmentHash, pk: &str) -> Result<Option<Vec<PartitionValue>>> {
        let datatype = self.datatype_of(pk).await?;
        let table = self.table(pk);
        let row = sqlx::query(&format!(
            "SELECT partition_keys, is_null FROM {table} WHERE query_hash = $1"
        ))
        .bind(hash.as_str())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let is_null: bool = row.try_get("is_null")?;
        if is_null {
            return Ok(None);
        }
        Ok(Some(decode_values(&row, datatype)?))
    }

    async fn get_intersected(
        &self,
        hashes: &[FragmentHash],
        pk: &str,
    ) -> Result<(Option<Vec<PartitionValue>>, usize)> {
        let mut sets = Vec::new();
        let mut hits = 0usize;
        for hash in hashes {
            if let Some(values) = self.get(hash, pk).await? {
                hits += 1;
                sets.push(values);
            }
        }
        if sets.is_empty() {
            return Ok((None, hits));
        }
        Ok((Some(crate::intersect_value_sets(sets)), hits))
    }

    async fn get_intersected_lazy(
        &self,
        hashes: &[FragmentHash],
        pk: &str,
    ) -> Result<(Option<String>, usize)> {
        let existing = self.filter_existing(hashes, pk).await?;
        if existing.is_empty() {
            return Ok((None, 0));
        }
        let table = self.table(pk);
        let mut snippet = String::from("SELECT unnest(partition_keys) FROM (VALUES ");
        let rows: Vec<String> = existing.iter().map(|h| format!("('{}')", h.as_str())).collect();
        snippet.push_str(&rows.join(", "));
        snippet.push_str(&format!(") AS hashes(h) JOIN {table} ON query_hash = hashes.h"));
        Ok((Some(snippet), existing.len()))
    }

    async fn exists(&self, hash: &FragmentHash, pk: &str) -> Result<bool> {
        let table = self.table(pk);
        let row = sqlx::query(&format!("SELECT 1 AS present FROM {table} WHERE query_hash = $1"))
            .bind(hash.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn filter_existing(&self, hashes: &[FragmentHash], pk: &str) -> Result<Vec<FragmentHash>> {
        let mut out = Vec::new();
        for hash in hashes {
            if self.exists(hash, pk).await? {
                out.push(hash.clone());
            }
        }
        Ok(out)
    }

    async fn delete(&self, hash: &FragmentHash, pk: &str) -> Result<bool> {
        let table = self.table(pk);
        let mut tx = self.pool.begin().await?;
        lock::acquire(&mut *tx, lock::namespace::CACHE_ENTRY, &lock::cache_entry_key(pk, hash.as_str())).await?;
        let result = sqlx::query(&format!("DELETE FROM {table} WHERE query_hash = $1"))
            .bind(hash.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_null(&self, hash: &FragmentHash, pk: &str) -> Result<()> {
        let table = self.table(pk);
        sqlx::query(&format!(
            "INSERT INTO {table} (query_hash, partition_keys, is_null, last_seen)
             VALUES ($1, NULL, true, now())
             ON CONFLICT (query_hash) DO UPDATE SET partition_keys = NULL, is_null = true, last_seen = now()"
        ))
        .bind(hash.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_null(&self, hash: &FragmentHash, pk: &str) -> Result<bool> {
        let table = self.table(pk);
        let row = sqlx::query(&format!("SELECT is_null FROM {table} WHERE query_hash = $1"))
            .bind(hash.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok(r.try_get("is_null")?),
            None => Ok(false),
        }
    }

    async fn set_status(&self, hash: &FragmentHash, pk: &str, status: CacheStatus) -> Result<()> {
        let table = self.table(pk);
        sqlx::query(&format!(
            "UPDATE {table} SET status = $1 WHERE query_hash = $2"
        ))
        .bind(status.as_str())
        .bind(hash.as_str())
        .execute(&self.pool)
        .await?;
        relational::set_status(&self.pool, &self.prefix, hash.as_str(), pk, status.as_str()).await?;
        Ok(())
    }

    async fn get_status(&self, hash: &FragmentHash, pk: &str) -> Result<Option<CacheStatus>> {
        let table = self.table(pk);
        let row = sqlx::query(&format!("SELECT status FROM {table} WHERE query_hash = $1"))
            .bind(hash.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let s: String = r.try_get("status")?;
            Ok(CacheStatus::parse(&s).unwrap_or(CacheStatus::Ok))
        })
        .transpose()
    }

    async fn set_query(&self, hash: &FragmentHash, text: &str, pk: &str) -> Result<()> {
        relational::set_query(&self.pool, &self.prefix, hash.as_str(), pk, text).await
    }

    async fn get_query(&self, hash: &FragmentHash, pk: &str) -> Result<Option<String>> {
        relational::get_query(&self.pool, &self.prefix, hash.as_str(), pk).await
    }

    async fn list_queries(&self, pk: &str) -> Result<Vec<(FragmentHash, String)>> {
        let rows = relational::list_queries(&self.pool, &self.prefix, pk).await?;
        Ok(rows
            .into_iter()
            .map(|(h, q)| (FragmentHash::from_hex(h), q))
            .collect())
    }

    async fn partitions(&self) -> Result<Vec<(String, Datatype)>> {
        relational::list_partitions(&self.pool, &self.prefix).await
    }
}

fn decode_values(row: &sqlx::postgres::PgRow, datatype: Datatype) -> Result<Vec<PartitionValue>> {
    Ok(match datatype {
        Datatype::Integer => row
            .try_get::<Vec<i64>, _>("partition_keys")?
            .into_iter()
            .map(PartitionValue::Integer)
            .collect(),
        Datatype::Float => row
            .try_get::<Vec<f64>, _>("partition_keys")?
            .into_iter()
            .map(PartitionValue::Float)
            .collect(),
        Datatype::Text => row
            .try_get::<Vec<String>, _>("partition_keys")?
            .into_iter()
            .map(PartitionValue::Text)
            .collect(),
        Datatype::Timestamp => row
            .try_get::<Vec<DateTime<Utc>>, _>("partition_keys")?
            .into_iter()
            .map(PartitionValue::Timestamp)
            .collect(),
        Datatype::Geometry => {
            return Err(CacheError::DatatypeUnsupported {
                backend: BACKEND_ID.to_string(),
                datatype,
            })
        }
    })
}
