//! Shared plumbing for the two spatial backend variants (§9 "Spatial
//! handlers share a common base"): both [`spatial_h3`][crate::relational::spatial_h3]
//! and [`spatial_bbox`][crate::relational::spatial_bbox] are Geometry-only,
//! both require the `postgis` extension, and both keep their query/status
//! bookkeeping in the same shared `_queries` table as every other relational
//! backend — only the intersection representation differs.

use crate::error::{CacheError, Result};
use partitioncache_core::Datatype;
use sqlx::PgPool;

/// Both spatial backends only ever register `Geometry` partition keys;
/// everything else is a configuration mistake, not a data question.
pub fn require_geometry_datatype(backend_id: &'static str, datatype: Datatype) -> Result<()> {
    if datatype != Datatype::Geometry {
        return Err(CacheError::DatatypeUnsupported {
            backend: backend_id.to_string(),
            datatype,
        });
    }
    Ok(())
}

/// Idempotent; both backends call this before creating their cache table
/// since neither H3 indexing nor `ST_Intersection` need PostGIS types
/// directly, but the source geometries they're built from do.
pub async fn ensure_postgis_extension(pool: &PgPool) -> Result<()> {
    sqlx::query("CREATE EXTENSION IF NOT EXISTS postgis")
        .execute(pool)
        .await?;
    Ok(())
}
