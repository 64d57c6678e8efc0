use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// The datatype a partition key is registered with. Chosen once, at
/// registration time, and immutable afterwards (§3 invariants).
///
/// Stored as plain `TEXT` in the metadata tables (see `partitioncache-cache`),
/// so it round-trips through `as_str`/`FromStr` rather than a custom SQL enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Datatype {
    Integer,
    Float,
    Text,
    Timestamp,
    Geometry,
}

impl Datatype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Datatype::Integer => "integer",
            Datatype::Float => "float",
            Datatype::Text => "text",
            Datatype::Timestamp => "timestamp",
            Datatype::Geometry => "geometry",
        }
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Datatype {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "integer" | "int" | "bigint" => Ok(Datatype::Integer),
            "float" | "double" | "real" => Ok(Datatype::Float),
            "text" | "varchar" | "string" => Ok(Datatype::Text),
            "timestamp" | "timestamptz" => Ok(Datatype::Timestamp),
            "geometry" | "geography" => Ok(Datatype::Geometry),
            other => Err(Error::InvalidArgument(format!(
                "unknown partition key datatype '{other}'"
            ))),
        }
    }
}

/// A single partition-key value of the partition's declared [`Datatype`].
///
/// Cache backends store *sets* of these; which variant a set may hold is
/// fixed by the partition's datatype, not by the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Geometry(String), // WKT/EWKT text; interpreted by the source database.
}

impl PartitionValue {
    pub fn datatype(&self) -> Datatype {
        match self {
            PartitionValue::Integer(_) => Datatype::Integer,
            PartitionValue::Float(_) => Datatype::Float,
            PartitionValue::Text(_) => Datatype::Text,
            PartitionValue::Timestamp(_) => Datatype::Timestamp,
            PartitionValue::Geometry(_) => Datatype::Geometry,
        }
    }

    pub fn as_integer(&self) -> Result<i64> {
        match self {
            PartitionValue::Integer(v) => Ok(*v),
            other => Err(Error::DatatypeConflict {
                partition_key: String::new(),
                registered: Datatype::Integer.to_string(),
                attempted: other.datatype().to_string(),
            }),
        }
    }
}

impl fmt::Display for PartitionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionValue::Integer(v) => write!(f, "{v}"),
            PartitionValue::Float(v) => write!(f, "{v}"),
            PartitionValue::Text(v) => write!(f, "{v}"),
            PartitionValue::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            PartitionValue::Geometry(v) => write!(f, "{v}"),
        }
    }
}

/// Which backend-capability sets support which datatype, keyed purely by
/// backend identifier so the factory in `partitioncache-cache` can validate
/// `register_partition_key` without depending on the concrete backend types.
pub fn backend_supports(backend_id: &str, datatype: Datatype) -> bool {
    use Datatype::*;
    match backend_id {
        "array_pg" => matches!(datatype, Integer | Float | Text | Timestamp),
        "bit_pg" | "bit_kv" => matches!(datatype, Integer),
        "roaring_pg" | "roaring_kv" => matches!(datatype, Integer),
        "set_kv" => matches!(datatype, Integer | Text),
        "spatial_h3" | "spatial_bbox" => matches!(datatype, Geometry),
        _ => false,
    }
}
