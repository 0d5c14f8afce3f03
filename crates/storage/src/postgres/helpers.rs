//! Shared helper functions for PostgreSQL row conversion.

use aesync_core::error::StorageError;
use aesync_core::error::StorageResult;
use aesync_core::models::PluginSidecar;

/// SQLSTATE of a unique-constraint violation.
const UNIQUE_VIOLATION: &str = "23505";

/// Map a sqlx error to a [`StorageError`].
///
/// Unique violations become `ConstraintViolation` so callers can treat
/// them as already applied.
pub fn query_error(e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            StorageError::ConstraintViolation(db.message().to_string())
        }
        _ => StorageError::QueryError(e.to_string()),
    }
}

/// Map a begin/commit failure.
pub fn transaction_error(e: sqlx::Error) -> StorageError {
    StorageError::TransactionError(e.to_string())
}

/// Convert a height to the `BIGINT` column type.
pub fn height_to_i64(height: u64, field_name: &str) -> StorageResult<i64> {
    i64::try_from(height).map_err(|_| {
        StorageError::SerializationError(format!("{field_name} out of range: {height}"))
    })
}

/// Convert a `BIGINT` column back to a height, rejecting negatives.
pub fn i64_to_height(value: i64, field_name: &str) -> StorageResult<u64> {
    u64::try_from(value).map_err(|_| {
        StorageError::SerializationError(format!("{field_name} is negative: {value}"))
    })
}

/// Convert an index or count to the `INTEGER` column type.
pub fn u32_to_i32(value: u32, field_name: &str) -> StorageResult<i32> {
    i32::try_from(value).map_err(|_| {
        StorageError::SerializationError(format!("{field_name} out of range: {value}"))
    })
}

/// Optional variant of [`i64_to_height`].
pub fn optional_height(value: Option<i64>, field_name: &str) -> StorageResult<Option<u64>> {
    value.map(|v| i64_to_height(v, field_name)).transpose()
}

/// Decode a `JSONB` sidecar column.
pub fn decode_sidecar(value: serde_json::Value, field_name: &str) -> StorageResult<PluginSidecar> {
    if value.is_null() {
        return Ok(PluginSidecar::new());
    }
    serde_json::from_value(value).map_err(|e| {
        StorageError::SerializationError(format!("{field_name} is not a plugin sidecar: {e}"))
    })
}

/// Encode a sidecar map for a `JSONB` column.
pub fn encode_sidecar(sidecar: &PluginSidecar) -> StorageResult<serde_json::Value> {
    serde_json::to_value(sidecar).map_err(|e| StorageError::SerializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aesync_core::models::VersionedEntry;
    use serde_json::json;

    // Test critique: une hauteur négative en base est une corruption
    #[test]
    fn test_negative_height_is_rejected() {
        let err = i64_to_height(-1, "transactions.block_height").unwrap_err();
        assert!(err.to_string().contains("transactions.block_height"));
        assert_eq!(optional_height(None, "x").unwrap(), None);
        assert_eq!(optional_height(Some(7), "x").unwrap(), Some(7));
    }

    // Test critique: un compteur au-delà d'INTEGER ne doit pas devenir négatif
    #[test]
    fn test_count_above_integer_is_rejected() {
        let err = u32_to_i32(u32::MAX, "key_block.transactions_count").unwrap_err();
        assert!(err.to_string().contains("key_block.transactions_count"));
        assert_eq!(u32_to_i32(i32::MAX as u32, "x").unwrap(), i32::MAX);
    }

    #[test]
    fn test_height_above_bigint_is_rejected() {
        assert!(height_to_i64(u64::MAX, "tip").is_err());
        assert_eq!(height_to_i64(42, "tip").unwrap(), 42);
    }

    // Test critique: le format `_version` survit à l'aller-retour JSONB
    #[test]
    fn test_sidecar_column_decoding() {
        let value = json!({"dex": {"_version": 3, "data": {"amount": 10}}});
        let sidecar = decode_sidecar(value.clone(), "transactions.data").unwrap();
        assert_eq!(
            sidecar.get("dex"),
            Some(&VersionedEntry {
                version: 3,
                data: json!({"amount": 10})
            })
        );
        assert_eq!(encode_sidecar(&sidecar).unwrap(), value);

        assert!(decode_sidecar(serde_json::Value::Null, "data").unwrap().is_empty());
        assert!(decode_sidecar(json!({"dex": 1}), "data").is_err());
    }

    #[test]
    fn test_non_database_error_is_query_error() {
        let err = query_error(sqlx::Error::RowNotFound);
        assert!(matches!(err, StorageError::QueryError(_)));
    }
}
