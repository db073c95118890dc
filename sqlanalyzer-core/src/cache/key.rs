//! Cache key derivation.

use crate::connection::{ParamValue, QueryParam};
use crate::models::EngineKind;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Builds cache keys for query results and schema objects.
///
/// Query keys hash the statement and its parameters with the standard
/// library's fixed-key SipHash, so they are stable for the life of the
/// process, which is as long as the cache lives.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheKeyGenerator;

impl CacheKeyGenerator {
    /// Key for a query and its parameters.
    ///
    /// Parameter order matters; `@id = 1` and `@id = '1'` hash differently.
    pub fn for_query(query: &str, params: &[QueryParam]) -> String {
        let mut hasher = DefaultHasher::new();
        query.hash(&mut hasher);
        let base = hasher.finish();
        if params.is_empty() {
            return format!("query_{:016x}", base);
        }

        let mut hasher = DefaultHasher::new();
        for param in params {
            param.name.hash(&mut hasher);
            hash_value(&param.value, &mut hasher);
        }
        format!("query_{:016x}_{:016x}", base, hasher.finish())
    }

    /// Key for a schema object: `{engine}_{database}_{type}_{name}`, lowercased.
    pub fn for_object(
        engine: EngineKind,
        database: &str,
        object_type: &str,
        object_name: &str,
    ) -> String {
        format!(
            "{}_{}_{}_{}",
            engine.as_str(),
            database,
            object_type,
            object_name
        )
        .to_lowercase()
    }
}

fn hash_value(value: &ParamValue, hasher: &mut DefaultHasher) {
    match value {
        ParamValue::Null => 0u8.hash(hasher),
        ParamValue::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        ParamValue::Int(i) => {
            2u8.hash(hasher);
            i.hash(hasher);
        }
        ParamValue::Float(f) => {
            3u8.hash(hasher);
            f.to_bits().hash(hasher);
        }
        ParamValue::Text(s) => {
            4u8.hash(hasher);
            s.hash(hasher);
        }
    }
}
