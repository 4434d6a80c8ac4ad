//! Fan-in of partition results into material → document mappings.

use std::collections::BTreeMap;

use anyhow::Result;
use uuid::Uuid;

use crate::identity::IdentityResolver;
use crate::models::{MaterialDocumentMapping, PartitionResult};

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Merges per-partition results into one map keyed by material id.
///
/// Results without a usable case id or material id are skipped with a
/// warning. For every other result the resolver is asked for an existing
/// document; if none exists a fresh UUID is minted. Later results for the
/// same material overwrite earlier ones.
///
/// A resolver (store) failure aborts the whole call.
pub async fn aggregate_materials(
    results: &[PartitionResult],
    resolver: &IdentityResolver,
) -> Result<BTreeMap<String, MaterialDocumentMapping>> {
    let mut merged = BTreeMap::new();

    for (idx, result) in results.iter().enumerate() {
        let case_id = match non_blank(&result.case_id) {
            Some(c) => c,
            None => {
                tracing::warn!(partition = idx, "skipping result without case id");
                continue;
            }
        };
        let material_id = match non_blank(&result.material_id) {
            Some(m) => m,
            None => {
                tracing::warn!(partition = idx, case_id, "skipping result without material id");
                continue;
            }
        };
        let material_name = non_blank(&result.material_name).unwrap_or(material_id);

        let mapping = match resolver.resolve_existing_id(case_id, material_id).await? {
            Some(existing) => {
                tracing::debug!(case_id, material_id, doc_id = %existing, "reusing document id");
                MaterialDocumentMapping::reused(case_id, material_id, material_name, existing)
            }
            None => {
                let minted = Uuid::new_v4().to_string();
                tracing::debug!(case_id, material_id, doc_id = %minted, "minted document id");
                MaterialDocumentMapping::minted(case_id, material_id, material_name, minted)
            }
        };
        merged.insert(material_id.to_string(), mapping);
    }

    Ok(merged)
}
