//! Document identity resolution.
//!
//! Re-running the pipeline for a case must never mint a second document for
//! a material that already has one. The [`IdentityResolver`] answers "which
//! document id already owns this `(case, material)` pair?" by reading the
//! document store; it performs no writes and is safe to share across
//! concurrently running partitions.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::models::CLAIMED_PHASES;
use crate::store::DocumentStore;

pub struct IdentityResolver {
    store: Arc<dyn DocumentStore>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Returns the id of the most recently transitioned document for this
    /// pair whose phase is one of [`CLAIMED_PHASES`].
    ///
    /// `Ok(None)` means a new id must be minted. Errors are reserved for
    /// store failures.
    pub async fn resolve_existing_id(
        &self,
        case_id: &str,
        material_id: &str,
    ) -> Result<Option<String>> {
        let found = self
            .store
            .find_latest_in_phases(case_id, material_id, &CLAIMED_PHASES)
            .await
            .with_context(|| {
                format!(
                    "identity lookup failed for case {} material {}",
                    case_id, material_id
                )
            })?;
        Ok(found.map(|d| d.doc_id))
    }
}
