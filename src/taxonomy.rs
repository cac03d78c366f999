//! Distribution resolver: remote sets → taxonomy nodes.
//!
//! With auto-distribution enabled, every remote set becomes a child node of
//! the job's configured index, linked by its set spec. Harvested records are
//! then placed into the nodes linked to their `setSpec`s.

use anyhow::{anyhow, Result};
use tracing::{debug, info};

use crate::models::{IndexNode, NewIndexNode, OaiSet};
use crate::store::HarvestStore;

/// Create a child of `parent_id` for every set not yet linked under it.
///
/// New nodes inherit the parent's roles, are public, and are appended after
/// the highest existing sibling position. Returns the nodes created; a
/// second call with the same sets creates nothing.
pub async fn sync_taxonomy(
    store: &dyn HarvestStore,
    parent_id: i64,
    sets: &[OaiSet],
) -> Result<Vec<IndexNode>> {
    let parent = store
        .index_node(parent_id)
        .await?
        .ok_or_else(|| anyhow!("index {} does not exist", parent_id))?;

    let siblings = store.child_indexes(Some(parent_id)).await?;
    let mut position = siblings
        .iter()
        .map(|n| n.position)
        .max()
        .map(|p| p + 1)
        .unwrap_or(0);

    let mut created = Vec::new();
    for set in sets {
        if store.find_linked_index(parent_id, &set.spec).await?.is_some() {
            continue;
        }
        let node = store
            .create_index(&NewIndexNode {
                parent_id: Some(parent_id),
                index_name: set.name.clone(),
                index_name_english: set.name.clone(),
                harvest_spec: Some(set.spec.clone()),
                browsing_role: parent.browsing_role.clone(),
                contribute_role: parent.contribute_role.clone(),
                public_state: true,
                recursive_public_state: true,
                position,
            })
            .await?;
        debug!(index = node.id, spec = %set.spec, "created index for remote set");
        position += 1;
        created.push(node);
    }

    if !created.is_empty() {
        info!(parent = parent_id, created = created.len(), "taxonomy synchronized");
    }
    Ok(created)
}

/// Node ids linked to `set_specs` under `parent_id`, in input order.
///
/// Sets without a linked node contribute nothing.
pub async fn resolve_indexes(
    store: &dyn HarvestStore,
    set_specs: &[String],
    parent_id: i64,
) -> Result<Vec<i64>> {
    let mut ids = Vec::with_capacity(set_specs.len());
    for spec in set_specs {
        match store.find_linked_index(parent_id, spec).await? {
            Some(node) => ids.push(node.id),
            None => debug!(spec = %spec, parent = parent_id, "no index linked to set"),
        }
    }
    Ok(ids)
}
