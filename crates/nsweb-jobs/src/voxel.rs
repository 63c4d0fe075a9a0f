//! Voxel lookup: values of every reference map at one MNI coordinate.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use nsweb_core::{Error, JobType, Result, VoxelLookupPayload, VoxelValue};

use crate::handler::{JobContext, JobHandler, JobResult};
use crate::reference::{ReferenceLibrary, ReferenceSet};

fn finite(v: f32) -> Option<f64> {
    v.is_finite().then_some(v as f64)
}

/// Rows for the voxel nearest `(x, y, z)`, in analysis order.
pub fn lookup(
    set: &ReferenceSet,
    x: i32,
    y: i32,
    z: i32,
    include_posterior: bool,
) -> Result<Vec<VoxelValue>> {
    let idx = set
        .grid
        .world_to_index(x as f64, y as f64, z as f64)
        .ok_or_else(|| {
            Error::Validation(format!(
                "coordinate ({}, {}, {}) is outside the {} volume",
                x, y, z, set.name
            ))
        })?;

    Ok(set
        .maps
        .iter()
        .filter_map(|map| {
            let z = finite(map.values[idx])?;
            let pp = if include_posterior {
                map.posterior.as_ref().and_then(|p| finite(p[idx]))
            } else {
                None
            };
            Some(VoxelValue {
                analysis: map.analysis.clone(),
                z,
                pp,
            })
        })
        .collect())
}

/// Handler for [`JobType::VoxelLookup`].
pub struct VoxelHandler {
    library: Arc<ReferenceLibrary>,
}

impl VoxelHandler {
    pub fn new(library: Arc<ReferenceLibrary>) -> Self {
        Self { library }
    }
}

#[async_trait]
impl JobHandler for VoxelHandler {
    fn job_type(&self) -> JobType {
        JobType::VoxelLookup
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let payload: VoxelLookupPayload = match ctx.typed_payload() {
            Ok(p) => p,
            Err(e) => return JobResult::Failed(e),
        };
        let library = self.library.clone();
        let p = payload.clone();

        let rows = tokio::task::spawn_blocking(move || {
            let set = library.get(&p.reference)?;
            lookup(&set, p.x, p.y, p.z, p.include_posterior)
        })
        .await
        .map_err(|e| Error::Internal(format!("voxel lookup task panicked: {}", e)))
        .and_then(|r| r);

        match rows.and_then(|rows| serde_json::to_value(&rows).map_err(Error::from)) {
            Ok(value) => {
                debug!(
                    subsystem = "jobs",
                    component = "voxel",
                    reference = %payload.reference,
                    x = payload.x,
                    y = payload.y,
                    z = payload.z,
                    "Voxel lookup answered"
                );
                JobResult::Success(Some(value))
            }
            Err(e) => JobResult::Failed(e.to_string()),
        }
    }
}
