//! Keeps the Caddyfile in step with the mesh.
//!
//! Deploys rewrite the gateway config themselves; this task covers the other
//! direction, when a peer appears, changes its routes, goes offline or
//! expires.

use std::sync::Arc;

use castle_mesh::MeshSnapshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pipeline::Deployer;

pub fn spawn_gateway_sync(
    deployer: Arc<Deployer>,
    mut mesh: watch::Receiver<MeshSnapshot>,
    apply: bool,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = mesh.changed() => {
                    if changed.is_err() {
                        debug!("Mesh snapshot channel closed; gateway sync idle");
                        break;
                    }
                    match deployer.sync_gateway(apply).await {
                        Ok(true) => info!("Gateway rewritten after mesh change"),
                        Ok(false) => {}
                        Err(e) => warn!(error = %e, "Gateway sync failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
