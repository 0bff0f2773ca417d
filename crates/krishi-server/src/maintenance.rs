use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use krishi_db::models::{PurgeReport, ReconcileReport};
use krishi_db::{Database, Result};

/// Background task that repairs counter drift and prunes expired auth state.
pub async fn run_maintenance_loop(db: Arc<Database>, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        match run_once(&db).await {
            Ok((repaired, purged)) => {
                if repaired.total() > 0 || purged.total() > 0 {
                    info!(
                        "Maintenance: repaired {} counters, purged {} expired rows",
                        repaired.total(),
                        purged.total()
                    );
                }
            }
            Err(e) => {
                warn!("Maintenance error: {}", e);
            }
        }
    }
}

pub async fn run_once(db: &Arc<Database>) -> Result<(ReconcileReport, PurgeReport)> {
    let repaired = db.call(|db| db.reconcile_counters()).await?;
    let purged = db.call(|db| db.purge_expired()).await?;
    Ok((repaired, purged))
}
