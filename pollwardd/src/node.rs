use pollward::api::Keys;
use pollward::{
    ClusterStatusView, CoordinationStore, Elector, ElectorStats, Parameters, StoreHandle,
    Supervisor,
};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

pub struct NodeCtrl {
    is_node_shutting_down: Arc<AtomicBool>,
}

impl NodeCtrl {
    pub fn stop(&self) {
        self.is_node_shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn install_signal_handler(&self) -> anyhow::Result<()> {
        debug!("Installing signal handler");
        for sig in TERM_SIGNALS {
            trace!(sig, "Installing signal handler");
            flag::register(*sig, Arc::clone(&self.is_node_shutting_down))?;
        }
        Ok(())
    }
}

/// One replica: an elector driving a supervisor until told to stop
pub struct Node {
    is_node_shutting_down: Arc<AtomicBool>,
    elector: Elector,
}

impl Node {
    const SHUTDOWN_POLL_PERIOD: Duration = Duration::from_millis(100);

    pub async fn new(
        params: Parameters,
        store: Arc<dyn CoordinationStore>,
        supervisor: Arc<dyn Supervisor>,
    ) -> anyhow::Result<Self> {
        info!(
            service = %params.service,
            instance = %params.instance_id,
            tick = ?params.tick_period,
            "lease-ttl" = ?params.lease_ttl,
            "Starting pollwardd"
        );
        let elector = Elector::start(params, store, supervisor).await?;

        Ok(Self {
            is_node_shutting_down: Arc::new(AtomicBool::new(false)),
            elector,
        })
    }

    pub fn get_ctrl(&self) -> NodeCtrl {
        NodeCtrl {
            is_node_shutting_down: self.is_node_shutting_down.clone(),
        }
    }

    pub fn elector(&self) -> &Elector {
        &self.elector
    }

    /// Run until stopped, then release leadership and deregister
    pub async fn wait(self) -> ElectorStats {
        while !self.is_node_shutting_down.load(Ordering::SeqCst) {
            tokio::time::sleep(Self::SHUTDOWN_POLL_PERIOD).await;
        }
        info!("Shutdown requested");

        self.elector.stop().await;
        let stats = self.elector.stats();
        info!(
            leadership_changes = stats.leadership_changes,
            updates_processed = stats.updates_processed,
            "Node stopped"
        );
        stats
    }
}

/// Cluster view as pretty-printed JSON
pub async fn cluster_status_json(store: StoreHandle, keys: Keys) -> anyhow::Result<String> {
    let snapshot = ClusterStatusView::new(store, keys).snapshot().await?;
    Ok(serde_json::to_string_pretty(&snapshot)?)
}
