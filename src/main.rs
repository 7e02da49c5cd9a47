//! nats-glued daemon entry point.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

mod config;
mod controller;
mod directory;
mod error;
mod plan;
mod reconciler;
mod render;
mod runtime;
mod types;

use config::Config;
use controller::ServiceController;
use directory::{AddressDirectory, DirectoryStore, FileDirectory, MemoryDirectory};
use reconciler::{ReconcileSettings, Reconciler, SERVICE_NAME};
use runtime::{DockerRuntime, DockerSettings};
use types::{PeerAddress, Status, TriggerKind, UnitId};

/// Work items for the reconciler task.
#[derive(Debug)]
enum Event {
    Trigger(TriggerKind),
    Reload(Box<ReconcileSettings>),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting nats-glued with config: {:?}", cfg);
    for warning in cfg.warnings() {
        warn!("{}", warning);
    }

    // Peer directory
    let address = cfg.advertise_address().await?;
    let store: Arc<dyn DirectoryStore> = match &cfg.directory_path {
        Some(path) => Arc::new(FileDirectory::open(path).await?),
        None => {
            warn!("No directory_path configured, running standalone");
            Arc::new(MemoryDirectory::new())
        }
    };
    let directory = AddressDirectory::new(UnitId::new(cfg.unit_id.clone()), address, store);
    info!(
        "Advertising {} as {}",
        directory.own_address(),
        directory.unit()
    );

    // Supervisor (Docker)
    let runtime = match connect_runtime(cfg.docker_settings()).await {
        Some(runtime) => runtime,
        None => return Ok(()),
    };
    let controller = ServiceController::new(Arc::new(runtime));
    let mut reconciler = Reconciler::new(
        directory.clone(),
        controller,
        cfg.reconcile_settings(),
    );
    let rendered = reconciler.subscribe();

    // Trigger channel
    let (event_tx, mut event_rx) = mpsc::channel(16);

    // Reconciler: one pass at a time, in trigger order
    let status_file = cfg.status_file.clone();
    let reconcile_handle = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let trigger = match event {
                Event::Trigger(kind) => kind,
                Event::Reload(settings) => {
                    reconciler.update_settings(*settings);
                    TriggerKind::ConfigChanged
                }
            };
            let status = reconciler.reconcile(trigger).await;
            report_status(&status, status_file.as_ref()).await;
            match reconciler.controller().state(SERVICE_NAME).await {
                Ok(state) => debug!("Service {} is {:?}", SERVICE_NAME, state),
                Err(e) => warn!("Failed to query service state: {}", e),
            }
        }
    });

    if event_tx.send(Event::Trigger(TriggerKind::Ready)).await.is_err() {
        anyhow::bail!("Reconciler stopped before the first pass");
    }

    // Membership watcher
    let watch_directory = directory.clone();
    let watch_tx = event_tx.clone();
    let poll_interval = cfg.poll_interval();
    let watch_handle = tokio::spawn(async move {
        watch_membership(watch_directory, rendered, poll_interval, watch_tx).await;
    });

    // Configuration reload on SIGHUP
    let reload_tx = event_tx.clone();
    let docker_settings = cfg.docker_settings();
    let reload_handle = tokio::spawn(async move {
        if let Err(e) = reload_on_hangup(reload_tx, docker_settings).await {
            error!("Configuration reload handler failed: {}", e);
        }
    });

    // Graceful Shutdown
    let mut terminate = unix_signal(SignalKind::terminate())?;
    tokio::select! {
        res = signal::ctrl_c() => match res {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        },
        _ = terminate.recv() => info!("Received SIGTERM, shutting down..."),
    }

    // Abort trigger sources; a pass in flight is allowed to finish.
    watch_handle.abort();
    reload_handle.abort();
    let _ = watch_handle.await;
    let _ = reload_handle.await;
    drop(event_tx);
    if let Err(e) = reconcile_handle.await {
        error!("Reconciler task failed: {}", e);
    }

    // Leaving the peer group lets the remaining peers drop our route.
    if let Err(e) = directory.depart().await {
        warn!("Failed to remove own directory entry: {}", e);
    }

    info!("Shutdown complete.");
    Ok(())
}

/// Connects to Docker, retrying until it answers or Ctrl+C is pressed.
async fn connect_runtime(settings: DockerSettings) -> Option<DockerRuntime> {
    loop {
        match DockerRuntime::connect(settings.clone()).await {
            Ok(runtime) => return Some(runtime),
            Err(e) => {
                error!("Failed to connect to Docker: {}. Retrying in 5s...", e);
                tokio::select! {
                    _ = sleep(Duration::from_secs(5)) => {}
                    _ = signal::ctrl_c() => return None,
                }
            }
        }
    }
}

/// Polls the directory and requests a pass whenever the address set differs
/// from the one the reconciler last rendered.
///
/// A set is requested once; a failed poll forgets the request so the pass
/// is asked for again once the directory answers.
async fn watch_membership(
    directory: AddressDirectory,
    rendered: watch::Receiver<Option<BTreeSet<PeerAddress>>>,
    period: Duration,
    tx: mpsc::Sender<Event>,
) {
    // The startup pass renders before the first poll.
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut requested: Option<BTreeSet<PeerAddress>> = None;

    loop {
        ticker.tick().await;
        let current = match directory.list_all_addresses().await {
            Ok(current) => current,
            Err(e) => {
                warn!("Membership poll failed: {}", e);
                requested = None;
                continue;
            }
        };

        let stale = rendered.borrow().as_ref() != Some(&current);
        if stale && requested.as_ref() != Some(&current) {
            info!(
                "Peer membership differs from the rendered configuration ({} peers)",
                current.len()
            );
            if tx
                .send(Event::Trigger(TriggerKind::MembershipChanged))
                .await
                .is_err()
            {
                return;
            }
            requested = Some(current);
        }
    }
}

async fn reload_on_hangup(
    tx: mpsc::Sender<Event>,
    connected: DockerSettings,
) -> anyhow::Result<()> {
    let mut hangup = unix_signal(SignalKind::hangup())?;
    while hangup.recv().await.is_some() {
        info!("Received SIGHUP, reloading configuration");
        match Config::load() {
            Ok(cfg) => {
                for warning in cfg.warnings() {
                    warn!("{}", warning);
                }
                if connected.fixed_fields_differ(&cfg.docker_settings()) {
                    warn!(
                        "Changes to unit_id, network_name, config_dir and start_grace_ms \
                         take effect after nats-glued restarts"
                    );
                }
                let settings = Box::new(cfg.reconcile_settings());
                if tx.send(Event::Reload(settings)).await.is_err() {
                    break;
                }
            }
            Err(e) => error!("Keeping previous configuration: {}", e),
        }
    }
    Ok(())
}

async fn report_status(status: &Status, path: Option<&PathBuf>) {
    if status.is_active() {
        info!("Status: {}", status);
    } else {
        warn!("Status: {}", status);
    }

    let Some(path) = path else { return };
    let written = match serde_json::to_vec(status) {
        Ok(bytes) => tokio::fs::write(path, bytes).await.map_err(anyhow::Error::from),
        Err(e) => Err(e.into()),
    };
    if let Err(e) = written {
        error!("Failed to write status to {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const PERIOD: Duration = Duration::from_millis(20);

    fn addresses(list: &[&str]) -> BTreeSet<PeerAddress> {
        list.iter().map(|a| PeerAddress::parse(a).unwrap()).collect()
    }

    fn spawn_watcher(
        store: &MemoryDirectory,
        rendered: watch::Receiver<Option<BTreeSet<PeerAddress>>>,
    ) -> (JoinHandle<()>, mpsc::Receiver<Event>) {
        let directory = AddressDirectory::new(
            UnitId::new("nats-0"),
            PeerAddress::parse("10.0.0.1").unwrap(),
            Arc::new(store.clone()),
        );
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(watch_membership(directory, rendered, PERIOD, tx));
        (handle, rx)
    }

    async fn next_trigger(rx: &mut mpsc::Receiver<Event>) -> Option<TriggerKind> {
        match timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(Event::Trigger(kind))) => Some(kind),
            _ => None,
        }
    }

    #[tokio::test]
    async fn recovered_directory_requests_a_pass() {
        let store = MemoryDirectory::new();
        store.set_available(false);
        let (_rendered_tx, rendered) = watch::channel(None);
        let (handle, mut rx) = spawn_watcher(&store, rendered);

        sleep(PERIOD * 3).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        store.set_available(true);
        assert_eq!(
            next_trigger(&mut rx).await,
            Some(TriggerKind::MembershipChanged)
        );
        handle.abort();
    }

    #[tokio::test]
    async fn outage_after_request_asks_again_on_recovery() {
        let store = MemoryDirectory::new();
        let (_rendered_tx, rendered) = watch::channel(None);
        let (handle, mut rx) = spawn_watcher(&store, rendered);

        assert!(next_trigger(&mut rx).await.is_some());
        sleep(PERIOD * 3).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        store.set_available(false);
        sleep(PERIOD * 3).await;
        store.set_available(true);
        assert!(next_trigger(&mut rx).await.is_some());
        handle.abort();
    }

    #[tokio::test]
    async fn rendered_membership_needs_no_pass() {
        let store = MemoryDirectory::new();
        let (rendered_tx, rendered) = watch::channel(Some(addresses(&["10.0.0.1"])));
        let (handle, mut rx) = spawn_watcher(&store, rendered);

        sleep(PERIOD * 5).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        store
            .put(&UnitId::new("nats-1"), directory::ADDRESS_KEY, "10.0.0.2")
            .await
            .unwrap();
        assert!(next_trigger(&mut rx).await.is_some());

        rendered_tx.send_replace(Some(addresses(&["10.0.0.1", "10.0.0.2"])));
        sleep(PERIOD * 3).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        handle.abort();
    }
}
