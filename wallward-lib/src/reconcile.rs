//! Drives the kernel's rule set to match the set of running labeled
//! containers. One initial full sync, then the runtime's start/die event
//! stream; a dropped stream triggers a resync before resubscribing, so no
//! missed event can leave the kernel stale. Every container gets one
//! ordered worker that drains its events in arrival order, so distinct
//! containers proceed in parallel while a start/die pair for the same id
//! can never swap; a keyed mutex additionally fences the full-sync path
//! from touching a container its worker is mid-flight on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::applier::{Applier, ApplyError};
use crate::codec;
use crate::docker::{ContainerRuntime, EventKind, RuntimeError, RuntimeEvent};
use crate::nft::{
    container_chain, Firewall, FirewallError, NftOp, BASE_ANNOTATION, CONTAINERS_CHAIN,
    DISPATCH_CHAIN, FORWARD_CHAIN, INPUT_CHAIN, OUTPUT_CHAIN,
};
use crate::policy::Policy;
use crate::store::{Store, StoreError};
use crate::topology::Topology;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Firewall(#[from] FirewallError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
}

pub struct Reconciler {
    runtime: Arc<dyn ContainerRuntime>,
    fw: Arc<dyn Firewall>,
    store: Store,
    applier: Applier,
    topology: Topology,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    workers: Mutex<HashMap<String, mpsc::UnboundedSender<EventKind>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Reconciler {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        fw: Arc<dyn Firewall>,
        store: Store,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Reconciler {
            runtime,
            fw: fw.clone(),
            store: store.clone(),
            applier: Applier::new(fw.clone(), store),
            topology: Topology::new(fw),
            locks: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            cancel,
            tracker: TaskTracker::new(),
        })
    }

    /// Installs the base topology, reconciles current state and starts
    /// consuming the event stream in the background.
    pub async fn start(self: &Arc<Self>) -> Result<(), ReconcileError> {
        self.topology.ensure().await?;
        self.sync().await?;
        let this = Arc::clone(self);
        self.tracker.spawn(this.run());
        Ok(())
    }

    /// Cancels the event loop and waits for in-flight per-container work.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Full state sync: repair unanchored kernel state, tear down records
    /// whose container is gone, apply every running labeled container.
    pub async fn sync(&self) -> Result<(), ReconcileError> {
        let running = self.runtime.running().await?;
        self.repair().await?;

        for (id, _) in self.store.all()? {
            if !running.contains(&id) {
                tracing::info!(%id, "record without running container");
                self.handle_die(&id).await;
            }
        }
        for id in running {
            self.handle_start(&id).await;
        }
        Ok(())
    }

    /// Removes every owned rule whose annotation matches no persistent
    /// record, and every per-container chain no record claims. Rules
    /// without an annotation belong to other tools and are left alone.
    async fn repair(&self) -> Result<(), ReconcileError> {
        if !self.fw.table_exists().await? {
            return Ok(());
        }
        let records: HashMap<String, _> = self.store.all()?.into_iter().collect();
        let shared = [
            INPUT_CHAIN,
            OUTPUT_CHAIN,
            FORWARD_CHAIN,
            DISPATCH_CHAIN,
            CONTAINERS_CHAIN,
        ];

        let mut batch = Vec::new();
        for chain in self.fw.list_chains().await? {
            if !shared.contains(&chain.as_str()) {
                let claimed = records
                    .iter()
                    .any(|(id, r)| container_chain(&r.name, id) == chain);
                if !claimed {
                    tracing::warn!(%chain, "removing unanchored container chain");
                    batch.push(NftOp::DeleteChain { name: chain });
                    continue;
                }
            }
            for rule in self.fw.list_rules(&chain).await? {
                let Some(annotation) = &rule.annotation else {
                    continue;
                };
                if annotation.as_slice() == BASE_ANNOTATION {
                    continue;
                }
                let id = String::from_utf8_lossy(annotation);
                if !records.contains_key(id.as_ref()) {
                    tracing::warn!(%chain, %id, "removing unanchored rule");
                    batch.push(NftOp::DeleteRule {
                        chain: chain.clone(),
                        handle: rule.handle,
                    });
                }
            }
        }
        if !batch.is_empty() {
            self.fw.commit(batch).await?;
        }
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        let mut reconnect = reconnect_backoff();
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let mut stream = match self.runtime.events().await {
                Ok(stream) => {
                    reconnect.reset();
                    stream
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cannot subscribe to runtime events");
                    if !self.pause(&mut reconnect).await {
                        return;
                    }
                    continue;
                }
            };
            tracing::debug!("listening for container events");

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    item = stream.next() => match item {
                        Some(Ok(event)) => self.dispatch(event),
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "event stream failed");
                            break;
                        }
                        None => {
                            tracing::warn!("event stream ended");
                            break;
                        }
                    }
                }
            }

            // recover whatever happened while the stream was down
            if !self.pause(&mut reconnect).await {
                return;
            }
            if let Err(e) = self.sync().await {
                tracing::error!(error = %e, "resync after stream loss failed");
            }
        }
    }

    /// Sleeps out the next reconnect delay; false when cancelled instead.
    async fn pause(&self, reconnect: &mut ExponentialBackoff) -> bool {
        let delay = reconnect
            .next_backoff()
            .unwrap_or(Duration::from_secs(60));
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Hands the event to its container's worker, spawning the worker on
    /// first sight of the id. Workers drain their queue in send order, so
    /// events for one container are handled strictly as they arrived.
    fn dispatch(self: &Arc<Self>, event: RuntimeEvent) {
        let mut workers = self.workers.lock().unwrap();
        let tx = workers.entry(event.id.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let this = Arc::clone(self);
            let id = event.id.clone();
            self.tracker.spawn(this.drain_events(id, rx));
            tx
        });
        if tx.send(event.kind).is_err() {
            tracing::warn!(id = %event.id, "event worker is gone, dropping event");
        }
    }

    /// One container's event loop: processes its queue in arrival order
    /// until shutdown.
    async fn drain_events(
        self: Arc<Self>,
        id: String,
        mut events: mpsc::UnboundedReceiver<EventKind>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = events.recv() => match event {
                    Some(EventKind::Start) => self.handle_start(&id).await,
                    Some(EventKind::Die) => self.handle_die(&id).await,
                    None => return,
                }
            }
        }
    }

    async fn handle_start(&self, id: &str) {
        let installed = {
            let _guard = self.serialize(id).await;
            if self.cancel.is_cancelled() {
                return;
            }
            self.apply_container(id).await
        };
        // a fresh install means the container may have a new address;
        // anyone whose policy references it by name must be rebuilt
        if installed {
            self.refresh_dependents(id).await;
        }
    }

    /// Inspect, parse, resolve, generate and apply. True when rules were
    /// installed, false on a no-op or an abandoned container.
    async fn apply_container(&self, id: &str) -> bool {
        let runtime = self.runtime.clone();
        let target = id.to_string();
        let inspection = match backoff::future::retry(retry_policy(), move || {
            let runtime = runtime.clone();
            let target = target.clone();
            async move {
                runtime
                    .inspect(&target)
                    .await
                    .map_err(classify_runtime_error)
            }
        })
        .await
        {
            Ok(inspection) => inspection,
            Err(e) => {
                tracing::error!(%id, error = %e, "inspect failed, abandoning container");
                return false;
            }
        };
        if !inspection.enabled {
            tracing::debug!(%id, "container is not enabled");
            return false;
        }

        // a bad policy leaves the container without any rules at all;
        // default-deny would be guessing at the operator's intent
        let policy = match &inspection.rules {
            Some(yaml) => match Policy::parse(yaml) {
                Ok(policy) => policy,
                Err(e) => {
                    tracing::error!(%id, error = %e, "invalid rules label, abandoning container");
                    return false;
                }
            },
            None => Policy::default(),
        };
        let peers: Vec<String> = policy
            .output
            .iter()
            .filter_map(|rule| rule.container.as_ref().map(|c| c.name.clone()))
            .collect();
        let resolved = match policy.resolve(self.runtime.as_ref()).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::error!(%id, error = %e, "policy resolution failed, abandoning container");
                return false;
            }
        };

        let generated = Arc::new(codec::build(&inspection.meta, &resolved));
        let meta = Arc::new(inspection.meta);
        let peers = Arc::new(peers);
        let applier = self.applier.clone();
        let result = backoff::future::retry(retry_policy(), move || {
            let applier = applier.clone();
            let meta = meta.clone();
            let generated = generated.clone();
            let peers = peers.clone();
            async move {
                applier
                    .apply(&meta, &generated, &peers)
                    .await
                    .map_err(classify_apply_error)
            }
        })
        .await;
        match result {
            Ok(installed) => installed,
            Err(e) => {
                tracing::error!(%id, error = %e, "applying rules failed, abandoning container");
                false
            }
        }
    }

    /// Rebuilds every recorded container whose policy references this one
    /// by name, pinning its rules to the fresh address snapshot.
    async fn refresh_dependents(&self, id: &str) {
        let name = match self.store.get(id) {
            Ok(Some(record)) => record.name,
            _ => return,
        };
        let dependents: Vec<String> = match self.store.all() {
            Ok(records) => records
                .into_iter()
                .filter(|(dep, r)| dep != id && r.peer_names.contains(&name))
                .map(|(dep, _)| dep)
                .collect(),
            Err(e) => {
                tracing::error!(error = %e, "cannot enumerate records for dependents");
                return;
            }
        };
        for dep in dependents {
            tracing::info!(%dep, peer = %name, "rebuilding rules for dependent container");
            let _guard = self.serialize(&dep).await;
            if let Err(e) = self.applier.remove(&dep).await {
                tracing::error!(%dep, error = %e, "removing dependent rules failed");
                continue;
            }
            self.apply_container(&dep).await;
        }
    }

    async fn handle_die(&self, id: &str) {
        let _guard = self.serialize(id).await;

        let applier = self.applier.clone();
        let target = id.to_string();
        let result = backoff::future::retry(retry_policy(), move || {
            let applier = applier.clone();
            let target = target.clone();
            async move { applier.remove(&target).await.map_err(classify_apply_error) }
        })
        .await;
        if let Err(e) = result {
            tracing::error!(%id, error = %e, "removing rules failed");
        }
    }

    /// One-shot clear mode: every recorded container, then the shared
    /// topology, then the store itself.
    pub async fn clear(&self) -> Result<(), ReconcileError> {
        for (id, _) in self.store.all()? {
            self.applier.remove(&id).await?;
        }
        self.topology.teardown().await?;
        self.store.clear()?;
        tracing::info!("all owned rules and records cleared");
        Ok(())
    }

    /// Mutual exclusion between a container's event worker and the
    /// sync/dependent-rebuild paths, which act outside the worker queue.
    async fn serialize(&self, id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

fn retry_policy() -> ExponentialBackoff {
    ExponentialBackoff {
        max_elapsed_time: Some(Duration::from_secs(30)),
        ..Default::default()
    }
}

fn reconnect_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(250),
        max_interval: Duration::from_secs(30),
        max_elapsed_time: None,
        ..Default::default()
    }
}

fn classify_runtime_error(e: RuntimeError) -> backoff::Error<RuntimeError> {
    match e {
        RuntimeError::Api(_) | RuntimeError::StreamClosed => backoff::Error::transient(e),
        RuntimeError::Meta(_) | RuntimeError::NoAddress { .. } => backoff::Error::permanent(e),
    }
}

fn classify_apply_error(e: ApplyError) -> backoff::Error<ApplyError> {
    match e {
        // a batch the kernel cannot even be asked to apply will not get
        // better with time
        ApplyError::Firewall(FirewallError::Build(_)) => backoff::Error::permanent(e),
        _ => backoff::Error::transient(e),
    }
}
