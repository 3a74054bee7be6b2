//! Convergence manager.
//!
//! Each pass reads the intents, the running containers and the open
//! forwarders, then closes what should no longer exist before opening what
//! is missing.  Passes are serialised by the `pass` mutex.  Every change to
//! an entry of the endpoint table happens while holding the table lock
//! across the adapter call that justifies it, which is the same lock the
//! direct removal path takes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{timeout, MissedTickBehavior};

use crate::detect::Detect;
use crate::error::{ConvergeError, RemoveError, StoreError};
use crate::runtime::ContainerRuntime;
use crate::session::{EndpointTable, SessionCache};
use crate::store::Store;
use crate::tunnel::{OpenRequest, TunnelService};
use crate::types::{ContainerSnapshot, Endpoint, Forwarder, Intent, Protocol};

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Host part of every forwarder target.
    pub target_host: String,
    /// Bound on each individual adapter call.
    pub adapter_timeout: Duration,
}

/// What a pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergeReport {
    pub opened: usize,
    pub closed: usize,
    pub adopted: usize,
    /// Endpoints forgotten because their forwarder vanished remotely.
    pub dropped: usize,
    pub attempted: usize,
    pub failed: usize,
    pub last_error: Option<String>,
}

impl ConvergeReport {
    pub fn changed(&self) -> bool {
        self.opened + self.closed + self.adopted + self.dropped > 0
    }

    fn fail(&mut self, error: String) {
        warn!("{}", error);
        self.failed += 1;
        self.last_error = Some(error);
    }
}

/// Result of recording an intent and converging on it right away.
#[derive(Debug)]
pub struct TunnelRequest {
    pub endpoint: Option<Endpoint>,
    /// Why the endpoint is not up yet, if it is not.
    pub pending_reason: Option<String>,
}

#[derive(Default)]
struct PassState {
    last_protocol: HashMap<String, Protocol>,
}

pub struct Manager {
    store: Arc<dyn Store>,
    containers: Arc<dyn ContainerRuntime>,
    tunnels: Arc<dyn TunnelService>,
    detector: Arc<dyn Detect>,
    cache: Arc<SessionCache>,
    settings: ManagerSettings,
    pass: Mutex<PassState>,
    trigger: Notify,
    stopped: AtomicBool,
}

impl Manager {
    pub fn new(
        store: Arc<dyn Store>,
        containers: Arc<dyn ContainerRuntime>,
        tunnels: Arc<dyn TunnelService>,
        detector: Arc<dyn Detect>,
        cache: Arc<SessionCache>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            store,
            containers,
            tunnels,
            detector,
            cache,
            settings,
            pass: Mutex::new(PassState::default()),
            trigger: Notify::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    pub async fn intents(&self) -> Result<Vec<Intent>, StoreError> {
        self.store.list().await
    }

    pub async fn intent(&self, container_id: &str) -> Result<Option<Intent>, StoreError> {
        self.store.get(container_id).await
    }

    /// Request a pass from the background loop. Requests made while one is
    /// already pending coalesce into a single pass.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Drive passes on every tick of `interval` and on every trigger until
    /// `shutdown` flips. The first tick fires immediately.
    pub async fn run(
        &self,
        interval: Duration,
        pass_timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
                _ = self.trigger.notified() => debug!("Convergence triggered"),
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.converge(pass_timeout).await {
                warn!("Convergence pass failed: {}", e);
            }
        }
        info!("Convergence loop stopped");
    }

    /// Run one pass, waiting for any pass already in progress. The wait
    /// counts against `limit`.
    pub async fn converge(&self, limit: Duration) -> Result<ConvergeReport, ConvergeError> {
        let pass = async {
            let mut state = self.pass.lock().await;
            if self.stopped.load(Ordering::SeqCst) {
                debug!("Manager is shut down, skipping pass");
                return Ok(ConvergeReport::default());
            }
            self.run_pass(&mut state).await
        };
        match timeout(limit, pass).await {
            Ok(result) => result,
            Err(_) => Err(ConvergeError::Timeout {
                what: "convergence pass",
                timeout: limit,
            }),
        }
    }

    async fn run_pass(&self, state: &mut PassState) -> Result<ConvergeReport, ConvergeError> {
        let limit = self.settings.adapter_timeout;
        let intents = bounded("listing intents", limit, self.store.list()).await?;
        let containers =
            bounded("listing containers", limit, self.containers.list_running()).await?;
        // Snapshot before listing: a forwarder removed directly in between is
        // then either missing from the list or still referenced, never adopted.
        let known = self.cache.snapshot().await;
        let referenced: HashSet<String> =
            known.values().map(|e| e.forwarder_id.clone()).collect();
        let forwarders = bounded("listing forwarders", limit, self.tunnels.list_open()).await?;

        let intents: HashMap<String, Intent> = intents
            .into_iter()
            .map(|i| (i.container_id.clone(), i))
            .collect();
        let mut report = ConvergeReport::default();

        self.remove_stale(&known, &intents, &containers, &forwarders, &mut report)
            .await;
        self.sweep_forwarders(
            state,
            &referenced,
            &intents,
            &containers,
            &forwarders,
            &mut report,
        )
        .await;
        self.open_missing(state, &intents, &containers, &mut report)
            .await;
        state.last_protocol.retain(|id, _| intents.contains_key(id));

        if report.changed() || report.failed > 0 {
            info!(
                "Convergence pass: opened {}, closed {}, adopted {}, dropped {}, failed {}",
                report.opened, report.closed, report.adopted, report.dropped, report.failed
            );
        } else {
            debug!("Convergence pass: nothing to do");
        }

        if report.attempted > 0 && report.failed == report.attempted {
            return Err(ConvergeError::AllFailed {
                failed: report.failed,
                last: report.last_error.clone().unwrap_or_default(),
            });
        }
        Ok(report)
    }

    /// Close endpoints whose intent or container is gone, or whose intent
    /// changed; forget endpoints whose forwarder no longer exists.
    async fn remove_stale(
        &self,
        known: &EndpointTable,
        intents: &HashMap<String, Intent>,
        containers: &[ContainerSnapshot],
        forwarders: &[Forwarder],
        report: &mut ConvergeReport,
    ) {
        let live: HashSet<&str> = forwarders.iter().map(|f| f.id.as_str()).collect();
        let mut endpoints: Vec<&Endpoint> = known.values().collect();
        endpoints.sort_by(|a, b| a.container_id.cmp(&b.container_id));

        for endpoint in endpoints {
            let id = endpoint.container_id.as_str();

            if !live.contains(endpoint.forwarder_id.as_str()) {
                let mut table = self.cache.lock().await;
                if table.get(id).map(|e| &e.forwarder_id) == Some(&endpoint.forwarder_id) {
                    table.remove(id);
                    report.dropped += 1;
                    warn!(
                        "Forwarder {} for {} disappeared remotely",
                        endpoint.forwarder_id, id
                    );
                }
                continue;
            }

            let reason = match intents.get(id) {
                None => "intent removed",
                Some(_) if find_container(containers, id).is_none() => "container not running",
                Some(i) if i.target_port != endpoint.target_port => "target port changed",
                Some(i) if i.protocol_override().is_some_and(|p| p != endpoint.protocol) => {
                    "protocol override changed"
                }
                Some(_) => continue,
            };
            debug!("Closing endpoint for {}: {}", id, reason);
            self.close_endpoint(id, &endpoint.forwarder_id, report).await;
        }
    }

    async fn close_endpoint(
        &self,
        container_id: &str,
        forwarder_id: &str,
        report: &mut ConvergeReport,
    ) {
        let mut table = self.cache.lock().await;
        if table.get(container_id).map(|e| e.forwarder_id.as_str()) != Some(forwarder_id) {
            // Removed directly while this pass was running.
            return;
        }

        report.attempted += 1;
        match timeout(self.settings.adapter_timeout, self.tunnels.close(forwarder_id)).await {
            Ok(Ok(())) => {
                table.remove(container_id);
                report.closed += 1;
                info!("Closed forwarder {} for {}", forwarder_id, container_id);
            }
            Ok(Err(e)) => report.fail(format!(
                "Failed to close forwarder {} for {}: {}",
                forwarder_id, container_id, e
            )),
            Err(_) => report.fail(format!(
                "Closing forwarder {} for {} timed out",
                forwarder_id, container_id
            )),
        }
    }

    /// Adopt forwarders left by a previous process that still match an
    /// intent, and close every other forwarder without an endpoint.
    async fn sweep_forwarders(
        &self,
        state: &mut PassState,
        referenced: &HashSet<String>,
        intents: &HashMap<String, Intent>,
        containers: &[ContainerSnapshot],
        forwarders: &[Forwarder],
        report: &mut ConvergeReport,
    ) {
        let mut unreferenced: Vec<&Forwarder> = forwarders
            .iter()
            .filter(|f| !referenced.contains(&f.id))
            .collect();
        unreferenced.sort_by(|a, b| a.id.cmp(&b.id));

        for forwarder in unreferenced {
            if self
                .try_adopt(state, forwarder, intents, containers)
                .await
            {
                report.adopted += 1;
                continue;
            }

            report.attempted += 1;
            match timeout(self.settings.adapter_timeout, self.tunnels.close(&forwarder.id)).await {
                Ok(Ok(())) => {
                    report.closed += 1;
                    info!("Closed orphaned forwarder {} ({})", forwarder.id, forwarder.url);
                }
                Ok(Err(e)) => report.fail(format!(
                    "Failed to close orphaned forwarder {}: {}",
                    forwarder.id, e
                )),
                Err(_) => report.fail(format!(
                    "Closing orphaned forwarder {} timed out",
                    forwarder.id
                )),
            }
        }
    }

    async fn try_adopt(
        &self,
        state: &mut PassState,
        forwarder: &Forwarder,
        intents: &HashMap<String, Intent>,
        containers: &[ContainerSnapshot],
    ) -> bool {
        let Some(intent) = forwarder
            .container_id
            .as_deref()
            .and_then(|id| intents.get(id))
        else {
            return false;
        };
        if find_container(containers, &intent.container_id).is_none()
            || forwarder.target != self.target(intent)
            || !forwarder.protocol.is_known()
            || intent
                .protocol_override()
                .is_some_and(|p| p != forwarder.protocol)
        {
            return false;
        }

        let mut table = self.cache.lock().await;
        if table.contains_key(&intent.container_id) {
            return false;
        }
        table.insert(
            intent.container_id.clone(),
            Endpoint {
                container_id: intent.container_id.clone(),
                target_port: intent.target_port,
                forwarder_id: forwarder.id.clone(),
                url: forwarder.url.clone(),
                protocol: forwarder.protocol,
            },
        );
        state
            .last_protocol
            .insert(intent.container_id.clone(), forwarder.protocol);
        info!(
            "Adopted forwarder {} for {} ({})",
            forwarder.id, intent.container_id, forwarder.url
        );
        true
    }

    async fn open_missing(
        &self,
        state: &mut PassState,
        intents: &HashMap<String, Intent>,
        containers: &[ContainerSnapshot],
        report: &mut ConvergeReport,
    ) {
        let mut pending: Vec<&Intent> = intents.values().collect();
        pending.sort_by(|a, b| a.container_id.cmp(&b.container_id));

        for intent in pending {
            let id = intent.container_id.as_str();
            let Some(container) = find_container(containers, id) else {
                continue;
            };
            if self.cache.get(id).await.is_some() {
                continue;
            }
            if !container.published_ports.is_empty() && !container.publishes(intent.target_port) {
                warn!(
                    "Container {} does not publish port {}, opening anyway",
                    container.name, intent.target_port
                );
            }

            let target = self.target(intent);
            let protocol = self.resolve_protocol(state, intent, &target).await;

            let mut table = self.cache.lock().await;
            if table.contains_key(id) {
                continue;
            }
            report.attempted += 1;
            let request = OpenRequest {
                container_id: intent.container_id.clone(),
                target: target.clone(),
                protocol,
                options: intent.options.clone(),
            };
            match timeout(self.settings.adapter_timeout, self.tunnels.open(&request)).await {
                Ok(Ok(forwarder)) => {
                    info!(
                        "Opened {} forwarder {} for {} -> {}",
                        protocol, forwarder.id, id, forwarder.url
                    );
                    table.insert(
                        intent.container_id.clone(),
                        Endpoint {
                            container_id: intent.container_id.clone(),
                            target_port: intent.target_port,
                            forwarder_id: forwarder.id,
                            url: forwarder.url,
                            protocol,
                        },
                    );
                    state
                        .last_protocol
                        .insert(intent.container_id.clone(), protocol);
                    report.opened += 1;
                }
                Ok(Err(e)) => report.fail(format!(
                    "Failed to open forwarder for {} ({}): {}",
                    id, target, e
                )),
                Err(_) => report.fail(format!(
                    "Opening forwarder for {} ({}) timed out",
                    id, target
                )),
            }
        }
    }

    /// The override if any, else the detected protocol, else the last one
    /// that worked for this container, else TCP.
    async fn resolve_protocol(&self, state: &PassState, intent: &Intent, target: &str) -> Protocol {
        if let Some(protocol) = intent.protocol_override() {
            return protocol;
        }
        let detected = timeout(self.settings.adapter_timeout, self.detector.detect(target))
            .await
            .unwrap_or(Protocol::Unknown);
        if detected.is_known() {
            return detected;
        }
        let fallback = state
            .last_protocol
            .get(&intent.container_id)
            .copied()
            .unwrap_or(Protocol::Tcp);
        debug!(
            "Could not detect protocol at {}, using {}",
            target, fallback
        );
        fallback
    }

    fn target(&self, intent: &Intent) -> String {
        format!("{}:{}", self.settings.target_host, intent.target_port)
    }

    /// Close the forwarder for `container_id` right away and return the
    /// remaining table. The intent is left in place.
    pub async fn remove_tunnel(&self, container_id: &str) -> Result<EndpointTable, RemoveError> {
        let mut table = self.cache.lock().await;
        let forwarder_id = match table.get(container_id) {
            Some(endpoint) => endpoint.forwarder_id.clone(),
            None => return Err(RemoveError::NotFound(container_id.to_string())),
        };

        let closed = timeout(self.settings.adapter_timeout, self.tunnels.close(&forwarder_id)).await;
        match closed {
            Ok(Ok(())) => {}
            Ok(Err(source)) => return Err(RemoveError::Close { forwarder_id, source }),
            Err(_) => return Err(RemoveError::Timeout(forwarder_id)),
        }
        table.remove(container_id);
        info!("Removed tunnel {} for {}", forwarder_id, container_id);
        Ok(table.clone())
    }

    /// Durably record `intent`, then converge so the caller learns at once
    /// whether the tunnel came up. A failed pass leaves the intent recorded
    /// for the next one.
    pub async fn request_tunnel(
        &self,
        intent: Intent,
        limit: Duration,
    ) -> Result<TunnelRequest, StoreError> {
        let container_id = intent.container_id.clone();
        self.store.set(intent).await?;
        info!("Recorded intent for {}", container_id);

        let pass_error = self.converge(limit).await.err().map(|e| e.to_string());
        let endpoint = self.cache.get(&container_id).await;
        let pending_reason = match (&endpoint, pass_error) {
            (Some(_), _) => None,
            (None, Some(e)) => Some(e),
            (None, None) => Some(format!(
                "container {} is not running or the forwarder could not be opened yet",
                container_id
            )),
        };
        Ok(TunnelRequest {
            endpoint,
            pending_reason,
        })
    }

    /// Durably delete the intent for `container_id` and close its tunnel.
    pub async fn cancel_intent(&self, container_id: &str) -> Result<Option<Intent>, RemoveError> {
        let removed = self.store.delete(container_id).await?;
        match self.remove_tunnel(container_id).await {
            Ok(_) | Err(RemoveError::NotFound(_)) => {}
            Err(e) => {
                // The intent is gone, so the next pass retries the close.
                warn!("Intent for {} cancelled but tunnel not closed: {}", container_id, e);
                self.trigger();
            }
        }
        Ok(removed)
    }

    /// Close every live forwarder. Later passes become no-ops.
    pub async fn shutdown(&self, limit: Duration) -> Result<(), ConvergeError> {
        self.stopped.store(true, Ordering::SeqCst);

        let work = async {
            let _state = self.pass.lock().await;
            let mut table = self.cache.lock().await;
            let mut ids: Vec<String> = table.keys().cloned().collect();
            ids.sort();

            let mut failed = 0;
            for id in ids {
                let Some(forwarder_id) = table.get(&id).map(|e| e.forwarder_id.clone()) else {
                    continue;
                };
                let close = self.tunnels.close(&forwarder_id);
                match timeout(self.settings.adapter_timeout, close).await {
                    Ok(Ok(())) => {
                        table.remove(&id);
                        info!("Closed forwarder {} for {}", forwarder_id, id);
                    }
                    Ok(Err(e)) => {
                        failed += 1;
                        warn!("Failed to close forwarder {} for {}: {}", forwarder_id, id, e);
                    }
                    Err(_) => {
                        failed += 1;
                        warn!("Closing forwarder {} for {} timed out", forwarder_id, id);
                    }
                }
            }
            failed
        };

        match timeout(limit, work).await {
            Ok(0) => Ok(()),
            Ok(failed) => Err(ConvergeError::Shutdown { failed }),
            Err(_) => Err(ConvergeError::Timeout {
                what: "shutdown",
                timeout: limit,
            }),
        }
    }
}

fn find_container<'a>(
    containers: &'a [ContainerSnapshot],
    key: &str,
) -> Option<&'a ContainerSnapshot> {
    containers.iter().find(|c| c.matches(key))
}

async fn bounded<T, E, F>(what: &'static str, limit: Duration, fut: F) -> Result<T, ConvergeError>
where
    F: std::future::Future<Output = Result<T, E>>,
    ConvergeError: From<E>,
{
    match timeout(limit, fut).await {
        Ok(result) => result.map_err(ConvergeError::from),
        Err(_) => Err(ConvergeError::Timeout {
            what,
            timeout: limit,
        }),
    }
}
