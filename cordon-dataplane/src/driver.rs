//! The reconciliation driver.
//!
//! One task owns the event loop: it multiplexes desired-state
//! messages, interface events and the periodic tickers, fans updates
//! out to the managers, and drives the apply sequence. Each pass has
//! two phases: absorb (managers see every message) and apply (writers
//! flush in dependency order). The apply phase is skipped until the
//! upstream signals in-sync so the first programming pass writes one
//! consistent snapshot.
//!
//! Apply ordering matters because rules reference IP sets: set
//! additions run before the table writers, set deletions after them,
//! and the route tables reconcile in parallel with everything else.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::managers::{Manager, SharedIpSets, SharedTable};
use crate::proto::{Status, Update};
use crate::throttle::Throttle;

/// Maximum messages pulled from a channel before applying; larger
/// batches amortize the per-apply cost under load at some latency
/// cost.
const MSG_PEEK_LIMIT: usize = 100;

/// Failed applies retry on this cadence.
const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Throttle refill cadence.
const THROTTLE_REFILL_INTERVAL: Duration = Duration::from_millis(100);

/// Public handle: message-in / status-out.
pub struct Dataplane {
    tx: mpsc::Sender<Update>,
    rx: mpsc::Receiver<Status>,
}

impl Dataplane {
    /// Enqueue a desired-state message.
    pub async fn send(&self, msg: Update) {
        if self.tx.send(msg).await.is_err() {
            error!("dataplane driver is gone");
        }
    }

    /// Dequeue the next status message; `None` when the driver has
    /// stopped.
    pub async fn recv(&mut self) -> Option<Status> {
        self.rx.recv().await
    }

    /// Sender half for collaborators that feed the same queue.
    pub fn sender(&self) -> mpsc::Sender<Update> {
        self.tx.clone()
    }
}

pub struct Driver {
    config: Config,
    managers: Vec<Manager>,
    tables: Vec<SharedTable>,
    ip_sets: Vec<SharedIpSets>,

    rx: mpsc::Receiver<Update>,
    iface_rx: mpsc::Receiver<Update>,
    status_tx: mpsc::Sender<Status>,

    datastore_in_sync: bool,
    needs_sync: bool,
    force_ipsets_refresh: bool,
    force_route_refresh: bool,
    force_program_refresh: bool,
    done_first_apply: bool,
    throttle: Throttle,
    resched_at: Option<time::Instant>,
    start_time: Instant,
}

/// Build the driver plus its public handle and the sender the
/// interface monitor feeds.
pub fn new(
    config: Config,
    managers: Vec<Manager>,
    tables: Vec<SharedTable>,
    ip_sets: Vec<SharedIpSets>,
) -> (Driver, Dataplane, mpsc::Sender<Update>) {
    let (tx, rx) = mpsc::channel(MSG_PEEK_LIMIT);
    let (iface_tx, iface_rx) = mpsc::channel(100);
    let (status_tx, status_rx) = mpsc::channel(100);
    let driver = Driver {
        config,
        managers,
        tables,
        ip_sets,
        rx,
        iface_rx,
        status_tx,
        datastore_in_sync: false,
        needs_sync: false,
        force_ipsets_refresh: false,
        force_route_refresh: false,
        force_program_refresh: false,
        done_first_apply: false,
        throttle: Throttle::new(),
        resched_at: None,
        start_time: Instant::now(),
    };
    (
        driver,
        Dataplane { tx, rx: status_rx },
        iface_tx,
    )
}

/// Interval helper: a zero configured interval disables the ticker.
fn ticker(period: Duration) -> time::Interval {
    let period = if period.is_zero() {
        // Effectively never.
        Duration::from_secs(365 * 24 * 3600)
    } else {
        period
    };
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    interval
}

impl Driver {
    /// The main loop. Never returns; termination is by process exit.
    pub async fn run(mut self) {
        info!("dataplane driver loop started");
        self.report_health().await;

        let mut ipsets_refresh = ticker(self.config.ipsets_refresh_interval);
        let mut route_refresh = ticker(self.config.route_refresh_interval);
        let mut program_refresh = ticker(self.config.program_refresh_interval);
        let mut health_ticks = ticker(self.config.health_interval);
        let mut throttle_ticks = ticker(THROTTLE_REFILL_INTERVAL);
        let mut retry_ticks = ticker(RETRY_INTERVAL);
        let mut debug_hang = self.config.debug_simulate_hang_after.map(ticker);
        let mut being_throttled = false;

        // First tick of a tokio interval fires immediately; consume
        // them so the loop starts quiet.
        ipsets_refresh.tick().await;
        route_refresh.tick().await;
        program_refresh.tick().await;
        throttle_ticks.tick().await;
        retry_ticks.tick().await;
        if let Some(hang) = debug_hang.as_mut() {
            hang.tick().await;
        }

        loop {
            tokio::select! {
                Some(msg) = self.rx.recv() => {
                    let mut batch = 1;
                    self.dispatch(msg);
                    while batch < MSG_PEEK_LIMIT {
                        match self.rx.try_recv() {
                            Ok(msg) => {
                                self.dispatch(msg);
                                batch += 1;
                            }
                            Err(_) => break,
                        }
                    }
                    debug!(batch, "processed desired-state batch");
                    self.needs_sync = true;
                }
                Some(msg) = self.iface_rx.recv() => {
                    let mut batch = 1;
                    self.dispatch(msg);
                    while batch < MSG_PEEK_LIMIT {
                        match self.iface_rx.try_recv() {
                            Ok(msg) => {
                                self.dispatch(msg);
                                batch += 1;
                            }
                            Err(_) => break,
                        }
                    }
                    debug!(batch, "processed interface batch");
                    self.needs_sync = true;
                }
                _ = ipsets_refresh.tick() => {
                    debug!("refreshing IP sets state");
                    self.force_ipsets_refresh = true;
                    self.needs_sync = true;
                }
                _ = route_refresh.tick() => {
                    debug!("refreshing routes");
                    self.force_route_refresh = true;
                    self.needs_sync = true;
                }
                _ = program_refresh.tick() => {
                    debug!("refreshing TC program state");
                    self.force_program_refresh = true;
                    self.needs_sync = true;
                }
                _ = async {
                    match self.resched_at {
                        Some(at) => time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    debug!("reschedule kick received");
                    self.resched_at = None;
                    self.needs_sync = true;
                }
                _ = throttle_ticks.tick() => {
                    self.throttle.refill();
                }
                _ = health_ticks.tick() => {
                    self.report_health().await;
                }
                _ = retry_ticks.tick() => {}
                _ = async {
                    match debug_hang.as_mut() {
                        Some(hang) => { hang.tick().await; }
                        None => std::future::pending().await,
                    }
                } => {
                    warn!("debug hang timer popped, hanging the dataplane");
                    std::thread::sleep(Duration::from_secs(3600));
                    panic!("woke up after an hour; the watchdog should have fired");
                }
            }

            if self.datastore_in_sync && self.needs_sync {
                if self.throttle.admit() {
                    if being_throttled && self.throttle.would_admit() {
                        info!("dataplane updates no longer throttled");
                        being_throttled = false;
                    }
                    let apply_start = Instant::now();
                    self.apply().await;
                    debug!(elapsed = ?apply_start.elapsed(), "applied dataplane updates");

                    if !self.done_first_apply {
                        info!(
                            secs_since_start = self.start_time.elapsed().as_secs_f64(),
                            "completed first update to dataplane"
                        );
                        self.done_first_apply = true;
                    }
                    self.report_health().await;
                } else if !being_throttled {
                    info!("dataplane updates throttled");
                    being_throttled = true;
                }
            }
        }
    }

    /// Fan one update out to every manager. Public so embedders and
    /// tests can drive the dataplane without the channel plumbing.
    pub fn dispatch(&mut self, msg: Update) {
        if let Update::InSync = msg {
            info!(
                since_start = ?self.start_time.elapsed(),
                "datastore in sync, flushing the dataplane for the first time"
            );
            self.datastore_in_sync = true;
        }
        for manager in &mut self.managers {
            manager.on_update(&msg);
        }
    }

    /// One apply pass. Failures leave `needs_sync` set; the retry
    /// ticker re-enters.
    pub async fn apply(&mut self) {
        self.needs_sync = false;

        // Phase 1: batch resolution; may publish cross-manager
        // messages which are fanned out before any programming.
        let mut published = Vec::new();
        for manager in &mut self.managers {
            match manager.resolve_update_batch() {
                Ok(mut updates) => published.append(&mut updates),
                Err(e) => {
                    debug!(manager = manager.name(), error = %e,
                        "couldn't resolve update batch, will retry");
                    self.needs_sync = true;
                }
            }
        }
        for msg in published {
            for manager in &mut self.managers {
                manager.on_update(&msg);
            }
        }

        // Phase 2: managers queue (or perform) their writer work.
        for manager in &mut self.managers {
            if let Err(e) = manager.complete_deferred_work().await {
                debug!(manager = manager.name(), error = %e,
                    "couldn't complete deferred work, will retry");
                self.needs_sync = true;
            }
        }

        // Phase 3: propagate refresh-timer pops into the writers.
        if self.force_ipsets_refresh {
            for writer in &self.ip_sets {
                writer.lock().unwrap().queue_resync();
            }
            self.force_ipsets_refresh = false;
        }
        if self.force_route_refresh {
            for manager in &mut self.managers {
                for rt in manager.route_table_syncers() {
                    rt.queue_resync();
                }
            }
            self.force_route_refresh = false;
        }
        if self.force_program_refresh {
            for manager in &mut self.managers {
                if let Manager::ProgramAttach(m) = manager {
                    m.queue_resync();
                }
            }
            // The reprogramming itself happened in phase 2; make sure
            // another pass runs promptly.
            self.needs_sync = true;
            self.force_program_refresh = false;
        }

        // Phase 4: IP set additions and route tables in parallel.
        // Additions must land before the table writers reference
        // them; routes are independent and only joined at the end.
        let mut ipset_handles = Vec::new();
        for writer in &self.ip_sets {
            let writer = writer.clone();
            ipset_handles.push(tokio::task::spawn_blocking(move || {
                writer.lock().unwrap().apply_updates()
            }));
        }

        let route_tables: Vec<&mut crate::routetable::RouteTable> = self
            .managers
            .iter_mut()
            .flat_map(|m| m.route_table_syncers())
            .collect();
        let routes_fut = futures::future::join_all(
            route_tables.into_iter().map(|rt| rt.apply()),
        );

        for handle in ipset_handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "IP set update failed, will retry");
                    self.needs_sync = true;
                }
                Err(e) => {
                    error!(error = %e, "IP set apply task panicked");
                    self.needs_sync = true;
                }
            }
        }

        // Phase 5: table writers in parallel, one task per table;
        // each returns its requested recheck delay.
        let mut table_handles = Vec::new();
        for table in &self.tables {
            let table = table.clone();
            table_handles.push(tokio::task::spawn_blocking(move || {
                table.lock().unwrap().apply()
            }));
        }
        let mut resched_delay: Option<Duration> = None;
        for handle in table_handles {
            match handle.await {
                Ok(Ok(delay)) => {
                    if !delay.is_zero() {
                        resched_delay =
                            Some(resched_delay.map_or(delay, |d| d.min(delay)));
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "table apply failed, will retry");
                    self.needs_sync = true;
                }
                Err(e) => {
                    error!(error = %e, "table apply task panicked");
                    self.needs_sync = true;
                }
            }
        }

        // Phase 6: IP set deletions, now that no rule references the
        // removed sets.
        let mut deletion_handles = Vec::new();
        for writer in &self.ip_sets {
            let writer = writer.clone();
            deletion_handles.push(tokio::task::spawn_blocking(move || {
                writer.lock().unwrap().apply_deletions()
            }));
        }
        for handle in deletion_handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "IP set deletion failed, will retry");
                    self.needs_sync = true;
                }
                Err(e) => {
                    error!(error = %e, "IP set deletion task panicked");
                    self.needs_sync = true;
                }
            }
        }

        // Join the route updates.
        for result in routes_fut.await {
            if let Err(e) = result {
                warn!(error = %e, "failed to synchronize routing table, will retry");
                self.needs_sync = true;
            }
        }

        // Phase 7: publish pending status updates.
        for manager in &mut self.managers {
            for status in manager.take_status() {
                let _ = self.status_tx.send(status).await;
            }
        }

        // Schedule the earliest requested recheck.
        self.resched_at = resched_delay.map(|d| time::Instant::now() + d);
    }

    async fn report_health(&self) {
        // Live always; ready only once the dataplane has converged at
        // least once.
        let _ = self
            .status_tx
            .try_send(Status::Health {
                live: true,
                ready: self.done_first_apply,
            });
    }

    /// Has the upstream signalled in-sync yet?
    pub fn datastore_in_sync(&self) -> bool {
        self.datastore_in_sync
    }

    /// Clone of the status channel, for the process-status loop.
    pub fn status_sender(&self) -> mpsc::Sender<Status> {
        self.status_tx.clone()
    }
}

/// Periodic process-status reports, run as its own task. Waits before
/// the first report so a crash-looping agent does not spam check-ins.
pub async fn status_report_loop(status_tx: mpsc::Sender<Status>, interval: Duration) {
    if interval.is_zero() {
        info!("process status reports disabled");
        return;
    }
    let start = Instant::now();
    time::sleep(Duration::from_secs(10)).await;
    loop {
        let now = chrono::Utc::now();
        let msg = Status::Process {
            iso_timestamp: now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            uptime_secs: start.elapsed().as_secs_f64(),
        };
        if status_tx.send(msg).await.is_err() {
            return;
        }
        time::sleep(interval).await;
    }
}
