//! Long-lived background tasks: one rollout watchdog per branch and the
//! expired-credential GC.
//!
//! The watchdog guarantees eventual commit of journaled rollout intents.
//! Appends always go to the journal's partial sibling, so a pass works on
//! a frozen snapshot: process the non-partial journal, then (never on the
//! first pass since startup, and only after a fully successful pass)
//! rename the partial over it. Intents therefore become visible one
//! interval after they were appended, and in-flight request writes are
//! never raced.

use std::sync::Arc;
use std::time::Duration;

use fleetgate_core::store::operator::OperatorStore;
use fleetgate_core::store::users::UserStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Tuning knobs; tests shrink the intervals.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub rollout_interval: Duration,
    pub gc_interval: Duration,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            // Handlers get a full interval to finish writing after the
            // partial journal was renamed, which is far more than any
            // in-flight append needs.
            rollout_interval: Duration::from_secs(5 * 60),
            gc_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Daemon group with one `start` and one `shutdown`.
pub struct Daemons {
    store: Arc<OperatorStore>,
    users: Option<Arc<UserStore>>,
    options: DaemonOptions,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemons {
    #[must_use]
    pub fn new(
        store: Arc<OperatorStore>,
        users: Option<Arc<UserStore>>,
        options: DaemonOptions,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            users,
            options,
            shutdown,
            tasks: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        for is_prod in [true, false] {
            let store = Arc::clone(&self.store);
            let interval = self.options.rollout_interval;
            let rx = self.shutdown.subscribe();
            self.tasks
                .push(tokio::spawn(rollout_watchdog(store, is_prod, interval, rx)));
        }
        if let Some(users) = &self.users {
            let users = Arc::clone(users);
            let interval = self.options.gc_interval;
            let rx = self.shutdown.subscribe();
            self.tasks.push(tokio::spawn(credential_gc(users, interval, rx)));
        }
    }

    /// Signals every task and waits for them to wind down.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn rollout_watchdog(
    store: Arc<OperatorStore>,
    is_prod: bool,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut first_run = true;
    loop {
        let processed = process_journal(&store, is_prod);
        if first_run {
            // The journal may still gain entries right after startup;
            // rolling over now could orphan them for a full interval.
            first_run = false;
        } else if processed {
            if let Err(e) = store.rollover_rollout_journal(is_prod) {
                error!(is_prod, error = %e, "failed to roll over the rollout journal");
            }
        }
        tokio::select! {
            _ = shutdown.changed() => return,
            () = tokio::time::sleep(interval) => {}
        }
    }
}

/// One reconciliation pass. Returns whether the pass fully succeeded;
/// partial failures are logged and retried next interval.
fn process_journal(store: &OperatorStore, is_prod: bool) -> bool {
    let entries = match store.read_rollout_journal(is_prod) {
        Ok(entries) => entries,
        Err(e) => {
            // A journal reading error is critical - retry the whole pass
            // later.
            error!(is_prod, error = %e, "failed to read rollout journal");
            return false;
        }
    };

    let mut success = true;
    for entry in entries {
        let rollout = match store.get_rollout(&entry.tag, &entry.update, &entry.rollout, is_prod)
        {
            Ok(rollout) => rollout,
            Err(e) if e.is_not_found() => {
                warn!(is_prod, path = %entry.to_line(), "rollout file not exist - skipping stale journal entry");
                continue;
            }
            Err(e) => {
                // Non-critical: process the other rollouts, retry this one
                // on the next pass. Operators are expected to watch these.
                error!(is_prod, path = %entry.to_line(), error = %e, "failed to process rollout file");
                success = false;
                continue;
            }
        };
        if rollout.committed {
            continue;
        }
        // Present but not committed - the PUT handler died between the
        // phases. Commit now; the catalog update converges.
        if let Err(e) =
            store.commit_rollout(&entry.tag, &entry.update, &entry.rollout, is_prod, rollout)
        {
            error!(is_prod, path = %entry.to_line(), error = %e, "failed to commit rollout");
            success = false;
        }
    }
    success
}

async fn credential_gc(
    users: Arc<UserStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            () = tokio::time::sleep(interval) => {}
        }
        users.run_gc();
    }
}
