//! UpdateScheduler — debounce/throttle/coalesce layer between field edits
//! and database writes.
//!
//! The scheduler never stores field values. It only decides *when* a write
//! should happen; the operations themselves are rebuilt at fire time by the
//! injected ops builder, so a deferred write always carries the latest
//! state. A timer firing after a no-op convergence therefore produces an
//! empty batch and no transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

use crate::client::{DbClient, Operation};
use crate::error::TransactError;

// ============================================================================
// Options
// ============================================================================

/// Called with the error of a rejected deferred write. Writes are
/// fire-and-forget from the edit path, so this is the only place an
/// embedding application can observe them.
pub type WriteErrorFn = dyn Fn(TransactError) + Send + Sync;

/// Per-field write pacing. A field appears in at most one of the two maps;
/// debounce wins if it is listed in both.
#[derive(Clone, Default)]
pub struct SchedulerOptions {
    /// Field → quiet window in ms. Each edit restarts the window; the write
    /// fires only after the field has been left alone that long.
    pub debounce: BTreeMap<String, u64>,
    /// Field → minimum spacing in ms. The first edit writes immediately;
    /// edits inside the window coalesce into one trailing write at its end.
    pub throttle: BTreeMap<String, u64>,
    /// Emit tracing output for every scheduling decision.
    pub debug: bool,
    /// Invoked when a transaction is rejected, after the error is logged.
    pub on_write_error: Option<Arc<WriteErrorFn>>,
}

// ============================================================================
// UpdateScheduler
// ============================================================================

/// Builds the write batch for one field, reading the current form state.
pub type OpsBuilder = dyn Fn(&str) -> Vec<Operation> + Send + Sync;

pub struct UpdateScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    client: Arc<dyn DbClient>,
    build_ops: Arc<OpsBuilder>,
    opts: SchedulerOptions,
    state: Mutex<TimerState>,
    disposed: AtomicBool,
}

#[derive(Default)]
struct TimerState {
    /// The single outstanding debounce timer and the field it belongs to.
    debounce_timer: Option<JoinHandle<()>>,
    pending_field: Option<String>,
    /// When each throttled field last wrote.
    last_write: HashMap<String, Instant>,
    /// Outstanding trailing writes for throttled fields.
    throttle_timers: HashMap<String, JoinHandle<()>>,
}

impl UpdateScheduler {
    pub fn new(
        client: Arc<dyn DbClient>,
        build_ops: Arc<OpsBuilder>,
        opts: SchedulerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                build_ops,
                opts,
                state: Mutex::new(TimerState::default()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// React to a set of locally changed fields.
    ///
    /// A multi-field change (or a change while a different field's debounce
    /// is pending) cancels every outstanding timer and writes one batch
    /// immediately. A single-field change follows that field's pacing.
    pub fn apply(&self, fields: Vec<String>) {
        self.inner.apply(fields);
    }

    /// Cancel all pending timers without writing.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        self.inner.abort_all_timers();
    }
}

impl Inner {
    fn apply(self: &Arc<Self>, fields: Vec<String>) {
        if self.disposed.load(Ordering::SeqCst) || fields.is_empty() {
            return;
        }

        let pending = self.state.lock().pending_field.clone();
        let coalesce = fields.len() > 1
            || matches!(&pending, Some(p) if Some(p.as_str()) != fields.first().map(String::as_str));

        if coalesce {
            if self.opts.debug {
                tracing::debug!(?fields, "coalescing into immediate batch write");
            }
            // Every field with a cancelled timer rides along in the batch:
            // the debounce-pending field and any throttled field waiting on
            // a trailing write. Aborting their timers without writing them
            // would silently drop their last edit.
            let mut batch = fields;
            {
                let st = self.state.lock();
                if let Some(p) = &st.pending_field {
                    if !batch.contains(p) {
                        batch.push(p.clone());
                    }
                }
                for field in st.throttle_timers.keys() {
                    if !batch.contains(field) {
                        batch.push(field.clone());
                    }
                }
            }
            self.abort_all_timers();
            self.dispatch(&batch);
            return;
        }

        let field = match fields.into_iter().next() {
            Some(f) => f,
            None => return,
        };

        if let Some(&window) = self.opts.debounce.get(&field) {
            self.schedule_debounced(field, window);
        } else if let Some(&window) = self.opts.throttle.get(&field) {
            self.schedule_throttled(field, window);
        } else {
            if self.opts.debug {
                tracing::debug!(field = %field, "immediate write");
            }
            self.dispatch(std::slice::from_ref(&field));
        }
    }

    // -----------------------------------------------------------------------
    // Pacing strategies
    // -----------------------------------------------------------------------

    fn schedule_debounced(self: &Arc<Self>, field: String, window: u64) {
        if self.opts.debug {
            tracing::debug!(field = %field, window, "debounce window restarted");
        }

        let mut st = self.state.lock();
        if let Some(timer) = st.debounce_timer.take() {
            timer.abort();
        }
        st.pending_field = Some(field.clone());

        let this = Arc::clone(self);
        st.debounce_timer = Some(tokio::spawn(async move {
            sleep(Duration::from_millis(window)).await;
            if this.disposed.load(Ordering::SeqCst) {
                return;
            }
            {
                let mut st = this.state.lock();
                st.debounce_timer = None;
                st.pending_field = None;
            }
            this.dispatch(std::slice::from_ref(&field));
        }));
    }

    fn schedule_throttled(self: &Arc<Self>, field: String, window: u64) {
        let window_dur = Duration::from_millis(window);
        let now = Instant::now();

        let elapsed_ok = {
            let st = self.state.lock();
            match st.last_write.get(&field) {
                Some(at) => now.duration_since(*at) >= window_dur,
                None => true,
            }
        };

        if elapsed_ok {
            if self.opts.debug {
                tracing::debug!(field = %field, "throttle window open, writing now");
            }
            if let Some(timer) = self.state.lock().throttle_timers.remove(&field) {
                timer.abort();
            }
            self.dispatch(std::slice::from_ref(&field));
            return;
        }

        // Inside the window: one trailing write at its end picks up whatever
        // the field's value is by then. An already scheduled trailing write
        // covers this edit too.
        let mut st = self.state.lock();
        if st.throttle_timers.contains_key(&field) {
            return;
        }
        if self.opts.debug {
            tracing::debug!(field = %field, window, "throttled, trailing write scheduled");
        }

        let remaining = st
            .last_write
            .get(&field)
            .map(|at| window_dur.saturating_sub(now.duration_since(*at)))
            .unwrap_or(window_dur);

        let this = Arc::clone(self);
        let key = field.clone();
        st.throttle_timers.insert(
            key,
            tokio::spawn(async move {
                sleep(remaining).await;
                if this.disposed.load(Ordering::SeqCst) {
                    return;
                }
                this.state.lock().throttle_timers.remove(&field);
                this.dispatch(std::slice::from_ref(&field));
            }),
        );
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Rebuild operations for the given fields and fire one transaction.
    /// An empty batch (the fields converged back to the remote state while
    /// a timer was pending) writes nothing.
    fn dispatch(&self, fields: &[String]) {
        let mut ops: Vec<Operation> = Vec::new();
        for field in fields {
            ops.extend((self.build_ops)(field));
        }
        if ops.is_empty() {
            if self.opts.debug {
                tracing::debug!(?fields, "no divergence at fire time, skipping write");
            }
            return;
        }

        {
            let mut st = self.state.lock();
            let now = Instant::now();
            for field in fields {
                if self.opts.throttle.contains_key(field) {
                    st.last_write.insert(field.clone(), now);
                }
            }
        }

        if self.opts.debug {
            tracing::debug!(?fields, op_count = ops.len(), "transacting");
        }

        let client = self.client.clone();
        let on_error = self.opts.on_write_error.clone();
        tokio::spawn(async move {
            if let Err(e) = client.transact(ops).await {
                tracing::error!(error = %e, "form update transaction failed");
                if let Some(callback) = on_error {
                    callback(e);
                }
            }
        });
    }

    fn abort_all_timers(&self) {
        let mut st = self.state.lock();
        if let Some(timer) = st.debounce_timer.take() {
            timer.abort();
        }
        st.pending_field = None;
        for (_, timer) in st.throttle_timers.drain() {
            timer.abort();
        }
    }
}
