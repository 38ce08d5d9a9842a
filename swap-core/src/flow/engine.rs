use super::{FlowEvent, FlowKind, FlowRecord, FlowState, Step};
use crate::error::{Result, SwapError};
use crate::storage::FlowStore;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, MutexGuard};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;

/// Options for [`StepEngine::finish_step`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FinishOptions {
    /// Return `Ok(false)` instead of a fault when `step` is not current.
    pub silent_error: bool,
}

impl FinishOptions {
    pub const STRICT: FinishOptions = FinishOptions { silent_error: false };
    pub const SILENT: FinishOptions = FinishOptions { silent_error: true };
}

/// Owns a flow's [`FlowState`]: step sequencing, persistence and the
/// single entry point for every mutation.
///
/// A mutation is applied to a copy, persisted, and only then made visible,
/// so a failed write leaves the last good state in place.
pub struct StepEngine {
    swap_id: Uuid,
    kind: FlowKind,
    state: Mutex<FlowState>,
    store: Arc<dyn FlowStore>,
    step_tx: watch::Sender<usize>,
    events: broadcast::Sender<FlowEvent>,
    /// Held while a step function runs; steps of one flow never overlap.
    step_lock: Mutex<()>,
    /// Flips once, on abandon. No write goes through afterwards.
    closed: watch::Sender<bool>,
}

impl StepEngine {
    /// Load the persisted flow for `swap_id`, or create and persist a fresh
    /// one at step 0.
    pub async fn open(swap_id: Uuid, kind: FlowKind, store: Arc<dyn FlowStore>) -> Result<Self> {
        let state = match store.load(swap_id).await? {
            Some(record) if record.kind != kind => {
                return Err(SwapError::FlowKindMismatch {
                    swap_id,
                    stored: record.kind,
                    requested: kind,
                });
            }
            Some(record) => {
                tracing::info!(
                    "Resuming {} flow for swap {} at step {} ({})",
                    kind,
                    swap_id,
                    record.state.step,
                    kind.step_at(record.state.step)
                );
                record.state
            }
            None => {
                let state = FlowState {
                    version: 1,
                    ..FlowState::default()
                };
                store.save(&FlowRecord::new(swap_id, kind, state.clone())).await?;
                tracing::info!("Created {} flow for swap {}", kind, swap_id);
                state
            }
        };

        let (step_tx, _) = watch::channel(state.step);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (closed, _) = watch::channel(false);

        Ok(Self {
            swap_id,
            kind,
            state: Mutex::new(state),
            store,
            step_tx,
            events,
            step_lock: Mutex::new(()),
            closed,
        })
    }

    pub fn swap_id(&self) -> Uuid {
        self.swap_id
    }

    pub fn kind(&self) -> FlowKind {
        self.kind
    }

    /// Snapshot of the current state.
    pub async fn state(&self) -> FlowState {
        self.state.lock().await.clone()
    }

    pub fn step_index(&self) -> usize {
        *self.step_tx.borrow()
    }

    pub fn current_step(&self) -> Step {
        self.kind.step_at(self.step_index())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: FlowEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    pub(crate) async fn lock_step(&self) -> MutexGuard<'_, ()> {
        self.step_lock.lock().await
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the flow has been abandoned.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        // the sender lives as long as `self`
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Resolves once the step pointer is no longer `from`.
    pub async fn wait_step_change(&self, from: usize) {
        let mut rx = self.step_tx.subscribe();
        loop {
            if *rx.borrow_and_update() != from {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Merge `patch` into the state and persist it without moving the step
    /// pointer.
    pub async fn set_state<F>(&self, patch: F) -> Result<FlowState>
    where
        F: FnOnce(&mut FlowState) + Send,
    {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        patch(&mut next);
        next.step = guard.step;
        next.version = guard.version + 1;

        self.persist(&next).await?;
        *guard = next.clone();
        Ok(next)
    }

    /// Merge `patch`, persist, and advance past `step` if it is the current
    /// step.
    ///
    /// Returns `Ok(true)` when the pointer advanced.
    ///
    /// When `step` is not current the pointer never moves. Without
    /// `silent_error` the call fails with [`SwapError::StepMismatch`] and
    /// applies nothing. With it the call returns `Ok(false)`; a completion
    /// racing ahead of the pointer is kept as a plain state patch, while a
    /// late duplicate for a step already passed is dropped entirely.
    pub async fn finish_step<F>(&self, step: Step, options: FinishOptions, patch: F) -> Result<bool>
    where
        F: FnOnce(&mut FlowState) + Send,
    {
        let mut guard = self.state.lock().await;
        let current = self.kind.step_at(guard.step);

        if current != step || step.is_terminal() {
            if !options.silent_error {
                return Err(SwapError::StepMismatch {
                    requested: step,
                    current,
                });
            }

            let ahead = self.kind.index_of(step).is_some_and(|i| i > guard.step);
            if !ahead || step.is_terminal() {
                tracing::debug!(
                    "Can't finish step {} when on step {} ({}), ignoring",
                    step,
                    guard.step,
                    current
                );
                return Ok(false);
            }

            tracing::debug!(
                "Step {} completed early while on step {} ({}), keeping its state",
                step,
                guard.step,
                current
            );
            let mut next = guard.clone();
            patch(&mut next);
            next.step = guard.step;
            next.version = guard.version + 1;
            self.persist(&next).await?;
            *guard = next;
            return Ok(false);
        }

        let mut next = guard.clone();
        patch(&mut next);
        next.step = guard.step + 1;
        next.version = guard.version + 1;

        self.persist(&next).await?;
        *guard = next;
        let index = guard.step;
        drop(guard);

        let new_step = self.kind.step_at(index);
        tracing::info!(
            "Swap {} finished step {}, now on step {} ({})",
            self.swap_id,
            step,
            index,
            new_step
        );
        self.step_tx.send_replace(index);
        self.emit(FlowEvent::StepChanged {
            index,
            step: new_step,
        });
        Ok(true)
    }

    /// Replace the whole state, moving the pointer back to `step`. Only the
    /// restart-after-refund path does this.
    pub(crate) async fn reset_to<F>(&self, step: Step, build: F) -> Result<FlowState>
    where
        F: FnOnce(&FlowState) -> FlowState + Send,
    {
        let index = self
            .kind
            .index_of(step)
            .ok_or_else(|| SwapError::internal(format!("{} has no step {}", self.kind, step)))?;

        let mut guard = self.state.lock().await;
        let mut next = build(&guard);
        next.step = index;
        next.version = guard.version + 1;

        self.persist(&next).await?;
        *guard = next.clone();
        drop(guard);

        tracing::warn!("Swap {} restarted at step {} ({})", self.swap_id, index, step);
        self.step_tx.send_replace(index);
        self.emit(FlowEvent::StepChanged { index, step });
        Ok(next)
    }

    /// Delete the persisted record and close the engine: every later
    /// mutation fails with [`SwapError::Abandoned`] and a running step is
    /// stopped.
    pub async fn abandon(&self) -> Result<()> {
        let _guard = self.state.lock().await;
        if self.is_closed() {
            return Err(SwapError::Abandoned(self.swap_id));
        }
        self.store.remove(self.swap_id).await?;
        self.closed.send_replace(true);
        tracing::warn!("Swap {} abandoned", self.swap_id);
        Ok(())
    }

    /// Callers hold the state lock, which `abandon` takes too.
    async fn persist(&self, state: &FlowState) -> Result<()> {
        if self.is_closed() {
            return Err(SwapError::Abandoned(self.swap_id));
        }
        let record = FlowRecord::new(self.swap_id, self.kind, state.clone());
        self.store.save(&record).await
    }
}
