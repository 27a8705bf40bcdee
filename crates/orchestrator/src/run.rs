//! Shared control surface of one run.

use std::collections::BTreeMap;
use std::sync::Mutex;

use protocol_core::{FinishReason, ProtocolError, Result, Run, RunState};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::InputValues;
use crate::state_machine::RunStateMachine;

/// Result of asking a run to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The run will end with `finish_reason = canceled`.
    Accepted,
    /// The run had already finished; nothing changes.
    AlreadyFinished(FinishReason),
}

struct RunSlot {
    run: Run,
    pending_keys: Option<BTreeMap<String, String>>,
    /// Id of the `wait_for_input` event the pending keys were announced by.
    pending_event: Option<u64>,
    cancel_requested: bool,
}

/// State of one run, shared by its controller and by requests routed to it.
///
/// Every state change goes through this handle's lock, so concurrent
/// resume and cancel requests observe a single linear history.
pub struct RunHandle {
    slot: Mutex<RunSlot>,
    cancel: CancellationToken,
    input: mpsc::Sender<InputValues>,
}

impl RunHandle {
    /// Handle for a run in `Starting`, delivering resumes to `input`.
    pub fn new(run: Run, input: mpsc::Sender<InputValues>) -> Self {
        Self {
            slot: Mutex::new(RunSlot {
                run,
                pending_keys: None,
                pending_event: None,
                cancel_requested: false,
            }),
            cancel: CancellationToken::new(),
            input,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RunSlot> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run id.
    pub fn id(&self) -> Uuid {
        self.lock().run.id
    }

    /// Thread the run belongs to.
    pub fn thread_id(&self) -> Uuid {
        self.lock().run.thread_id
    }

    /// Copy of the run as it is right now.
    pub fn snapshot(&self) -> Run {
        self.lock().run.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RunState {
        self.lock().run.state
    }

    /// Whether the run has finished.
    pub fn is_terminal(&self) -> bool {
        self.lock().run.is_terminal()
    }

    /// Token the adapter watches for cancellation.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether a cancel has been accepted.
    pub fn cancel_requested(&self) -> bool {
        self.lock().cancel_requested
    }

    /// Keys the run is waiting for, if it is waiting.
    pub fn pending_keys(&self) -> Option<BTreeMap<String, String>> {
        self.lock().pending_keys.clone()
    }

    pub(crate) fn activate(&self) -> Result<()> {
        let mut slot = self.lock();
        RunStateMachine::validate_transition(&slot.run.state, &RunState::Active)?;
        slot.run.activate();
        Ok(())
    }

    /// `Active -> WaitingForInput`.
    ///
    /// `record` appends the `wait_for_input` event and returns its id. It
    /// runs under this handle's lock, so no resume is accepted before the
    /// event is in the log.
    pub(crate) fn wait_for_input<F>(&self, keys: BTreeMap<String, String>, record: F) -> Result<u64>
    where
        F: FnOnce(&BTreeMap<String, String>) -> Result<u64>,
    {
        let mut slot = self.lock();
        RunStateMachine::validate_transition(&slot.run.state, &RunState::WaitingForInput)?;
        let event_id = record(&keys)?;
        slot.run.wait_for_input();
        slot.pending_keys = Some(keys);
        slot.pending_event = Some(event_id);
        Ok(event_id)
    }

    /// Move the run into its terminal state.
    ///
    /// `record` receives the effective finish reason, which is `canceled`
    /// whenever a cancel was accepted, and appends the terminal event. It
    /// runs under this handle's lock before the state changes, so anyone who
    /// sees the run finished also finds its terminal event in the log.
    /// Returns `None` if the run had already finished.
    pub(crate) fn finish<F, R>(&self, reason: FinishReason, record: F) -> Option<(FinishReason, R)>
    where
        F: FnOnce(FinishReason) -> R,
    {
        let mut slot = self.lock();
        if slot.run.is_terminal() {
            return None;
        }

        let reason = if slot.cancel_requested {
            FinishReason::Canceled
        } else {
            reason
        };
        let recorded = record(reason);
        slot.run.finish(reason);
        slot.pending_keys = None;
        slot.pending_event = None;
        Some((reason, recorded))
    }

    /// Ask the run to stop. Idempotent while the run is still live.
    pub fn request_cancel(&self) -> CancelOutcome {
        let mut slot = self.lock();
        if slot.run.is_terminal() {
            let reason = slot.run.finish_reason.unwrap_or(FinishReason::Canceled);
            return CancelOutcome::AlreadyFinished(reason);
        }

        slot.cancel_requested = true;
        self.cancel.cancel();
        CancelOutcome::Accepted
    }

    /// Feed answers to a run that is waiting for input.
    ///
    /// Returns the id of the `wait_for_input` event being answered; every
    /// later event follows the resume. Fails with a conflict unless the run
    /// is `WaitingForInput`, and with a validation error if any requested key
    /// is missing.
    pub fn resume(&self, values: InputValues) -> Result<Option<u64>> {
        let mut slot = self.lock();
        if slot.run.state != RunState::WaitingForInput || slot.cancel_requested {
            return Err(ProtocolError::conflict(format!(
                "Run {} is {}, not waiting for input",
                slot.run.id,
                slot.run.state.as_str()
            )));
        }

        if let Some(pending) = &slot.pending_keys {
            let missing: Vec<&str> = pending
                .keys()
                .filter(|key| !values.contains_key(*key))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(ProtocolError::validation(format!(
                    "Missing input for keys: {}",
                    missing.join(", ")
                )));
            }
        }

        RunStateMachine::validate_transition(&slot.run.state, &RunState::Active)?;
        self.input.try_send(values).map_err(|_| {
            ProtocolError::conflict(format!("Run {} is no longer accepting input", slot.run.id))
        })?;

        slot.run.activate();
        slot.pending_keys = None;
        Ok(slot.pending_event.take())
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.lock();
        f.debug_struct("RunHandle")
            .field("run_id", &slot.run.id)
            .field("state", &slot.run.state)
            .field("cancel_requested", &slot.cancel_requested)
            .finish()
    }
}
