//! Caller/worker rendezvous.
//!
//! Wake-ups coalesce: any number of `notify` calls with no intervening
//! worker run collapse into one pending run, and that single run
//! satisfies every `wait_run` caller. The failure flag is sticky; once
//! set, `wait_run` returns immediately with the failure kind.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureKind {
    CorruptDatabase,
    InvariantViolation,
    Io,
    ReorgConflict,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::CorruptDatabase => write!(f, "corrupt database"),
            FailureKind::InvariantViolation => write!(f, "invariant violation"),
            FailureKind::Io => write!(f, "storage i/o failure"),
            FailureKind::ReorgConflict => write!(f, "reorg conflict"),
        }
    }
}

#[derive(Default)]
struct RendezvousState {
    notify_seq: u64,
    run_seq: u64,
    failure: Option<FailureKind>,
}

#[derive(Default)]
pub struct Rendezvous {
    state: Mutex<RendezvousState>,
    condvar: Condvar,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the worker. Every pending notification is covered by the
    /// next run's snapshot, so repeated calls before the worker runs
    /// coalesce into a single run; a call racing a run in progress
    /// triggers one more.
    pub fn notify(&self) {
        let mut state = self.state.lock().expect("rendezvous lock");
        state.notify_seq += 1;
        self.condvar.notify_all();
    }

    /// Worker side: block until a run is pending, a failure is set, or
    /// the timeout elapses. Returns whether a run is pending.
    pub fn wait(&self, timeout: Duration) -> bool {
        let state = self.state.lock().expect("rendezvous lock");
        let (state, _) = self
            .condvar
            .wait_timeout_while(state, timeout, |state| {
                state.notify_seq == state.run_seq && state.failure.is_none()
            })
            .expect("rendezvous lock");
        state.notify_seq > state.run_seq
    }

    /// Caller side: block until the worker completes a run that covers
    /// this caller's `notify`, or until the failure flag is set.
    pub fn wait_run(&self) -> Result<(), FailureKind> {
        let mut state = self.state.lock().expect("rendezvous lock");
        let target = state.notify_seq;
        loop {
            if let Some(kind) = state.failure {
                return Err(kind);
            }
            if state.run_seq >= target {
                return Ok(());
            }
            state = self.condvar.wait(state).expect("rendezvous lock");
        }
    }

    /// Worker side: snapshot the pending sequence before running.
    pub fn begin_run(&self) -> u64 {
        self.state.lock().expect("rendezvous lock").notify_seq
    }

    /// Worker side: mark a run complete, releasing `wait_run` callers.
    pub fn complete_run(&self, sequence: u64) {
        let mut state = self.state.lock().expect("rendezvous lock");
        if sequence > state.run_seq {
            state.run_seq = sequence;
        }
        self.condvar.notify_all();
    }

    /// Worker side: record a sticky failure. Every current and future
    /// `wait_run` caller observes it.
    pub fn set_failure_flag(&self, kind: FailureKind) {
        let mut state = self.state.lock().expect("rendezvous lock");
        if state.failure.is_none() {
            state.failure = Some(kind);
        }
        self.condvar.notify_all();
    }

    pub fn failure(&self) -> Option<FailureKind> {
        self.state.lock().expect("rendezvous lock").failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn notify_coalesces() {
        let rendezvous = Rendezvous::new();
        rendezvous.notify();
        rendezvous.notify();
        rendezvous.notify();
        // Three notifications, one run: the snapshot covers them all.
        assert!(rendezvous.wait(Duration::from_millis(1)));
        let sequence = rendezvous.begin_run();
        rendezvous.complete_run(sequence);
        assert!(!rendezvous.wait(Duration::from_millis(1)));
        rendezvous.wait_run().unwrap();
    }

    #[test]
    fn notify_during_run_triggers_another() {
        let rendezvous = Rendezvous::new();
        rendezvous.notify();
        let sequence = rendezvous.begin_run();
        // A notification lands while the run is in flight.
        rendezvous.notify();
        rendezvous.complete_run(sequence);
        assert!(rendezvous.wait(Duration::from_millis(1)));
    }

    #[test]
    fn wait_run_blocks_until_run_completes() {
        let rendezvous = Arc::new(Rendezvous::new());
        rendezvous.notify();
        let worker = {
            let rendezvous = Arc::clone(&rendezvous);
            thread::spawn(move || {
                assert!(rendezvous.wait(Duration::from_secs(5)));
                let sequence = rendezvous.begin_run();
                rendezvous.complete_run(sequence);
            })
        };
        rendezvous.wait_run().unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn failure_flag_is_sticky() {
        let rendezvous = Rendezvous::new();
        rendezvous.notify();
        rendezvous.set_failure_flag(FailureKind::CorruptDatabase);
        // A later, different failure does not overwrite the first.
        rendezvous.set_failure_flag(FailureKind::Io);
        assert_eq!(rendezvous.wait_run(), Err(FailureKind::CorruptDatabase));
        assert_eq!(rendezvous.wait_run(), Err(FailureKind::CorruptDatabase));
        assert_eq!(rendezvous.failure(), Some(FailureKind::CorruptDatabase));
    }
}
