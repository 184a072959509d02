//! Progress phases and the callback surface into the wallet layer.

use crate::inject::FailureKind;

/// The closed set of phases the worker reports from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BdmPhase {
    Init,
    ScanHeaders,
    OrganizeChain,
    BuildDb,
    ScanAddresses,
    Rescan,
    Ready,
}

#[derive(Clone, Debug, PartialEq)]
pub enum BdmAction {
    /// Initial scan finished; the database serves reads.
    Ready { height: u32 },
    /// A new block was applied on the main branch.
    NewBlock { height: u32 },
    /// State changed in a way that invalidates cached views (reorg).
    Refresh,
    /// The worker stopped advancing.
    Failure { kind: FailureKind, message: String },
}

pub trait BdmCallback: Send + Sync {
    fn run(&self, action: BdmAction);

    fn progress(
        &self,
        phase: BdmPhase,
        wallet_ids: &[String],
        fraction: f32,
        seconds_remaining: u32,
        numeric: u32,
    );
}

/// Callback that discards everything; for callers that only poll.
pub struct NullCallback;

impl BdmCallback for NullCallback {
    fn run(&self, _action: BdmAction) {}

    fn progress(
        &self,
        _phase: BdmPhase,
        _wallet_ids: &[String],
        _fraction: f32,
        _seconds_remaining: u32,
        _numeric: u32,
    ) {
    }
}
