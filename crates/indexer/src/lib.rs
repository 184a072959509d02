//! Single-writer background indexer for the block database, plus the
//! rendezvous object callers use to coordinate with it.

pub mod inject;
pub mod progress;
pub mod source;
pub mod viewer;
pub mod worker;

pub use inject::{FailureKind, Rendezvous};
pub use progress::{BdmAction, BdmCallback, BdmPhase, NullCallback};
pub use source::BlockSource;
pub use viewer::BlockDataViewer;
pub use worker::BlockDataManagerThread;
