//! Client-facing surface of the crate: the apply stream element type and the
//! tunable options.
mod apply;
mod options;

pub use apply::ApplyMsg;
pub use apply::ApplyReceiver;
pub use apply::ApplySender;
pub use options::InvalidOptions;
pub use options::RaftOptions;
pub(crate) use options::RaftOptionsValidated;
