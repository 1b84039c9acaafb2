//! Kernel event tracing
//!
//! Observes process creation, exit and kill-signal delivery for the agent
//! population and keeps a durable event log for offline attribution.

pub mod event;
pub mod log;
pub mod parse;
pub mod procinfo;
pub mod source;
pub mod tracer;

pub use event::{EventType, KernelEvent};
pub use source::{AttachReport, ProbeSource};
pub use tracer::{Tracer, TracerConfig};
