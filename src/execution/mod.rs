//! Flow executions: the runtime side of the state machine.
//!
//! A [`FlowExecution`] owns a stack of [`FlowSession`]s and drives them through
//! a [`RequestContext`] for the duration of one request. Listeners observe
//! every step and may veto state entry.

mod context;
pub(crate) mod event;
#[allow(clippy::module_inception)]
mod execution;
mod external;
mod factory;
mod listener;
mod machine;
mod session;

pub use context::RequestContext;
pub use event::Event;
pub use execution::{FlowExecution, FlowExecutionOutcome, FlowExecutionStatus};
pub use external::{EVENT_ID_PARAMETER, ExternalContext, LocalExternalContext};
pub use factory::FlowExecutionFactory;
pub use listener::{ALL_FLOWS, ConditionalListenerLoader, FlowExecutionListener, FlowExecutionListenerLoader, Veto};
pub use session::{FlowSession, FlowSessionStatus};
