//! Flow definitions: the immutable state machine shared by all executions.

pub(crate) mod action;
mod builder;
pub(crate) mod expression;
mod flow;
mod mapping;
mod registry;
mod state;
mod transition;

pub use action::{Action, EvaluateAction, FnAction, SetAction, is_success_event};
pub use builder::{FlowBuilder, StateBuilder, TransitionBuilder};
pub use expression::{
    ComparisonExpression, ComparisonOperator, DefaultExpressionParser, EventExpression, Expression, ExpressionParser, FnExpression, ImplicitExpression, LiteralExpression,
    NotExpression, ScopeExpression,
};
pub use flow::Flow;
pub use mapping::{ExpressionMapping, Mapping};
pub use registry::{FlowDefinitionLocator, FlowDefinitionRegistry};
pub use state::{State, StateKind, SubflowResolver};
pub use transition::{HistoryPolicy, TargetStateResolver, Transition, TransitionCriteria};
