//! Programmatic assembly of flow definitions.
//!
//! Criteria and target strings are parsed when [`FlowBuilder::build`] runs,
//! with the parser configured on the builder:
//! - `"*"` matches every event,
//! - `"${...}"` is an expression,
//! - anything else is a literal event id (criteria) or state id (target).

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::{
    Action, AttributeMap, ConvoflowError, DefaultExpressionParser, ExpressionMapping, ExpressionParser, Flow, HistoryPolicy, Mapping, Result, State, StateKind,
    SubflowResolver, TargetStateResolver, Transition, TransitionCriteria, definition::expression::is_delimited,
};

const WILDCARD: &str = "*";

enum CriteriaSource {
    Text(String),
    Criteria(TransitionCriteria),
}

pub struct TransitionBuilder {
    on: CriteriaSource,
    to: Option<String>,
    execution_criteria: Vec<Arc<dyn Action>>,
    history: HistoryPolicy,
    attributes: AttributeMap,
}

impl TransitionBuilder {
    pub fn on(criteria: &str) -> Self {
        Self::from_source(CriteriaSource::Text(criteria.to_string()))
    }

    pub fn on_criteria(criteria: TransitionCriteria) -> Self {
        Self::from_source(CriteriaSource::Criteria(criteria))
    }

    fn from_source(on: CriteriaSource) -> Self {
        Self {
            on,
            to: None,
            execution_criteria: Vec::new(),
            history: HistoryPolicy::Preserve,
            attributes: AttributeMap::new(),
        }
    }

    pub fn to(
        mut self,
        target: &str,
    ) -> Self {
        self.to = Some(target.to_string());
        self
    }

    pub fn execution_criteria(
        mut self,
        action: impl Action + 'static,
    ) -> Self {
        self.execution_criteria.push(Arc::new(action));
        self
    }

    pub fn history(
        mut self,
        policy: HistoryPolicy,
    ) -> Self {
        self.history = policy;
        self
    }

    pub fn attribute(
        mut self,
        key: &str,
        value: impl Into<Value>,
    ) -> Self {
        self.attributes = self.attributes.with(key, value);
        self
    }

    fn static_target(&self) -> Option<&str> {
        self.to.as_deref().filter(|t| !is_delimited(t))
    }

    fn build(
        self,
        parser: &dyn ExpressionParser,
    ) -> Result<Transition> {
        let criteria = match self.on {
            CriteriaSource::Criteria(c) => c,
            CriteriaSource::Text(text) if text.trim() == WILDCARD => TransitionCriteria::Wildcard,
            CriteriaSource::Text(text) if is_delimited(&text) => TransitionCriteria::Expression(parser.parse(&text)?),
            CriteriaSource::Text(text) if text.trim().is_empty() => {
                return Err(ConvoflowError::Definition("transition criteria must not be blank".to_string()));
            }
            CriteriaSource::Text(text) => TransitionCriteria::EventId(text.trim().to_string()),
        };
        let target = match self.to {
            None => None,
            Some(to) if is_delimited(&to) => Some(TargetStateResolver::Expression(parser.parse(&to)?)),
            Some(to) => Some(TargetStateResolver::Static(to)),
        };

        let mut transition = Transition::new(criteria, target);
        transition.execution_criteria = self.execution_criteria;
        transition.history = self.history;
        transition.attributes = self.attributes;
        Ok(transition)
    }
}

enum PendingKind {
    View {
        view: Option<String>,
        redirect: bool,
        render_actions: Vec<Arc<dyn Action>>,
    },
    Action {
        actions: Vec<Arc<dyn Action>>,
    },
    Decision,
    Subflow {
        subflow: String,
        input: Vec<(String, String)>,
        output: Option<Vec<Mapping>>,
    },
    End {
        output: Vec<(String, String)>,
        view: Option<String>,
    },
}

pub struct StateBuilder {
    id: String,
    kind: PendingKind,
    entry_actions: Vec<Arc<dyn Action>>,
    exit_actions: Vec<Arc<dyn Action>>,
    transitions: Vec<TransitionBuilder>,
    attributes: AttributeMap,
    errors: Vec<String>,
}

impl StateBuilder {
    fn new(
        id: &str,
        kind: PendingKind,
    ) -> Self {
        Self {
            id: id.to_string(),
            kind,
            entry_actions: Vec::new(),
            exit_actions: Vec::new(),
            transitions: Vec::new(),
            attributes: AttributeMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn view(id: &str) -> Self {
        Self::new(
            id,
            PendingKind::View {
                view: None,
                redirect: false,
                render_actions: Vec::new(),
            },
        )
    }

    pub fn action(id: &str) -> Self {
        Self::new(
            id,
            PendingKind::Action {
                actions: Vec::new(),
            },
        )
    }

    pub fn decision(id: &str) -> Self {
        Self::new(id, PendingKind::Decision)
    }

    /// `subflow` is a flow id or a `${...}` expression yielding one.
    pub fn subflow(
        id: &str,
        subflow: &str,
    ) -> Self {
        Self::new(
            id,
            PendingKind::Subflow {
                subflow: subflow.to_string(),
                input: Vec::new(),
                output: None,
            },
        )
    }

    pub fn end(id: &str) -> Self {
        Self::new(
            id,
            PendingKind::End {
                output: Vec::new(),
                view: None,
            },
        )
    }

    fn misuse(
        &mut self,
        what: &str,
    ) {
        self.errors.push(format!("{} is not supported by {} state '{}'", what, self.kind_name(), self.id));
    }

    fn kind_name(&self) -> &'static str {
        match self.kind {
            PendingKind::View { .. } => "view",
            PendingKind::Action { .. } => "action",
            PendingKind::Decision => "decision",
            PendingKind::Subflow { .. } => "subflow",
            PendingKind::End { .. } => "end",
        }
    }

    /// View name rendered by a view state, or the final response of an end state.
    pub fn view_name(
        mut self,
        name: &str,
    ) -> Self {
        match &mut self.kind {
            PendingKind::View { view, .. } | PendingKind::End { view, .. } => *view = Some(name.to_string()),
            _ => self.misuse("a view name"),
        }
        self
    }

    /// Requests a flow execution redirect instead of rendering.
    pub fn redirect(mut self) -> Self {
        match &mut self.kind {
            PendingKind::View { redirect, .. } => *redirect = true,
            _ => self.misuse("redirect"),
        }
        self
    }

    pub fn render_action(
        mut self,
        action: impl Action + 'static,
    ) -> Self {
        match &mut self.kind {
            PendingKind::View { render_actions, .. } => render_actions.push(Arc::new(action)),
            _ => self.misuse("a render action"),
        }
        self
    }

    pub fn action_step(
        mut self,
        action: impl Action + 'static,
    ) -> Self {
        match &mut self.kind {
            PendingKind::Action { actions } => actions.push(Arc::new(action)),
            _ => self.misuse("an action step"),
        }
        self
    }

    /// Subflow input: `expression` is evaluated in the parent flow and stored
    /// under `target` in the subflow input.
    pub fn input(
        mut self,
        expression: &str,
        target: &str,
    ) -> Self {
        match &mut self.kind {
            PendingKind::Subflow { input, .. } => input.push((expression.to_string(), target.to_string())),
            _ => self.misuse("an input mapping"),
        }
        self
    }

    /// For subflow states, copies output attribute `source` into flow scope as
    /// `target`. For end states, evaluates the expression `source` into the
    /// session output as `target`.
    pub fn output(
        mut self,
        source: &str,
        target: &str,
    ) -> Self {
        match &mut self.kind {
            PendingKind::Subflow { output, .. } => output.get_or_insert_with(Vec::new).push(Mapping::new(source, target)),
            PendingKind::End { output, .. } => output.push((source.to_string(), target.to_string())),
            _ => self.misuse("an output mapping"),
        }
        self
    }

    pub fn entry_action(
        mut self,
        action: impl Action + 'static,
    ) -> Self {
        self.entry_actions.push(Arc::new(action));
        self
    }

    pub fn exit_action(
        mut self,
        action: impl Action + 'static,
    ) -> Self {
        self.exit_actions.push(Arc::new(action));
        self
    }

    pub fn on(
        self,
        criteria: &str,
        target: &str,
    ) -> Self {
        self.transition(TransitionBuilder::on(criteria).to(target))
    }

    /// A transition without a target: the view state is rendered again.
    pub fn stay_on(
        self,
        criteria: &str,
    ) -> Self {
        self.transition(TransitionBuilder::on(criteria))
    }

    /// Decision branch taken when `expression` holds.
    pub fn when(
        self,
        expression: &str,
        target: &str,
    ) -> Self {
        let criteria = if is_delimited(expression) { expression.to_string() } else { format!("${{{}}}", expression) };
        self.on(&criteria, target)
    }

    pub fn otherwise(
        self,
        target: &str,
    ) -> Self {
        self.on(WILDCARD, target)
    }

    pub fn transition(
        mut self,
        transition: TransitionBuilder,
    ) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn attribute(
        mut self,
        key: &str,
        value: impl Into<Value>,
    ) -> Self {
        self.attributes = self.attributes.with(key, value);
        self
    }

    fn build(
        self,
        flow_id: &str,
        parser: &dyn ExpressionParser,
    ) -> Result<State> {
        if let Some(error) = self.errors.first() {
            return Err(ConvoflowError::Definition(format!("flow '{}': {}", flow_id, error)));
        }
        let kind = match self.kind {
            PendingKind::View {
                view,
                redirect,
                render_actions,
            } => StateKind::View {
                view,
                redirect,
                render_actions,
            },
            PendingKind::Action { actions } => {
                if actions.is_empty() {
                    return Err(ConvoflowError::Definition(format!("flow '{}': action state '{}' has no actions", flow_id, self.id)));
                }
                StateKind::Action { actions }
            }
            PendingKind::Decision => StateKind::Decision,
            PendingKind::Subflow {
                subflow,
                input,
                output,
            } => StateKind::Subflow {
                subflow: if is_delimited(&subflow) { SubflowResolver::Expression(parser.parse(&subflow)?) } else { SubflowResolver::Static(subflow) },
                input: expression_mappings(input, parser)?,
                output,
            },
            PendingKind::End { output, view } => StateKind::End {
                output: expression_mappings(output, parser)?,
                view,
            },
        };
        let transitions = self.transitions.into_iter().map(|t| t.build(parser)).collect::<Result<Vec<_>>>()?;

        Ok(State {
            id: self.id,
            flow_id: flow_id.to_string(),
            kind,
            entry_actions: self.entry_actions,
            exit_actions: self.exit_actions,
            transitions,
            attributes: self.attributes,
        })
    }
}

fn expression_mappings(
    mappings: Vec<(String, String)>,
    parser: &dyn ExpressionParser,
) -> Result<Vec<ExpressionMapping>> {
    mappings.into_iter().map(|(expression, target)| Ok(ExpressionMapping::new(parser.parse(&expression)?, &target))).collect()
}

pub struct FlowBuilder {
    id: String,
    parser: Arc<dyn ExpressionParser>,
    states: Vec<StateBuilder>,
    start_state: Option<String>,
    global_transitions: Vec<TransitionBuilder>,
    variables: AttributeMap,
    input: Option<Vec<Mapping>>,
    start_actions: Vec<Arc<dyn Action>>,
    end_actions: Vec<Arc<dyn Action>>,
    attributes: AttributeMap,
}

impl FlowBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            parser: Arc::new(DefaultExpressionParser::new()),
            states: Vec::new(),
            start_state: None,
            global_transitions: Vec::new(),
            variables: AttributeMap::new(),
            input: None,
            start_actions: Vec::new(),
            end_actions: Vec::new(),
            attributes: AttributeMap::new(),
        }
    }

    pub fn parser(
        mut self,
        parser: Arc<dyn ExpressionParser>,
    ) -> Self {
        self.parser = parser;
        self
    }

    pub fn state(
        mut self,
        state: StateBuilder,
    ) -> Self {
        self.states.push(state);
        self
    }

    /// Defaults to the first declared state.
    pub fn start_state(
        mut self,
        state_id: &str,
    ) -> Self {
        self.start_state = Some(state_id.to_string());
        self
    }

    pub fn global_transition(
        mut self,
        transition: TransitionBuilder,
    ) -> Self {
        self.global_transitions.push(transition);
        self
    }

    pub fn variable(
        mut self,
        name: &str,
        initial: impl Into<Value>,
    ) -> Self {
        self.variables = self.variables.with(name, initial);
        self
    }

    /// Once any input mapping is declared, only mapped input reaches flow scope.
    pub fn input_mapping(
        mut self,
        mapping: Mapping,
    ) -> Self {
        self.input.get_or_insert_with(Vec::new).push(mapping);
        self
    }

    pub fn start_action(
        mut self,
        action: impl Action + 'static,
    ) -> Self {
        self.start_actions.push(Arc::new(action));
        self
    }

    pub fn end_action(
        mut self,
        action: impl Action + 'static,
    ) -> Self {
        self.end_actions.push(Arc::new(action));
        self
    }

    pub fn attribute(
        mut self,
        key: &str,
        value: impl Into<Value>,
    ) -> Self {
        self.attributes = self.attributes.with(key, value);
        self
    }

    pub fn build(self) -> Result<Flow> {
        let flow_id = self.id.trim().to_string();
        if flow_id.is_empty() {
            return Err(ConvoflowError::Definition("flow id must not be blank".to_string()));
        }
        let Some(first) = self.states.first() else {
            return Err(ConvoflowError::Definition(format!("flow '{}' has no states", flow_id)));
        };
        let start_state_id = self.start_state.clone().unwrap_or_else(|| first.id.clone());

        let mut static_targets: Vec<(String, String)> = Vec::new();
        for state in &self.states {
            for t in &state.transitions {
                if let Some(target) = t.static_target() {
                    static_targets.push((state.id.clone(), target.to_string()));
                }
            }
        }
        for t in &self.global_transitions {
            if let Some(target) = t.static_target() {
                static_targets.push(("<global>".to_string(), target.to_string()));
            }
        }

        let parser = self.parser.as_ref();
        let mut states: IndexMap<String, Arc<State>> = IndexMap::new();
        for builder in self.states {
            if builder.id.trim().is_empty() {
                return Err(ConvoflowError::Definition(format!("flow '{}' declares a state with a blank id", flow_id)));
            }
            if states.contains_key(&builder.id) {
                return Err(ConvoflowError::Definition(format!("flow '{}' declares state '{}' more than once", flow_id, builder.id)));
            }
            let state = builder.build(&flow_id, parser)?;
            states.insert(state.id.clone(), Arc::new(state));
        }

        if !states.contains_key(&start_state_id) {
            return Err(ConvoflowError::Definition(format!("start state '{}' of flow '{}' does not exist", start_state_id, flow_id)));
        }
        for (source, target) in static_targets {
            if !states.contains_key(&target) {
                return Err(ConvoflowError::Definition(format!(
                    "transition from '{}' in flow '{}' targets unknown state '{}'",
                    source, flow_id, target
                )));
            }
        }

        let global_transitions = self.global_transitions.into_iter().map(|t| t.build(parser)).collect::<Result<Vec<_>>>()?;

        Ok(Flow {
            id: flow_id,
            states,
            start_state_id,
            global_transitions,
            variables: self.variables,
            input: self.input,
            start_actions: self.start_actions,
            end_actions: self.end_actions,
            attributes: self.attributes,
        })
    }
}
