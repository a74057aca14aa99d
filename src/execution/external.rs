use serde_json::Value;

use crate::AttributeMap;

/// Request parameter carrying the id of the event to signal.
pub const EVENT_ID_PARAMETER: &str = "_eventId";

/// The calling environment, normalized to what the engine needs.
pub trait ExternalContext {
    fn request_parameters(&self) -> &AttributeMap;

    /// Event id of this request: the `_eventId` parameter, or the suffix of a
    /// parameter named `_eventId_<id>`.
    fn event_id(&self) -> Option<String> {
        let parameters = self.request_parameters();
        if let Ok(Some(id)) = parameters.get_string(EVENT_ID_PARAMETER) {
            if !id.trim().is_empty() {
                return Some(id);
            }
        }
        let prefix = format!("{}_", EVENT_ID_PARAMETER);
        parameters.keys().find_map(|k| k.strip_prefix(prefix.as_str()).filter(|id| !id.is_empty()).map(str::to_string))
    }

    fn request_map(&self) -> &AttributeMap;

    fn request_map_mut(&mut self) -> &mut AttributeMap;

    fn session_map(&self) -> &AttributeMap;

    fn session_map_mut(&mut self) -> &mut AttributeMap;

    /// Asks the caller to redirect to the paused execution before rendering.
    fn request_flow_execution_redirect(&mut self);

    /// Asks the caller to redirect to a new execution of `flow_id`.
    fn request_flow_definition_redirect(
        &mut self,
        flow_id: &str,
        input: AttributeMap,
    );

    /// Records that the response has been produced by application code.
    fn record_response_complete(&mut self);

    fn is_response_complete(&self) -> bool;

    fn flow_execution_redirect_requested(&self) -> bool;
}

/// In-memory [`ExternalContext`] for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct LocalExternalContext {
    parameters: AttributeMap,
    request_map: AttributeMap,
    session_map: AttributeMap,
    execution_redirect: bool,
    definition_redirect: Option<(String, AttributeMap)>,
    response_complete: bool,
}

impl LocalExternalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context whose request signals `event_id`.
    pub fn with_event(event_id: &str) -> Self {
        Self::new().parameter(EVENT_ID_PARAMETER, event_id)
    }

    pub fn parameter(
        mut self,
        name: &str,
        value: impl Into<Value>,
    ) -> Self {
        self.parameters = self.parameters.with(name, value);
        self
    }

    /// Keeps the session map and starts a new request.
    pub fn next_request(&self) -> Self {
        Self {
            session_map: self.session_map.clone(),
            ..Self::default()
        }
    }

    pub fn flow_definition_redirect(&self) -> Option<&(String, AttributeMap)> {
        self.definition_redirect.as_ref()
    }
}

impl ExternalContext for LocalExternalContext {
    fn request_parameters(&self) -> &AttributeMap {
        &self.parameters
    }

    fn request_map(&self) -> &AttributeMap {
        &self.request_map
    }

    fn request_map_mut(&mut self) -> &mut AttributeMap {
        &mut self.request_map
    }

    fn session_map(&self) -> &AttributeMap {
        &self.session_map
    }

    fn session_map_mut(&mut self) -> &mut AttributeMap {
        &mut self.session_map
    }

    fn request_flow_execution_redirect(&mut self) {
        self.execution_redirect = true;
    }

    fn request_flow_definition_redirect(
        &mut self,
        flow_id: &str,
        input: AttributeMap,
    ) {
        self.definition_redirect = Some((flow_id.to_string(), input));
    }

    fn record_response_complete(&mut self) {
        self.response_complete = true;
    }

    fn is_response_complete(&self) -> bool {
        self.response_complete
    }

    fn flow_execution_redirect_requested(&self) -> bool {
        self.execution_redirect
    }
}
