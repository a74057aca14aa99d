use serde::{Deserialize, Serialize};

/// Lifetime tier of an attribute map.
///
/// - `Request`: one request, never persisted.
/// - `Flash`: survives until the start of the next resume.
/// - `View`: one activation of a view state.
/// - `Flow`: one flow session.
/// - `Conversation`: the whole conversation, shared by every snapshot of it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, strum::AsRefStr, strum::EnumString, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScopeType {
    Request,
    Flash,
    View,
    Flow,
    Conversation,
}

impl ScopeType {
    /// Order in which implicit variable references are resolved.
    pub const SEARCH_ORDER: [ScopeType; 5] = [ScopeType::Request, ScopeType::Flash, ScopeType::View, ScopeType::Flow, ScopeType::Conversation];

    /// Name of the scope when used as the root of an expression path.
    pub fn expression_root(&self) -> &'static str {
        match self {
            ScopeType::Request => "requestScope",
            ScopeType::Flash => "flashScope",
            ScopeType::View => "viewScope",
            ScopeType::Flow => "flowScope",
            ScopeType::Conversation => "conversationScope",
        }
    }

    pub fn from_expression_root(root: &str) -> Option<ScopeType> {
        Self::SEARCH_ORDER.into_iter().find(|s| s.expression_root() == root)
    }
}
