//! The turn graph: named stages and the edges between them.
//!
//! ```text
//! InputProcessor → IntentClassifier → ContextEnricher → PolicyEngine
//!   → EligibilityChecker → EscalationDetector ─┬─ escalate → SpecialCaseHandler
//!                                              └─ ContextBuilder → LanguageModelCall
//!   → ResponseValidator → ResponseProcessor ─┬─ terminal phase → DataSinkWriter → END
//!                                            ├─ special case   → SpecialCaseHandler
//!                                            └─ StateUpdater → END
//!
//! SpecialCaseHandler ─┬─ call ended → DataSinkWriter → END
//!                     └─ END
//! ```

use crate::pipeline::types::TurnContext;

/// Upper bound on stages visited in one turn. The longest path has 12.
pub const MAX_STEPS: usize = 32;

/// A stage of the turn pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    InputProcessor,
    IntentClassifier,
    ContextEnricher,
    PolicyEngine,
    EligibilityChecker,
    EscalationDetector,
    SpecialCaseHandler,
    ContextBuilder,
    LanguageModelCall,
    ResponseValidator,
    ResponseProcessor,
    DataSinkWriter,
    StateUpdater,
}

impl Node {
    pub const START: Node = Node::InputProcessor;

    pub fn name(&self) -> &'static str {
        match self {
            Self::InputProcessor => "input_processor",
            Self::IntentClassifier => "intent_classifier",
            Self::ContextEnricher => "context_enricher",
            Self::PolicyEngine => "policy_engine",
            Self::EligibilityChecker => "eligibility_checker",
            Self::EscalationDetector => "escalation_detector",
            Self::SpecialCaseHandler => "special_case_handler",
            Self::ContextBuilder => "context_builder",
            Self::LanguageModelCall => "language_model_call",
            Self::ResponseValidator => "response_validator",
            Self::ResponseProcessor => "response_processor",
            Self::DataSinkWriter => "data_sink_writer",
            Self::StateUpdater => "state_updater",
        }
    }

    /// Outgoing edge of this node.
    pub fn edge(&self) -> Edge {
        use Node::*;
        match self {
            InputProcessor => Edge::To(IntentClassifier),
            IntentClassifier => Edge::To(ContextEnricher),
            ContextEnricher => Edge::To(PolicyEngine),
            PolicyEngine => Edge::To(EligibilityChecker),
            EligibilityChecker => Edge::To(EscalationDetector),
            EscalationDetector => Edge::Branch(after_escalation_check),
            ContextBuilder => Edge::To(LanguageModelCall),
            LanguageModelCall => Edge::To(ResponseValidator),
            ResponseValidator => Edge::To(ResponseProcessor),
            ResponseProcessor => Edge::Branch(after_response),
            SpecialCaseHandler => Edge::Maybe(after_special_case),
            DataSinkWriter | StateUpdater => Edge::End,
        }
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Where control goes after a node.
#[derive(Clone, Copy)]
pub enum Edge {
    To(Node),
    Branch(fn(&TurnContext) -> Node),
    /// Like `Branch`, but the route may end the run.
    Maybe(fn(&TurnContext) -> Option<Node>),
    End,
}

impl Edge {
    /// Resolve against the current context. `None` ends the run.
    pub fn next(&self, ctx: &TurnContext) -> Option<Node> {
        match self {
            Self::To(node) => Some(*node),
            Self::Branch(route) => Some(route(ctx)),
            Self::Maybe(route) => route(ctx),
            Self::End => None,
        }
    }
}

fn after_escalation_check(ctx: &TurnContext) -> Node {
    if ctx.escalation.escalate {
        Node::SpecialCaseHandler
    } else {
        Node::ContextBuilder
    }
}

fn after_response(ctx: &TurnContext) -> Node {
    if ctx.state.current_phase.is_terminal() {
        Node::DataSinkWriter
    } else if ctx.special_case.is_some() {
        Node::SpecialCaseHandler
    } else {
        Node::StateUpdater
    }
}

fn after_special_case(ctx: &TurnContext) -> Option<Node> {
    ctx.state
        .current_phase
        .is_terminal()
        .then_some(Node::DataSinkWriter)
}
