//! The closed capability vocabulary.
//!
//! Workers advertise capability tags drawn from this vocabulary and the
//! planner tags every subtask with exactly one of them.

/// Free-form text production.
pub const TEXT_GENERATION: &str = "text-generation";

/// Arithmetic and symbolic reasoning.
pub const MATH_REASONING: &str = "math-reasoning";

/// Grammar and style polishing of existing text.
pub const GRAMMAR_POLISH: &str = "grammar-polish";

/// Analysis and summarisation of existing material.
pub const ANALYSIS_SUMMARY: &str = "analysis-summary";

/// The full vocabulary, in the order presented to the planner.
pub const DEFAULT_VOCABULARY: [&str; 4] = [
    TEXT_GENERATION,
    MATH_REASONING,
    GRAMMAR_POLISH,
    ANALYSIS_SUMMARY,
];

/// Capability used for the single-stage fallback pipeline when planning
/// fails.
pub const FALLBACK_CAPABILITY: &str = TEXT_GENERATION;
