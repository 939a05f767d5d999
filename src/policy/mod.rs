//! The adaptive decision policy: evaluation, exploration, feedback
//! validation, rule synthesis, monitoring and the learning loop.

pub mod engine;
pub mod evaluator;
pub mod exploration;
pub mod monitor;
pub mod rule;
pub mod scheduler;
pub mod synthesizer;
pub mod types;
pub mod validator;
pub mod weights;

pub use engine::DecisionEngine;
pub use exploration::{RandomSource, ScriptedRandom, SeededRandom};
pub use rule::{Clause, Predicate, Rule, RuleStatus};
pub use scheduler::{LearningCycle, LearningScheduler, spawn_learning_loop};
pub use types::{
    Action, Decision, DecisionContext, Evaluation, Feedback, Hypothesis, HypothesisStatus,
    Prediction, WeightVector,
};
