//! Turns one candidate into one evaluation outcome.
//!
//! # Modules
//!
//! - [`prompt`]: classification criteria and prompt text
//! - [`parse`]: strict reply parsing into an `Assessment`
//! - [`classifier`]: the `Evaluator`: gate, call, parse, retry

pub mod classifier;
pub mod parse;
pub mod prompt;

pub use classifier::{EvaluateError, Evaluation, Evaluator};
pub use parse::{parse_assessment, ParseError};
pub use prompt::{Criteria, PromptBuilder};
