//! Classification prompts.

use serde::{Deserialize, Serialize};

use super::parse::ParseError;
use crate::domain::CandidateRecord;

/// What the filter is looking for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criteria {
    /// Short label, echoed in result documents.
    pub name: String,
    pub target_domains: Vec<String>,
    pub survey_types: Vec<String>,
}

impl Default for Criteria {
    fn default() -> Self {
        Self::graph_ai_surveys()
    }
}

impl Criteria {
    /// Surveys in Graph + AI: GNNs, knowledge graphs, GraphRAG and neighbours.
    pub fn graph_ai_surveys() -> Self {
        Self {
            name: "graph-ai-surveys".to_string(),
            target_domains: [
                "Graph Neural Networks (GNNs)",
                "Knowledge Graphs and AI",
                "Graph Foundation Models",
                "GraphRAG (Retrieval-Augmented Generation with Graphs)",
                "Graph Machine Learning",
                "AI applications on graph structures",
                "Graph-based reasoning and inference",
                "Multi-modal graph learning",
                "Graph transformers and attention mechanisms",
                "Large Language Models on graphs",
            ]
            .map(String::from)
            .to_vec(),
            survey_types: [
                "Survey papers",
                "Review papers",
                "Comprehensive studies",
                "Tutorial papers",
                "Overview papers",
                "Progress reports",
                "State-of-the-art reviews",
            ]
            .map(String::from)
            .to_vec(),
        }
    }
}

const REPLY_SCHEMA: &str = r#"{
  "relevance_score": <integer 1-10>,
  "survey_score": <integer 1-10>,
  "quality_score": <integer 1-10>,
  "is_survey": <true or false>,
  "reasoning": "<short justification, focused on whether this is a survey>",
  "survey_indicators": ["<indicator>", "..."],
  "key_topics": ["<topic>", "..."]
}"#;

/// Builds the first-attempt prompt and the stricter corrective prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptBuilder {
    criteria: Criteria,
}

impl PromptBuilder {
    pub fn new(criteria: Criteria) -> Self {
        Self { criteria }
    }

    pub fn criteria(&self) -> &Criteria {
        &self.criteria
    }

    pub fn evaluation_prompt(&self, candidate: &CandidateRecord) -> String {
        let domains = bullet_list(&self.criteria.target_domains);
        let survey_types = bullet_list(&self.criteria.survey_types);
        let categories = if candidate.categories.is_empty() {
            "N/A".to_string()
        } else {
            candidate.categories.join(", ")
        };

        format!(
            "You are an expert reviewer screening research papers. You are ONLY interested in \
survey or review papers within the following domains:
{domains}

A paper counts as a survey if it is one of:
{survey_types}
Typical signals: the title says Survey, Review, Tutorial, Overview, Advances; the abstract \
describes a systematic review, taxonomy, comparison of many methods, or the state of a field. \
Method papers, application papers and experimental papers are NOT surveys.

Paper:
Title: {title}
Abstract: {abstract_text}
Categories: {categories}

Score the paper:
1. relevance_score (1-10): 9-10 core-domain survey, 7-8 adjacent survey touching the domain, \
5-6 marginal, 1-4 unrelated or not a survey.
2. survey_score (1-10): 9-10 unmistakably a survey, 7-8 clearly survey-like, 5-6 partly, \
3-4 mostly a method paper, 1-2 original research only.
3. quality_score (1-10): 9-10 comprehensive reference work, 7-8 broad and solid, 5-6 average, \
3-4 limited, 1-2 not a survey or very weak.
Also decide is_survey explicitly. When in doubt, prefer a miss over a false positive.

Reply with a single JSON object and nothing else:
{REPLY_SCHEMA}",
            title = candidate.title,
            abstract_text = candidate.abstract_text,
        )
    }

    /// Second and final attempt after an unusable reply.
    pub fn corrective_prompt(&self, candidate: &CandidateRecord, error: &ParseError) -> String {
        format!(
            "{base}

IMPORTANT: your previous reply could not be used ({error}). Reply with exactly ONE JSON \
object, no prose and no code fences. Every key below is required; scores are integers from \
1 to 10 and is_survey must be true or false, never null:
{REPLY_SCHEMA}",
            base = self.evaluation_prompt(candidate),
        )
    }
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}
