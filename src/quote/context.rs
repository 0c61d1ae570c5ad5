//! Grounding document handed to the generation engine.

use std::fmt::Write as _;

use serde::Serialize;
use serde_json::Value;

use super::schema::estimate_schema;
use crate::retrieval::RankedExample;
use crate::store::{CostBreakdown, DrawingAnalysis};

pub const NO_EXAMPLES_NOTE: &str =
    "No reference examples exist yet; the estimate will be generic and should say so.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextExample {
    /// 1 = most similar, most influence.
    pub rank: usize,
    pub example_id: String,
    pub similarity: f32,
    pub title: Option<String>,
    pub machine_type: Option<String>,
    pub material: Option<String>,
    pub description: String,
    pub cost_breakdown: CostBreakdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextDocument {
    pub drawing_ref: String,
    pub drawing_description: String,
    pub user_context: Option<String>,
    pub examples: Vec<ContextExample>,
    pub note: Option<String>,
    pub currency: String,
    pub output_schema: Value,
}

impl ContextDocument {
    /// `ranked` must already be ordered most similar first.
    pub fn build(
        drawing_ref: &str,
        analysis: &DrawingAnalysis,
        user_context: Option<&str>,
        ranked: &[RankedExample],
        currency: &str,
    ) -> Self {
        let examples: Vec<ContextExample> = ranked
            .iter()
            .enumerate()
            .map(|(i, r)| ContextExample {
                rank: i + 1,
                example_id: r.example.id.clone(),
                similarity: r.similarity,
                title: r.example.labels.title.clone(),
                machine_type: r.example.labels.machine_type.clone(),
                material: r.example.labels.material.clone(),
                description: r.example.description_text.clone(),
                cost_breakdown: r.example.cost_breakdown.clone(),
            })
            .collect();

        let note = examples.is_empty().then(|| NO_EXAMPLES_NOTE.to_string());

        Self {
            drawing_ref: drawing_ref.to_string(),
            drawing_description: analysis.description.clone(),
            user_context: user_context
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
            examples,
            note,
            currency: currency.to_string(),
            output_schema: estimate_schema(),
        }
    }

    pub fn has_examples(&self) -> bool {
        !self.examples.is_empty()
    }

    /// Plain-text rendering for engines that take a single prompt.
    pub fn render_prompt(&self) -> String {
        let mut out = String::new();
        out.push_str(
            "You are an expert in industrial manufacturing costs. \
             Estimate the cost of producing the part described below.\n\n",
        );

        let _ = writeln!(out, "## DRAWING ({})", self.drawing_ref);
        let _ = writeln!(out, "{}\n", self.drawing_description.trim());

        if let Some(ctx) = &self.user_context {
            let _ = writeln!(out, "## CUSTOMER CONTEXT\n{ctx}\n");
        }

        if self.examples.is_empty() {
            if let Some(note) = &self.note {
                let _ = writeln!(out, "## NOTE\n{note}\n");
            }
        } else {
            out.push_str("## REFERENCE EXAMPLES (past jobs with verified costs, most similar first)\n");
            for ex in &self.examples {
                let _ = writeln!(
                    out,
                    "\n--- Example {} (similarity {:.1}%) [{}] ---",
                    ex.rank,
                    ex.similarity * 100.0,
                    ex.example_id
                );
                if let Some(title) = &ex.title {
                    let _ = writeln!(out, "Title: {title}");
                }
                if let Some(machine) = &ex.machine_type {
                    let _ = writeln!(out, "Machine: {machine}");
                }
                if let Some(material) = &ex.material {
                    let _ = writeln!(out, "Material: {material}");
                }
                let _ = writeln!(out, "Description: {}", ex.description.trim());
                for item in &ex.cost_breakdown.line_items {
                    match item.hours {
                        Some(h) => {
                            let _ = writeln!(
                                out,
                                "- {}: {:.2} {} ({h} h)",
                                item.description, item.amount, ex.cost_breakdown.currency
                            );
                        }
                        None => {
                            let _ = writeln!(
                                out,
                                "- {}: {:.2} {}",
                                item.description, item.amount, ex.cost_breakdown.currency
                            );
                        }
                    }
                }
                let _ = writeln!(
                    out,
                    "Actual total: {:.2} {}",
                    ex.cost_breakdown.total, ex.cost_breakdown.currency
                );
            }
            out.push_str(
                "\nUse the reference costs as the primary basis and adjust for \
                 differences in complexity, material and size.\n\n",
            );
        }

        let _ = writeln!(out, "Express all amounts in {}.", self.currency);
        out.push_str(
            "Answer with a single JSON object, no prose, matching this JSON schema:\n",
        );
        out.push_str(&self.output_schema.to_string());
        out.push('\n');
        out
    }
}
