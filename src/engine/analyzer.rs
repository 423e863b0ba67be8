//! Advisory query planner.
//!
//! Orders filter conditions by a rough relative cost, estimates an overall
//! cost and suggests indexes from declared metadata and recorded profiles.
//! Nothing here changes how a query executes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::metadata::MetadataProvider;
use super::query_service::QueryProfile;
use crate::ast::{translate_opt, Operator, QueryAst};
use crate::error::EngineResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CostClass {
    Equality,
    Range,
    Other,
}

impl CostClass {
    pub fn of(operator: Operator) -> Self {
        if operator.is_equality() {
            CostClass::Equality
        } else if operator.is_range() {
            CostClass::Range
        } else {
            CostClass::Other
        }
    }

    fn weight(&self) -> f64 {
        match self {
            CostClass::Equality => 1.0,
            CostClass::Range => 2.0,
            CostClass::Other => 4.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanStep {
    pub field: String,
    pub operator: Operator,
    pub cost: CostClass,
    pub indexed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPlan {
    pub object: String,
    /// Conditions, cheapest first.
    pub steps: Vec<PlanStep>,
    pub estimated_cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_us: Option<u64>,
    pub suggestions: Vec<String>,
}

/// Thresholds for the analyzer's suggestions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerSettings {
    pub slow_query_ms: u64,
    pub wide_scan_rows: u64,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            slow_query_ms: 100,
            wide_scan_rows: 1000,
        }
    }
}

/// Unindexed conditions cost this many times more than indexed ones.
const UNINDEXED_FACTOR: f64 = 5.0;

pub struct QueryAnalyzer {
    metadata: Arc<dyn MetadataProvider>,
    settings: AnalyzerSettings,
}

impl QueryAnalyzer {
    pub fn new(metadata: Arc<dyn MetadataProvider>, settings: AnalyzerSettings) -> Self {
        Self { metadata, settings }
    }

    pub fn analyze(&self, ast: &QueryAst, profiles: &[QueryProfile]) -> EngineResult<QueryPlan> {
        let indexes = self.metadata.indexes(&ast.object);
        let indexed = |field: &str| indexes.iter().any(|i| i.leads_with(field));

        let filters = translate_opt(ast.filter.as_ref())?;
        let mut steps = Vec::new();
        filters.for_each_condition(&mut |c| {
            steps.push(PlanStep {
                field: c.field.clone(),
                operator: c.operator,
                cost: CostClass::of(c.operator),
                indexed: indexed(&c.field),
            })
        });
        steps.sort_by(|a, b| a.cost.cmp(&b.cost).then(b.indexed.cmp(&a.indexed)));

        let estimated_cost = if steps.is_empty() {
            UNINDEXED_FACTOR * CostClass::Other.weight()
        } else {
            steps
                .iter()
                .map(|s| {
                    let factor = if s.indexed { 1.0 } else { UNINDEXED_FACTOR };
                    s.cost.weight() * factor
                })
                .sum()
        };

        let mut suggestions = Vec::new();
        for step in &steps {
            if step.indexed || step.cost == CostClass::Other {
                continue;
            }
            let kind = match step.cost {
                CostClass::Equality => "equality",
                _ => "range",
            };
            push_unique(
                &mut suggestions,
                format!(
                    "Consider an index on {}.{} (used in {kind} filter)",
                    ast.object, step.field
                ),
            );
        }
        for sort in &ast.sort {
            if !indexed(&sort.field) {
                push_unique(
                    &mut suggestions,
                    format!(
                        "Consider an index on {}.{} to support sorting",
                        ast.object, sort.field
                    ),
                );
            }
        }

        let average_us = average_total(profiles);
        if let Some(avg) = average_us {
            let threshold_us = self.settings.slow_query_ms.saturating_mul(1000);
            if avg > threshold_us {
                suggestions.push(format!(
                    "Average execution of {:.1}ms exceeds the {}ms threshold",
                    avg as f64 / 1000.0,
                    self.settings.slow_query_ms
                ));
            }
        }

        if filters.is_empty() {
            let widest = profiles.iter().map(|p| p.matched).max().unwrap_or(0);
            if ast.top.is_none() || widest > self.settings.wide_scan_rows {
                suggestions.push(format!(
                    "Unfiltered query scans all of {}{}",
                    ast.object,
                    if widest > 0 {
                        format!(" ({widest} rows observed)")
                    } else {
                        String::new()
                    }
                ));
            }
        }

        Ok(QueryPlan {
            object: ast.object.clone(),
            steps,
            estimated_cost,
            average_us,
            suggestions,
        })
    }
}

fn average_total(profiles: &[QueryProfile]) -> Option<u64> {
    if profiles.is_empty() {
        return None;
    }
    let sum: u64 = profiles.iter().map(|p| p.total_us).sum();
    Some(sum / profiles.len() as u64)
}

fn push_unique(suggestions: &mut Vec<String>, suggestion: String) {
    if !suggestions.contains(&suggestion) {
        suggestions.push(suggestion);
    }
}
