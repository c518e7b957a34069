//! Grouping and ranking of persisted match results.
//!
//! Results are nested resource → task → competence → matched parts. Each
//! level carries aggregate probabilities and is sorted by the key selected
//! with [`RankBy`].

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{Alignment, EmbeddingType, MatchResult};

/// Aggregate used to order competences, tasks, and resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RankBy {
    /// Average over every matched part.
    #[default]
    AvgFit,
    /// Average over aligning parts only.
    BestFit,
}

impl std::str::FromStr for RankBy {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "avgFit" => Ok(Self::AvgFit),
            "bestFit" => Ok(Self::BestFit),
            _ => Err(Error::Validation(format!("Invalid rank key: {}", s))),
        }
    }
}

/// Task id and text, in first-seen order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOverview {
    pub task_id: String,
    pub task_text: String,
}

/// One competence part matched to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartMatch {
    pub text: String,
    #[serde(rename = "type")]
    pub embedding_type: EmbeddingType,
    pub match_probability: f64,
    pub alignment: Alignment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetenceMatching {
    pub competence_id: String,
    pub matchings: Vec<PartMatch>,
    pub avg_match_probability: f64,
    /// Mean of aligning parts; 0 when none align.
    pub avg_best_fit_match_probability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMatching {
    pub task_id: String,
    pub competence_matchings: Vec<CompetenceMatching>,
    pub max_match_probability: f64,
    pub max_best_fit_match_probability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRanking {
    pub resource_id: String,
    pub task_matchings: Vec<TaskMatching>,
    pub avg_task_match_probability: f64,
    pub avg_best_fit_task_match_probability: f64,
    /// Any part of any competence contradicts a task.
    pub contradicting: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupedMatchResults {
    pub tasks: Vec<TaskOverview>,
    pub resource_ranking: Vec<ResourceRanking>,
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

fn max_of(values: impl Iterator<Item = f64>) -> f64 {
    values.fold(0.0, f64::max)
}

/// Group flat match rows and rank them by `rank_by`.
pub fn rank_results(results: &[MatchResult], rank_by: RankBy) -> GroupedMatchResults {
    let mut tasks: Vec<TaskOverview> = Vec::new();
    let mut resources: Vec<(String, Vec<(String, Vec<(String, Vec<PartMatch>)>)>)> = Vec::new();

    for r in results {
        if !tasks.iter().any(|t| t.task_id == r.task_id) {
            tasks.push(TaskOverview {
                task_id: r.task_id.clone(),
                task_text: r.task_text.clone(),
            });
        }

        let ri = match resources.iter().position(|(id, _)| *id == r.resource_id) {
            Some(i) => i,
            None => {
                resources.push((r.resource_id.clone(), Vec::new()));
                resources.len() - 1
            }
        };
        let task_groups = &mut resources[ri].1;
        let ti = match task_groups.iter().position(|(id, _)| *id == r.task_id) {
            Some(i) => i,
            None => {
                task_groups.push((r.task_id.clone(), Vec::new()));
                task_groups.len() - 1
            }
        };
        let competence_groups = &mut task_groups[ti].1;
        let ci = match competence_groups
            .iter()
            .position(|(id, _)| *id == r.competence_id)
        {
            Some(i) => i,
            None => {
                competence_groups.push((r.competence_id.clone(), Vec::new()));
                competence_groups.len() - 1
            }
        };
        competence_groups[ci].1.push(PartMatch {
            text: r.text.clone(),
            embedding_type: r.embedding_type,
            match_probability: r.distance,
            alignment: r.alignment,
            reason: r.reason.clone(),
        });
    }

    let mut resource_ranking: Vec<ResourceRanking> = resources
        .into_iter()
        .map(|(resource_id, task_groups)| rank_resource(resource_id, task_groups, rank_by))
        .collect();

    resource_ranking.sort_by(|a, b| {
        a.contradicting.cmp(&b.contradicting).then_with(|| {
            let (ka, kb) = match rank_by {
                RankBy::AvgFit => (a.avg_task_match_probability, b.avg_task_match_probability),
                RankBy::BestFit => (
                    a.avg_best_fit_task_match_probability,
                    b.avg_best_fit_task_match_probability,
                ),
            };
            kb.total_cmp(&ka)
        })
    });

    GroupedMatchResults {
        tasks,
        resource_ranking,
    }
}

fn rank_resource(
    resource_id: String,
    task_groups: Vec<(String, Vec<(String, Vec<PartMatch>)>)>,
    rank_by: RankBy,
) -> ResourceRanking {
    let mut task_matchings: Vec<TaskMatching> = task_groups
        .into_iter()
        .map(|(task_id, competence_groups)| {
            let mut competence_matchings: Vec<CompetenceMatching> = competence_groups
                .into_iter()
                .map(|(competence_id, mut matchings)| {
                    let avg = mean(matchings.iter().map(|m| m.match_probability));
                    let best_fit = mean(
                        matchings
                            .iter()
                            .filter(|m| m.alignment == Alignment::Aligning)
                            .map(|m| m.match_probability),
                    );
                    matchings.sort_by(|a, b| b.match_probability.total_cmp(&a.match_probability));
                    CompetenceMatching {
                        competence_id,
                        matchings,
                        avg_match_probability: avg,
                        avg_best_fit_match_probability: best_fit,
                    }
                })
                .collect();

            competence_matchings.sort_by(|a, b| match rank_by {
                RankBy::AvgFit => b.avg_match_probability.total_cmp(&a.avg_match_probability),
                RankBy::BestFit => b
                    .avg_best_fit_match_probability
                    .total_cmp(&a.avg_best_fit_match_probability),
            });

            TaskMatching {
                task_id,
                max_match_probability: max_of(
                    competence_matchings.iter().map(|c| c.avg_match_probability),
                ),
                max_best_fit_match_probability: max_of(
                    competence_matchings
                        .iter()
                        .map(|c| c.avg_best_fit_match_probability),
                ),
                competence_matchings,
            }
        })
        .collect();

    let avg_task = mean(task_matchings.iter().map(|t| t.max_match_probability));
    let avg_best_fit_task = mean(task_matchings.iter().map(|t| t.max_best_fit_match_probability));
    let contradicting = task_matchings.iter().any(|t| {
        t.competence_matchings.iter().any(|c| {
            c.matchings
                .iter()
                .any(|m| m.alignment == Alignment::Contradicting)
        })
    });

    task_matchings.sort_by(|a, b| match rank_by {
        RankBy::AvgFit => b.max_match_probability.total_cmp(&a.max_match_probability),
        RankBy::BestFit => b
            .max_best_fit_match_probability
            .total_cmp(&a.max_best_fit_match_probability),
    });

    ResourceRanking {
        resource_id,
        task_matchings,
        avg_task_match_probability: avg_task,
        avg_best_fit_task_match_probability: avg_best_fit_task,
        contradicting,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn row(
        resource: &str,
        task: &str,
        competence: &str,
        distance: f64,
        alignment: Alignment,
    ) -> MatchResult {
        MatchResult {
            job_id: Uuid::nil(),
            task_id: task.into(),
            task_text: format!("text of {}", task),
            list_id: Uuid::nil(),
            competence_id: competence.into(),
            resource_id: resource.into(),
            distance,
            text: format!("{} part", competence),
            embedding_type: EmbeddingType::Description,
            alignment,
            reason: None,
        }
    }

    #[test]
    fn test_rank_empty() {
        let grouped = rank_results(&[], RankBy::AvgFit);
        assert!(grouped.tasks.is_empty());
        assert!(grouped.resource_ranking.is_empty());
    }

    #[test]
    fn test_rank_competence_averages() {
        let rows = vec![
            row("r1", "t1", "c1", 0.8, Alignment::Aligning),
            row("r1", "t1", "c1", 0.4, Alignment::Neutral),
        ];
        let grouped = rank_results(&rows, RankBy::AvgFit);
        let c = &grouped.resource_ranking[0].task_matchings[0].competence_matchings[0];
        assert!((c.avg_match_probability - 0.6).abs() < 1e-12);
        assert!((c.avg_best_fit_match_probability - 0.8).abs() < 1e-12);
        assert_eq!(c.matchings[0].match_probability, 0.8);
    }

    #[test]
    fn test_rank_best_fit_zero_without_aligning() {
        let rows = vec![row("r1", "t1", "c1", 0.9, Alignment::Neutral)];
        let grouped = rank_results(&rows, RankBy::BestFit);
        let r = &grouped.resource_ranking[0];
        assert_eq!(r.avg_best_fit_task_match_probability, 0.0);
        assert_eq!(r.task_matchings[0].max_best_fit_match_probability, 0.0);
    }

    #[test]
    fn test_rank_task_max_and_resource_mean() {
        let rows = vec![
            row("r1", "t1", "c1", 0.2, Alignment::Neutral),
            row("r1", "t1", "c2", 0.6, Alignment::Neutral),
            row("r1", "t2", "c1", 0.4, Alignment::Neutral),
        ];
        let grouped = rank_results(&rows, RankBy::AvgFit);
        let r = &grouped.resource_ranking[0];
        assert_eq!(r.task_matchings[0].task_id, "t1");
        assert_eq!(r.task_matchings[0].max_match_probability, 0.6);
        assert_eq!(r.task_matchings[0].competence_matchings[0].competence_id, "c2");
        assert!((r.avg_task_match_probability - 0.5).abs() < 1e-12);
        assert_eq!(grouped.tasks.len(), 2);
    }

    #[test]
    fn test_rank_contradicting_resources_last() {
        let rows = vec![
            row("strong", "t1", "c1", 0.9, Alignment::Aligning),
            row("strong", "t1", "c2", 0.0, Alignment::Contradicting),
            row("weak", "t1", "c3", 0.3, Alignment::Neutral),
        ];
        let grouped = rank_results(&rows, RankBy::AvgFit);
        assert_eq!(grouped.resource_ranking[0].resource_id, "weak");
        assert!(grouped.resource_ranking[1].contradicting);
    }

    #[test]
    fn test_rank_by_changes_order() {
        let rows = vec![
            row("a", "t1", "c1", 0.9, Alignment::Neutral),
            row("b", "t1", "c2", 0.6, Alignment::Aligning),
        ];
        let avg = rank_results(&rows, RankBy::AvgFit);
        assert_eq!(avg.resource_ranking[0].resource_id, "a");
        let best = rank_results(&rows, RankBy::BestFit);
        assert_eq!(best.resource_ranking[0].resource_id, "b");
    }

    #[test]
    fn test_rank_by_parse() {
        use std::str::FromStr;
        assert_eq!(RankBy::from_str("bestFit").unwrap(), RankBy::BestFit);
        assert!(RankBy::from_str("worstFit").is_err());
    }
}
