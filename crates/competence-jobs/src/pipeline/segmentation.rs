//! Segmentation stage of resource embedding.
//!
//! Long descriptions are split into independent parts before embedding so
//! that a competence matches on each of its claims separately.

use tokio::task::JoinSet;
use tracing::{debug, warn};

use competence_core::{EmbeddingTask, EmbeddingType};
use competence_inference::Segmenter;

use crate::config::MatcherConfig;
use crate::handler::Reporter;

fn needs_split(task: &EmbeddingTask, config: &MatcherConfig) -> bool {
    task.embedding_type == EmbeddingType::Description
        && task.text.chars().count() > config.segment_min_chars
}

/// Replace every long description by its segments, keeping input order.
///
/// Descriptions are split concurrently within a batch. A failed or empty
/// split keeps the original text.
pub async fn segment_tasks(
    segmenter: &Segmenter,
    tasks: Vec<EmbeddingTask>,
    config: &MatcherConfig,
    reporter: &Reporter,
) -> Vec<EmbeddingTask> {
    let pending: Vec<usize> = tasks
        .iter()
        .enumerate()
        .filter(|(_, task)| needs_split(task, config))
        .map(|(i, _)| i)
        .collect();
    if pending.is_empty() {
        return tasks;
    }

    let mut splits: Vec<Option<Vec<String>>> = vec![None; tasks.len()];
    for batch in pending.chunks(config.segment_batch_size.max(1)) {
        let mut set = JoinSet::new();
        for &index in batch {
            let segmenter = segmenter.clone();
            let text = tasks[index].text.clone();
            set.spawn(async move { (index, segmenter.split(&text).await) });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(parts))) => {
                    debug!(
                        competence_id = %tasks[index].competence_id,
                        result_count = parts.len(),
                        "Description segmented"
                    );
                    splits[index] = Some(parts);
                }
                Ok((index, Err(e))) => {
                    warn!(
                        competence_id = %tasks[index].competence_id,
                        error = %e,
                        "Segmentation failed, embedding whole description"
                    );
                    reporter.error(format!(
                        "segmentation of {} failed: {}",
                        tasks[index].competence_id, e
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Segmentation task aborted, batch continues");
                }
            }
        }
    }

    tasks
        .into_iter()
        .zip(splits)
        .flat_map(|(task, split)| match split {
            Some(parts) => parts
                .into_iter()
                .map(|text| EmbeddingTask {
                    text,
                    ..task.clone()
                })
                .collect(),
            None => vec![task],
        })
        .collect()
}
