use std::path::{Path, PathBuf};

use candle_core::D;
use cifar_model::Model;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    config::{MilestoneAction, MilestoneConfig},
    data::DataLoader,
    error::Result,
    metrics::TrainingState,
    TrainingError,
};

mod plot;

pub use plot::plot_trends;

/// One exported test-set row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(rename = "ID")]
    pub id: usize,
    #[serde(rename = "Labels")]
    pub label: u32,
}

/// Union of the actions configured for `epoch`, in declaration order.
pub fn milestone_actions(milestones: &[MilestoneConfig], epoch: usize) -> Vec<MilestoneAction> {
    let mut actions = Vec::new();
    for milestone in milestones.iter().filter(|m| m.epoch == epoch) {
        for action in &milestone.actions {
            if !actions.contains(action) {
                actions.push(*action);
            }
        }
    }
    actions
}

/// Argmax class for every row of `loader`, in loader order. Leaves the model in eval mode.
pub fn generate_predictions(model: &Model, loader: &DataLoader) -> Result<Vec<Prediction>> {
    model.set_training(false);
    let mut predictions = Vec::with_capacity(loader.len());
    for batch in loader.batches(0) {
        let batch = batch?;
        let labels = model
            .forward(&batch.images)?
            .argmax(D::Minus1)?
            .to_vec1::<u32>()?;
        predictions.extend(
            batch
                .indices
                .iter()
                .zip(labels)
                .map(|(&id, label)| Prediction { id, label }),
        );
    }
    Ok(predictions)
}

/// Writes `ID,Labels` rows.
pub fn write_predictions_csv(path: &Path, predictions: &[Prediction]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
    for prediction in predictions {
        writer.serialize(prediction).map_err(csv_error)?;
    }
    writer.flush()?;
    info!(path = %path.display(), rows = predictions.len(), "predictions saved");
    Ok(())
}

pub fn milestone_predictions_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("predictions{epoch}.csv"))
}

pub fn good_predictions_path(dir: &Path, ordinal: usize) -> PathBuf {
    dir.join(format!("predictionsGood{ordinal}.csv"))
}

/// File-name-safe rendering of the hyperparameter tags.
pub fn tag_slug(tags: &[String]) -> String {
    let joined = tags.join("_");
    let slug: String = joined
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if slug.is_empty() {
        "run".to_string()
    } else {
        slug
    }
}

pub fn log_summary(state: &TrainingState) {
    let trends = &state.trends;
    info!(
        epoch = state.epoch,
        best_acc = format_args!("{:.3}%", state.best_acc),
        train_loss = ?trends.train_loss,
        train_acc = ?trends.train_acc,
        valid_loss = ?trends.valid_loss,
        valid_acc = ?trends.valid_acc,
        lr_steps = trends.learning_rate.len(),
        last_lr = ?trends.learning_rate.last(),
        "metric trends"
    );
}

fn csv_error(err: csv::Error) -> TrainingError {
    TrainingError::runtime(format!("failed to write predictions: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MilestoneAction::{Plot, Predict, Summary};

    #[test]
    fn actions_merge_matching_entries() {
        let milestones = vec![
            MilestoneConfig {
                epoch: 5,
                actions: vec![Plot],
            },
            MilestoneConfig {
                epoch: 6,
                actions: vec![Predict],
            },
            MilestoneConfig {
                epoch: 5,
                actions: vec![Summary, Plot],
            },
        ];
        assert_eq!(milestone_actions(&milestones, 5), vec![Plot, Summary]);
        assert_eq!(milestone_actions(&milestones, 6), vec![Predict]);
        assert!(milestone_actions(&milestones, 7).is_empty());
    }

    #[test]
    fn csv_has_header_and_one_row_per_prediction() {
        let dir = tempfile::tempdir().unwrap();
        let path = milestone_predictions_path(dir.path(), 10);
        let predictions: Vec<Prediction> = (0..4)
            .map(|id| Prediction {
                id,
                label: (id * 3 % 10) as u32,
            })
            .collect();
        write_predictions_csv(&path, &predictions).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "ID,Labels");
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[2], "1,3");
    }

    #[test]
    fn slug_is_file_name_safe() {
        let tags = vec!["ResNet5M".to_string(), "SGD WD 0.0005".to_string()];
        assert_eq!(tag_slug(&tags), "ResNet5M_SGD_WD_0.0005");
        assert_eq!(tag_slug(&[]), "run");
    }
}
