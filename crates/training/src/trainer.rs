use std::path::{Path, PathBuf};

use candle_core::Device;
use cifar_model::{Model, ModelConfig};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::{
    checkpoint::{
        self, best_checkpoint_path, epoch_checkpoint_path, train_checkpoint_path,
        CheckpointHeader, CheckpointStage, LoadedCheckpoint, SaveRequest,
    },
    config::MilestoneAction,
    data::{train_validation_split, Cifar10, DataLoader, ImageDataset},
    device::{seed_device, select_device},
    error::Result,
    logging::MetricsLogger,
    loss::{CrossEntropyLoss, LossOutput},
    metrics::{EpochAccumulator, EpochStats, TrainingState},
    optimizer::{GradientClipping, SgdConfig, SgdOptimizer},
    report::{self, good_predictions_path, milestone_predictions_path},
    scheduler::{LRScheduler, SchedulerConfig},
    TrainingConfig, TrainingError,
};

/// Owns the model, its optimizer and schedule, the three data splits and the run state.
pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    model: Model,
    optimizer: SgdOptimizer,
    scheduler: Box<dyn LRScheduler>,
    loss: CrossEntropyLoss,
    train_loader: DataLoader,
    valid_loader: DataLoader,
    test_loader: Option<DataLoader>,
    logger: MetricsLogger,
    state: TrainingState,
}

/// Train and validation statistics of one completed epoch.
#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train: EpochStats,
    pub valid: EpochStats,
    pub improved: bool,
    pub learning_rate: f64,
}

impl Trainer {
    /// Loads CIFAR-10 from `config.data`, splits off validation and builds the model.
    pub fn new(config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        let device = select_device(config.runtime.device);
        seed_device(&device, config.runtime.seed);

        let cifar = Cifar10::load(&config.data)?;
        let (train, valid) = train_validation_split(
            &cifar.train,
            config.data.validation_fraction,
            config.data.split_seed,
        )?;
        info!(
            train = train.len(),
            valid = valid.len(),
            test = cifar.test.len(),
            classes = ?cifar.classes,
            "dataset split"
        );

        Self::from_datasets(config, device, train, valid, Some(cifar.test))
    }

    /// Builds a trainer over caller-supplied splits.
    pub fn from_datasets(
        config: TrainingConfig,
        device: Device,
        train: ImageDataset,
        valid: ImageDataset,
        test: Option<ImageDataset>,
    ) -> Result<Self> {
        config.validate()?;
        if train.is_empty() {
            return Err(TrainingError::initialization("training set is empty"));
        }
        if train.labels().is_none() || valid.labels().is_none() {
            return Err(TrainingError::initialization(
                "training and validation sets must be labeled",
            ));
        }

        let train_loader = DataLoader::new(train, config.data.batch_size, device.clone())?
            .for_training(config.runtime.seed, config.data.augment);
        let valid_loader = DataLoader::new(valid, config.data.eval_batch_size, device.clone())?;
        let test_loader = match test {
            Some(test) => Some(DataLoader::new(
                test,
                config.data.test_batch_size,
                device.clone(),
            )?),
            None => None,
        };

        let variant = config.model.variant;
        let dropout = config.model.dropout.or_else(|| variant.default_dropout());
        let model = Model::new(ModelConfig::for_variant(variant, device.clone()).with_dropout(dropout))?;
        info!(
            model = variant.display_name(),
            parameters = model.parameter_count()?,
            dropout = ?dropout,
            "model ready"
        );

        let optimizer = SgdOptimizer::new(
            model.trainable_parameters()?,
            SgdConfig::from(&config.optimizer),
            GradientClipping::from(&config.optimizer),
        )?;
        let scheduler = SchedulerConfig::from_training_config(
            &config.scheduler,
            config.optimizer.learning_rate,
            config.runtime.epochs,
        )?
        .build();
        let logger = MetricsLogger::new(&config.runtime.logging)?;

        Ok(Self {
            config,
            device,
            model,
            optimizer,
            scheduler,
            loss: CrossEntropyLoss::new(),
            train_loader,
            valid_loader,
            test_loader,
            logger,
            state: TrainingState::default(),
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn optimizer(&self) -> &SgdOptimizer {
        &self.optimizer
    }

    pub fn scheduler(&self) -> &dyn LRScheduler {
        self.scheduler.as_ref()
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.config.runtime.checkpoint.directory
    }

    /// Restores from `resume_from` or the newest `ckpt{N}.pth`. A missing file means a fresh start.
    pub fn resume(&mut self) -> Result<Option<PathBuf>> {
        let candidate = match self.config.runtime.checkpoint.resume_from.clone() {
            Some(path) => Some(path),
            None => checkpoint::latest_epoch_checkpoint(self.checkpoint_dir())?,
        };
        let Some(path) = candidate.filter(|path| path.is_file()) else {
            warn!(
                directory = %self.checkpoint_dir().display(),
                "no checkpoint found; starting from epoch 0"
            );
            return Ok(None);
        };
        self.resume_from_path(&path)?;
        Ok(Some(path))
    }

    /// Restores `path`. A train- or best-stage checkpoint was written mid-epoch, so the
    /// remaining steps of that epoch run here before training continues.
    pub fn resume_from_path(&mut self, path: &Path) -> Result<CheckpointHeader> {
        let loaded = checkpoint::load_checkpoint(path, &self.device)?;
        let header = loaded.header.clone();
        self.apply_checkpoint(loaded)?;
        if header.stage != CheckpointStage::Epoch {
            warn!(
                stage = ?header.stage,
                epoch = header.epoch,
                "checkpoint was written mid-epoch; completing the epoch"
            );
            if header.stage == CheckpointStage::Train {
                self.validate_and_record(header.epoch)?;
            }
            self.close_epoch(header.epoch)?;
        }
        info!(
            path = %path.display(),
            epoch = header.epoch,
            best_acc = self.state.best_acc,
            lr = self.optimizer.learning_rate(),
            "resumed"
        );
        Ok(header)
    }

    pub fn train(&mut self) -> Result<TrainingState> {
        self.train_with_shutdown(|| false)
    }

    /// Runs epochs `state.epoch + 1 ..= runtime.epochs`, polling `should_stop` between epochs.
    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<TrainingState>
    where
        F: FnMut() -> bool,
    {
        let start = self.state.epoch + 1;
        let end = self.config.runtime.epochs;
        info!(
            start,
            end,
            train = self.train_loader.len(),
            valid = self.valid_loader.len(),
            batches = self.train_loader.num_batches(),
            device = ?self.device,
            "starting training"
        );

        for epoch in start..=end {
            if should_stop() {
                warn!(epoch, "shutdown requested; stopping before epoch");
                break;
            }
            let summary = self.run_epoch(epoch)?;
            info!(
                epoch,
                train_loss = format_args!("{:.4}", summary.train.average_loss),
                train_acc = format_args!("{:.3}%", summary.train.accuracy),
                valid_loss = format_args!("{:.4}", summary.valid.average_loss),
                valid_acc = format_args!("{:.3}%", summary.valid.accuracy),
                best_acc = format_args!("{:.3}%", self.state.best_acc),
                improved = summary.improved,
                next_lr = format_args!("{:.5e}", summary.learning_rate),
                "epoch complete"
            );
        }

        if self.state.good_epochs.is_empty() {
            info!("no epoch reached the accuracy threshold");
        } else {
            info!(epochs = ?self.state.good_epochs, "epochs above the accuracy threshold");
        }
        self.logger.flush();
        Ok(self.state.clone())
    }

    /// Train pass, validation pass, scheduler step, checkpoints and milestones for one epoch.
    pub fn run_epoch(&mut self, epoch: usize) -> Result<EpochSummary> {
        let lr = self.optimizer.learning_rate();
        let train = self.train_epoch(epoch)?;
        self.state.epoch = epoch;
        self.state.trends.record_train(&train);
        self.logger.log_train(epoch, &train, lr);
        self.save(
            CheckpointStage::Train,
            &train_checkpoint_path(self.checkpoint_dir(), epoch),
        )?;

        let (valid, improved) = self.validate_and_record(epoch)?;
        let learning_rate = self.close_epoch(epoch)?;

        Ok(EpochSummary {
            epoch,
            train,
            valid,
            improved,
            learning_rate,
        })
    }

    fn validate_and_record(&mut self, epoch: usize) -> Result<(EpochStats, bool)> {
        let valid = self.validate(epoch)?;
        self.state.trends.record_valid(&valid);
        let improved = valid.accuracy > self.state.best_acc;
        if improved {
            self.state.best_acc = valid.accuracy;
        }
        if let Some(threshold) = self.config.report.accuracy_threshold {
            if valid.accuracy >= threshold {
                self.state.good_epochs.push(epoch);
            }
        }
        self.logger.log_valid(epoch, &valid, self.state.best_acc);
        if improved {
            self.save(
                CheckpointStage::Best,
                &best_checkpoint_path(self.checkpoint_dir()),
            )?;
        }
        Ok((valid, improved))
    }

    /// Scheduler step, epoch checkpoint and milestones. Returns the next learning rate.
    fn close_epoch(&mut self, epoch: usize) -> Result<f64> {
        let next_lr = self.scheduler.step();
        self.optimizer.set_learning_rate(next_lr);
        self.save(
            CheckpointStage::Epoch,
            &epoch_checkpoint_path(self.checkpoint_dir(), epoch),
        )?;
        checkpoint::prune_checkpoints(
            self.checkpoint_dir(),
            self.config.runtime.checkpoint.max_keep,
        )?;

        self.run_milestones(epoch)?;
        Ok(next_lr)
    }

    pub fn train_epoch(&mut self, epoch: usize) -> Result<EpochStats> {
        self.model.set_training(true);
        let mut accumulator = EpochAccumulator::new();
        let bar = self.progress_bar(self.train_loader.num_batches(), format!("epoch {epoch} train"));

        for batch in self.train_loader.batches(epoch) {
            let batch = batch?;
            let labels = batch
                .labels
                .as_ref()
                .ok_or_else(|| TrainingError::runtime("training batch has no labels"))?;

            let logits = self.model.forward(&batch.images)?;
            let LossOutput { loss, metrics } = self.loss.compute(&logits, labels)?;
            let mut grads = loss.backward()?;
            let step = self.optimizer.step(&mut grads)?;

            self.state.trends.record_learning_rate(step.learning_rate);
            accumulator.update(&metrics);
            debug!(
                epoch,
                step = self.optimizer.step_count(),
                loss = metrics.average_loss(),
                grad_norm = step.grad_norm,
                clipped = step.clipped,
                "train batch"
            );
            bar.set_message(format!(
                "loss {:.3} | acc {:.2}% ({}/{})",
                accumulator.running_loss(),
                accumulator.running_accuracy(),
                metrics.correct(),
                metrics.total()
            ));
            bar.inc(1);
        }

        bar.finish_and_clear();
        Ok(accumulator.finish())
    }

    /// Evaluation-mode pass over the validation split; parameters are never updated.
    pub fn validate(&mut self, epoch: usize) -> Result<EpochStats> {
        self.model.set_training(false);
        let mut accumulator = EpochAccumulator::new();
        let bar = self.progress_bar(self.valid_loader.num_batches(), format!("epoch {epoch} valid"));

        for batch in self.valid_loader.batches(epoch) {
            let batch = batch?;
            let labels = batch
                .labels
                .as_ref()
                .ok_or_else(|| TrainingError::runtime("validation batch has no labels"))?;
            let logits = self.model.forward(&batch.images)?.detach();
            let metrics = self.loss.compute(&logits, labels)?.metrics;
            accumulator.update(&metrics);
            bar.set_message(format!(
                "loss {:.3} | acc {:.2}%",
                accumulator.running_loss(),
                accumulator.running_accuracy()
            ));
            bar.inc(1);
        }
        bar.finish_and_clear();

        let stats = accumulator.finish();
        if stats.total != self.valid_loader.len() {
            return Err(TrainingError::runtime(format!(
                "validation covered {} of {} samples",
                stats.total,
                self.valid_loader.len()
            )));
        }
        Ok(stats)
    }

    fn run_milestones(&mut self, epoch: usize) -> Result<()> {
        let output_dir = self.config.report.output_dir.clone();

        if self.state.good_epochs.last() == Some(&epoch) {
            let ordinal = self.state.good_epochs.len();
            self.export_predictions(&good_predictions_path(&output_dir, ordinal))?;
        }

        for action in report::milestone_actions(&self.config.report.milestones, epoch) {
            match action {
                MilestoneAction::Predict => {
                    self.export_predictions(&milestone_predictions_path(&output_dir, epoch))?
                }
                MilestoneAction::Plot => {
                    let tags = self.config.hyperparameter_tags();
                    match report::plot_trends(&output_dir, &tags, epoch, &self.state.trends) {
                        Ok(paths) => info!(epoch, files = ?paths, "plots written"),
                        Err(err) => warn!(epoch, error = %err, "plotting failed"),
                    }
                }
                MilestoneAction::Summary => report::log_summary(&self.state),
            }
        }
        Ok(())
    }

    fn export_predictions(&self, path: &Path) -> Result<()> {
        let Some(loader) = self.test_loader.as_ref() else {
            warn!(path = %path.display(), "no test set loaded; skipping predictions");
            return Ok(());
        };
        let predictions = report::generate_predictions(&self.model, loader)?;
        report::write_predictions_csv(path, &predictions)
    }

    fn save(&self, stage: CheckpointStage, path: &Path) -> Result<()> {
        checkpoint::save_checkpoint(SaveRequest {
            path,
            stage,
            config: &self.config,
            model: &self.model,
            optimizer: &self.optimizer,
            scheduler: self.scheduler.as_ref(),
            state: &self.state,
        })?;
        Ok(())
    }

    fn apply_checkpoint(&mut self, loaded: LoadedCheckpoint) -> Result<()> {
        let fingerprint = checkpoint::fingerprint_config(&self.config)?;
        if loaded.header.config_sha256 != fingerprint {
            warn!(
                path = %loaded.path.display(),
                "checkpoint was written with a different configuration"
            );
        }

        let optimizer_state = loaded.optimizer_state();
        let LoadedCheckpoint {
            header,
            model_tensors,
            ..
        } = loaded;

        self.model.load_state_tensors(model_tensors)?;
        self.optimizer.load_state(optimizer_state)?;
        self.scheduler.load_state(&header.scheduler)?;
        self.optimizer
            .set_learning_rate(self.scheduler.learning_rate());
        self.state = header.training_state();
        Ok(())
    }

    fn progress_bar(&self, len: usize, prefix: String) -> ProgressBar {
        if !self.config.runtime.logging.progress_bar {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        bar.set_style(
            ProgressStyle::with_template(
                "{prefix} [{elapsed_precise}] {bar:30.cyan/blue} {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
        );
        bar.set_prefix(prefix);
        bar
    }
}
