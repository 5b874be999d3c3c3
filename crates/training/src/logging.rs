use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::{BufMut, BytesMut};
use crc32fast::Hasher as Crc32;
use prost::Message;
use tracing::{info, warn};

use crate::{config::LoggingConfig, error::Result, metrics::EpochStats, TrainingError};

/// Epoch-level metric sink: always `tracing`, optionally a TensorBoard event file.
pub struct MetricsLogger {
    events: Option<EventFileWriter>,
}

impl MetricsLogger {
    pub fn new(config: &LoggingConfig) -> Result<Self> {
        let events = match config.tensorboard_dir.as_ref() {
            Some(dir) => {
                let writer = EventFileWriter::create(dir, config.tensorboard_flush_every_n)?;
                info!(path = %writer.path.display(), "writing TensorBoard events");
                Some(writer)
            }
            None => None,
        };
        Ok(Self { events })
    }

    pub fn event_file(&self) -> Option<&Path> {
        self.events.as_ref().map(|writer| writer.path.as_path())
    }

    pub fn log_train(&mut self, epoch: usize, stats: &EpochStats, lr: f64) {
        info!(
            epoch,
            loss = format_args!("{:.4}", stats.average_loss),
            acc = format_args!("{:.3}%", stats.accuracy),
            correct = stats.correct,
            total = stats.total,
            lr = format_args!("{:.5e}", lr),
            secs = format_args!("{:.1}", stats.elapsed.as_secs_f64()),
            "train"
        );
        self.scalars(
            epoch,
            &[
                ("train/loss", stats.average_loss),
                ("train/accuracy", stats.accuracy),
                ("train/learning_rate", lr),
            ],
        );
    }

    pub fn log_valid(&mut self, epoch: usize, stats: &EpochStats, best_acc: f64) {
        info!(
            epoch,
            loss = format_args!("{:.4}", stats.average_loss),
            acc = format_args!("{:.3}%", stats.accuracy),
            correct = stats.correct,
            total = stats.total,
            best = format_args!("{:.3}%", best_acc),
            "valid"
        );
        self.scalars(
            epoch,
            &[
                ("valid/loss", stats.average_loss),
                ("valid/accuracy", stats.accuracy),
                ("valid/best_accuracy", best_acc),
            ],
        );
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.events.as_mut() {
            if let Err(err) = writer.flush() {
                warn!(error = %err, "failed to flush TensorBoard events");
            }
        }
    }

    fn scalars(&mut self, step: usize, values: &[(&str, f64)]) {
        let Some(writer) = self.events.as_mut() else {
            return;
        };
        for (tag, value) in values {
            if let Err(err) = writer.write_scalar(tag, step as i64, *value) {
                warn!(tag = *tag, error = %err, "dropping TensorBoard scalar");
            }
        }
    }
}

struct EventFileWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl EventFileWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let path = dir.join(format!(
            "events.out.tfevents.{}.{}",
            unix_seconds() as u64,
            hostname()
        ));
        let file = File::create(&path)?;
        let mut writer = Self {
            path,
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        };
        writer.write_event(&Event {
            wall_time: unix_seconds(),
            step: 0,
            file_version: Some("brain.Event:2".to_string()),
            summary: None,
        })?;
        Ok(writer)
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<()> {
        self.write_event(&Event {
            wall_time: unix_seconds(),
            step,
            file_version: None,
            summary: Some(Summary {
                value: vec![SummaryValue {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        })
    }

    fn write_event(&mut self, event: &Event) -> Result<()> {
        self.writer.write_all(&frame_record(&event.encode_to_vec()))?;
        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for EventFileWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// TFRecord framing: `len u64 | masked_crc(len) u32 | data | masked_crc(data) u32`, little endian.
fn frame_record(data: &[u8]) -> BytesMut {
    let len = (data.len() as u64).to_le_bytes();
    let mut frame = BytesMut::with_capacity(data.len() + 16);
    frame.put_slice(&len);
    frame.put_u32_le(masked_crc32(&len));
    frame.put_slice(data);
    frame.put_u32_le(masked_crc32(data));
    frame
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    hasher.finalize().rotate_right(15).wrapping_add(0xa282_ead8)
}

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<SummaryValue>,
}

#[derive(Clone, PartialEq, Message)]
struct SummaryValue {
    #[prost(string, tag = "1")]
    tag: String,
    #[prost(float, optional, tag = "2")]
    simple_value: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::EpochAccumulator;

    #[test]
    fn frames_carry_length_and_checksums() {
        let payload = b"scalar";
        let frame = frame_record(payload);
        assert_eq!(frame.len(), payload.len() + 16);
        assert_eq!(&frame[..8], &(payload.len() as u64).to_le_bytes());
        assert_eq!(&frame[12..12 + payload.len()], payload);
        let tail = u32::from_le_bytes(frame[frame.len() - 4..].try_into().unwrap());
        assert_eq!(tail, masked_crc32(payload));
    }

    #[test]
    fn event_file_collects_scalars() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            tensorboard_dir: Some(dir.path().to_path_buf()),
            ..LoggingConfig::default()
        };
        let mut logger = MetricsLogger::new(&config).unwrap();
        let stats = EpochAccumulator::new().finish();
        logger.log_train(1, &stats, 0.1);
        logger.log_valid(1, &stats, 0.0);
        logger.flush();

        let path = logger.event_file().unwrap().to_path_buf();
        let bytes = fs::read(&path).unwrap();
        let first_len = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize;
        let first = Event::decode(&bytes[12..12 + first_len]).unwrap();
        assert_eq!(first.file_version.as_deref(), Some("brain.Event:2"));
        // header record plus six scalars
        let mut offset = 0;
        let mut records = 0;
        while offset < bytes.len() {
            let len = u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap()) as usize;
            offset += len + 16;
            records += 1;
        }
        assert_eq!(records, 7);
    }
}
