use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};

use crate::{FrameTick, Result, VisualiserError};

/// Where and how often bar heights are captured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSettings {
    pub output_path: PathBuf,
    pub fps: u32,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("trace.json"),
            fps: 60,
        }
    }
}

/// Bar heights captured for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub index: u64,
    pub time_seconds: f64,
    pub heights: Vec<f32>,
}

/// Everything written to a trace file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub fps: u32,
    pub bar_count: usize,
    pub frames: Vec<FrameRecord>,
}

/// Collects per-frame bar heights and writes them out as JSON.
#[derive(Debug, Default)]
pub struct FrameRecorder {
    settings: RecordingSettings,
    bar_count: usize,
    frames: Vec<FrameRecord>,
    is_recording: bool,
}

impl FrameRecorder {
    pub fn new(settings: RecordingSettings, bar_count: usize) -> Self {
        Self {
            settings,
            bar_count,
            frames: Vec::new(),
            is_recording: false,
        }
    }

    pub fn start(&mut self) {
        self.is_recording = true;
    }

    pub fn stop(&mut self) {
        self.is_recording = false;
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording
    }

    /// Appends one frame while recording. Frames with the wrong number of bars
    /// are rejected.
    pub fn record(&mut self, tick: FrameTick, heights: &[f32]) -> Result<()> {
        if !self.is_recording {
            return Ok(());
        }
        if heights.len() != self.bar_count {
            return Err(VisualiserError::invalid_state(format!(
                "recorded {} heights for {} bars",
                heights.len(),
                self.bar_count
            )));
        }
        self.frames.push(FrameRecord {
            index: tick.index,
            time_seconds: tick.elapsed.as_secs_f64(),
            heights: heights.to_vec(),
        });
        Ok(())
    }

    pub fn frames(&self) -> &[FrameRecord] {
        &self.frames
    }

    pub fn trace(&self) -> Trace {
        Trace {
            fps: self.settings.fps,
            bar_count: self.bar_count,
            frames: self.frames.clone(),
        }
    }

    /// Writes the trace to the configured output path.
    pub fn write(&self) -> Result<()> {
        let file = File::create(&self.settings.output_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &self.trace())?;
        writer.flush()?;
        tracing::info!(
            path = %self.settings.output_path.display(),
            frames = self.frames.len(),
            "wrote trace"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn tick(index: u64) -> FrameTick {
        FrameTick {
            index,
            elapsed: Duration::from_millis(500 * index),
        }
    }

    #[test]
    fn records_only_while_started() {
        let mut recorder = FrameRecorder::new(RecordingSettings::default(), 2);
        recorder.record(tick(0), &[0.1, 0.1]).unwrap();
        recorder.start();
        recorder.record(tick(1), &[0.5, 1.0]).unwrap();
        recorder.stop();
        recorder.record(tick(2), &[0.2, 0.2]).unwrap();

        assert_eq!(recorder.frames().len(), 1);
        assert_eq!(recorder.frames()[0].time_seconds, 0.5);
    }

    #[test]
    fn rejects_mismatched_bar_counts() {
        let mut recorder = FrameRecorder::new(RecordingSettings::default(), 3);
        recorder.start();
        assert!(recorder.record(tick(0), &[1.0]).is_err());
    }

    #[test]
    fn writes_json_trace() {
        let path = std::env::temp_dir().join(format!("radial-trace-{}.json", std::process::id()));
        let settings = RecordingSettings {
            output_path: path.clone(),
            fps: 30,
        };
        let mut recorder = FrameRecorder::new(settings, 1);
        recorder.start();
        recorder.record(tick(0), &[0.25]).unwrap();
        recorder.write().unwrap();

        let trace: Trace = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(trace.fps, 30);
        assert_eq!(trace.frames[0].heights, vec![0.25]);
    }
}
