use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const SCALARS_FILE: &str = "scalars.jsonl";

/// One logged value of a named series under a tag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub tag: String,
    pub series: String,
    pub step: usize,
    pub value: f64,
}

/// Writes scalar events as JSON lines under a log directory. Each writer
/// starts a fresh log, replacing the one of a previous run.
pub struct ScalarWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl ScalarWriter {
    pub fn new(log_dir: impl AsRef<Path>) -> Result<Self> {
        let log_dir = log_dir.as_ref();
        fs::create_dir_all(log_dir).map_err(Error::io(log_dir))?;

        let path = log_dir.join(SCALARS_FILE);
        let file = File::create(&path).map_err(Error::io(&path))?;

        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes every `(series, value)` pair of `tag` at `step`.
    pub fn add_scalars(&mut self, tag: &str, values: &[(&str, f64)], step: usize) -> Result<()> {
        for (series, value) in values {
            let event = ScalarEvent {
                tag: tag.to_string(),
                series: series.to_string(),
                step,
                value: *value,
            };
            serde_json::to_writer(&mut self.out, &event)?;
            self.out.write_all(b"\n").map_err(Error::io(&self.path))?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush().map_err(Error::io(&self.path))
    }

    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

/// Reads back every event of a scalars file.
pub fn read_scalars(log_dir: impl AsRef<Path>) -> Result<Vec<ScalarEvent>> {
    let path = log_dir.as_ref().join(SCALARS_FILE);
    let content = fs::read_to_string(&path).map_err(Error::io(&path))?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(Error::from))
        .collect()
}
