//! Filesystem-backed data source: one JSON-lines file per definition under
//! `<data_root>/datasets/<definition>.jsonl`.

use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::PathBuf;

use crate::common::config::EngineConfig;
use crate::common::error::{DataError, EngineError, EngineResult};

use super::domain::{DataSource, Record};

pub struct FsDataSource {
    root: PathBuf,
}

impl FsDataSource {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            root: PathBuf::from(&cfg.data_root).join("datasets"),
        }
    }

    fn dataset_path(&self, definition_name: &str) -> PathBuf {
        self.root.join(format!("{definition_name}.jsonl"))
    }
}

impl DataSource for FsDataSource {
    fn snapshot(&self, definition_name: &str) -> EngineResult<Vec<Record>> {
        let path = self.dataset_path(definition_name);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(EngineError::not_found("dataset", path.display()));
            }
            Err(e) => return Err(EngineError::transient(format!("{}: {e}", path.display()))),
        };

        let mut records = Vec::new();
        for (row, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| EngineError::transient(format!("{}: {e}", path.display())))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(&line).map_err(|e| DataError::InvalidValue {
                column: "<row>".to_string(),
                row,
                value: e.to_string(),
            })?;
            records.push(record);
        }
        Ok(records)
    }
}
