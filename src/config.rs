//! Run configuration, read from a TOML file.
//!
//! Every key has a default so a partial (or missing) file is fine.
use crate::analyser::metrics::Cast;
use crate::error::Result;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub output: OutputConfig,
    pub logging: LoggingConfig,
    pub preprocess: PreprocessConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Corpus root; captures are read from `<data_path>/raw`.
    pub data_path: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub capture: String,
    pub resources: String,
    pub table: String,
    pub keep_resource: bool,
    pub keep_capture: bool,
    pub filterlists: PathBuf,
    pub public_suffix_list: PathBuf,
    /// Address prefixes of the crawler's private bridge network.
    pub internal_prefixes: Vec<String>,
    /// Output field -> dissection field path, e.g. `sizes = "frame.len"`.
    pub collect: BTreeMap<String, String>,
    pub cast: BTreeMap<String, Cast>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
        }
    }
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        let collect = BTreeMap::from([
            (String::from("sizes"), String::from("frame.len")),
            (String::from("rel_time"), String::from("frame.time_relative")),
            (String::from("ip_src"), String::from("ip.src")),
        ]);
        let cast = BTreeMap::from([
            (String::from("sizes"), Cast::Int),
            (String::from("rel_time"), Cast::Float),
        ]);

        Self {
            capture: String::from("capture.json"),
            resources: String::from("resources.json"),
            table: String::from("resources.csv"),
            keep_resource: true,
            keep_capture: true,
            filterlists: PathBuf::from("lists/block"),
            public_suffix_list: PathBuf::from("lists/public_suffix_list.dat"),
            internal_prefixes: vec![String::from("172.17.")],
            collect,
            cast,
        }
    }
}

impl Config {
    /// Reads the config at `path`, falling back to defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }

        let text = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)?;
        Ok(config)
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.output.data_path.join("raw")
    }

    pub fn table_path(&self) -> PathBuf {
        self.output.data_path.join("preprocessed").join(&self.preprocess.table)
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.logging.level.parse().unwrap_or(log::LevelFilter::Info)
    }
}
