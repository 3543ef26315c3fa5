//! Procedure subsystem configuration via `graphproc.toml`
//!
//! Same model as the database's own config file: on first start a commented
//! default file is written next to the data, missing fields take their
//! defaults, and values are validated eagerly when the file is read.
//!
//! Toolchain steps are argv templates. Placeholders are substituted per
//! build:
//!
//! | Placeholder | Meaning |
//! |-------------|---------|
//! | `{name}` | internal procedure name |
//! | `{source}` | single staged source file |
//! | `{sources}` | every staged source file, one argument each |
//! | `{output}` | file the step must produce |
//! | `{archive}` | staged archive |
//! | `{dir}` | staging directory |

use graphproc_core::{ProcedureError, ProcedureResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name placed in the database directory.
pub const CONFIG_FILE_NAME: &str = "graphproc.toml";

/// Default idle time before a free worker is reclaimed.
pub const DEFAULT_MAX_IDLE_SECONDS: i64 = 600;

/// Default lifetime of a worker process.
pub const DEFAULT_MAX_LIFETIME_SECONDS: i64 = 3600;

/// Where one language keeps its artifacts and registry table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LanguageConfig {
    /// Directory holding loadable artifacts; defaults to `<db_dir>/<table>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_dir: Option<PathBuf>,
    /// Registry table name.
    pub table: String,
}

impl LanguageConfig {
    fn with_table(table: &str) -> Self {
        LanguageConfig {
            plugin_dir: None,
            table: table.to_string(),
        }
    }

    /// Plugin directory, resolved against the database directory.
    pub fn resolve_plugin_dir(&self, db_dir: &Path) -> PathBuf {
        match &self.plugin_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => db_dir.join(dir),
            None => db_dir.join(&self.table),
        }
    }
}

fn default_native() -> LanguageConfig {
    LanguageConfig::with_table("native_plugins")
}

/// Interpreted procedures and their worker pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterpretedConfig {
    /// Artifact location and registry table.
    #[serde(flatten)]
    pub storage: LanguageConfig,
    /// Idle time before a free worker is reclaimed; `<= 0` disables.
    #[serde(default = "default_max_idle_seconds")]
    pub max_idle_seconds: i64,
    /// Lifetime after which a worker is retired; `<= 0` disables.
    #[serde(default = "default_max_lifetime_seconds")]
    pub max_lifetime_seconds: i64,
    /// Worker poll tick in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Worker executable; looked up on `PATH` when not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_program: Option<PathBuf>,
    /// Extra arguments passed to every worker.
    #[serde(default)]
    pub worker_args: Vec<String>,
    /// Interpreter the worker runs modules with.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
}

fn default_max_idle_seconds() -> i64 {
    DEFAULT_MAX_IDLE_SECONDS
}

fn default_max_lifetime_seconds() -> i64 {
    DEFAULT_MAX_LIFETIME_SECONDS
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_interpreted() -> InterpretedConfig {
    InterpretedConfig {
        storage: LanguageConfig::with_table("interpreted_plugins"),
        max_idle_seconds: DEFAULT_MAX_IDLE_SECONDS,
        max_lifetime_seconds: DEFAULT_MAX_LIFETIME_SECONDS,
        poll_interval_ms: default_poll_interval_ms(),
        worker_program: None,
        worker_args: Vec::new(),
        interpreter: default_interpreter(),
    }
}

impl InterpretedConfig {
    /// Idle threshold, `None` when disabled.
    pub fn max_idle(&self) -> Option<Duration> {
        positive_seconds(self.max_idle_seconds)
    }

    /// Worker lifetime, `None` when disabled.
    pub fn max_lifetime(&self) -> Option<Duration> {
        positive_seconds(self.max_lifetime_seconds)
    }

    /// Worker poll tick.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn positive_seconds(secs: i64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs as u64))
}

/// External toolchain command templates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolchainConfig {
    /// Compile staged C++ sources into a shared library.
    #[serde(default = "default_cpp_compile")]
    pub cpp_compile: Vec<String>,
    /// Transpile an interpreted source into C++.
    #[serde(default = "default_py_transpile")]
    pub py_transpile: Vec<String>,
    /// Compile a transpiled source into a shared library.
    #[serde(default = "default_cpp_compile")]
    pub py_compile: Vec<String>,
    /// Unpack an archive into the staging directory.
    #[serde(default = "default_zip_unpack")]
    pub zip_unpack: Vec<String>,
    /// Build an unpacked archive; runs inside the staging directory.
    #[serde(default = "default_zip_build")]
    pub zip_build: Vec<String>,
    /// File extension of the binary an archive build must produce.
    #[serde(default = "default_binary_extension")]
    pub binary_extension: String,
    /// Deadline for each toolchain step, in seconds.
    #[serde(default = "default_toolchain_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_cpp_compile() -> Vec<String> {
    argv(&[
        "g++",
        "-fno-gnu-unique",
        "-fPIC",
        "-g",
        "--std=c++17",
        "-O2",
        "{sources}",
        "-o",
        "{output}",
        "-shared",
    ])
}

fn default_py_transpile() -> Vec<String> {
    argv(&[
        "cython",
        "{source}",
        "-+",
        "-3",
        "-o",
        "{output}",
        "--module-name",
        "{name}",
    ])
}

fn default_zip_unpack() -> Vec<String> {
    argv(&["unzip", "-o", "{archive}", "-d", "{dir}"])
}

fn default_zip_build() -> Vec<String> {
    argv(&["make"])
}

fn default_binary_extension() -> String {
    "so".to_string()
}

fn default_toolchain_timeout_seconds() -> u64 {
    300
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        ToolchainConfig {
            cpp_compile: default_cpp_compile(),
            py_transpile: default_py_transpile(),
            py_compile: default_cpp_compile(),
            zip_unpack: default_zip_unpack(),
            zip_build: default_zip_build(),
            binary_extension: default_binary_extension(),
            timeout_seconds: default_toolchain_timeout_seconds(),
        }
    }
}

impl ToolchainConfig {
    /// Deadline for each toolchain step.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    fn validate(&self) -> ProcedureResult<()> {
        let templates = [
            ("cpp_compile", &self.cpp_compile),
            ("py_transpile", &self.py_transpile),
            ("py_compile", &self.py_compile),
            ("zip_unpack", &self.zip_unpack),
            ("zip_build", &self.zip_build),
        ];
        for (key, template) in templates {
            if template.is_empty() {
                return Err(ProcedureError::input(format!(
                    "Toolchain command '{}' in {} cannot be empty.",
                    key, CONFIG_FILE_NAME
                )));
            }
        }
        if self.timeout_seconds == 0 {
            return Err(ProcedureError::input(format!(
                "Toolchain timeout in {} must be positive.",
                CONFIG_FILE_NAME
            )));
        }
        Ok(())
    }
}

/// Procedure subsystem configuration loaded from `graphproc.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcedureConfig {
    /// Graph the procedures belong to.
    #[serde(default = "default_graph")]
    pub graph: String,
    /// Database directory; relative plugin dirs resolve against it.
    #[serde(default = "default_db_dir")]
    pub db_dir: PathBuf,
    /// Build identifier stamped on compiled artifacts; defaults to the
    /// package version. Changing it forces a rebuild at next startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    /// Whether interpreted procedures are served.
    #[serde(default = "default_true")]
    pub enable_interpreted: bool,
    /// Native procedure storage.
    #[serde(default = "default_native")]
    pub native: LanguageConfig,
    /// Interpreted procedure storage and worker pool.
    #[serde(default = "default_interpreted")]
    pub interpreted: InterpretedConfig,
    /// Toolchain commands.
    #[serde(default)]
    pub toolchain: ToolchainConfig,
}

fn default_graph() -> String {
    "default".to_string()
}

fn default_db_dir() -> PathBuf {
    PathBuf::from("./graphproc_db")
}

fn default_true() -> bool {
    true
}

impl Default for ProcedureConfig {
    fn default() -> Self {
        ProcedureConfig {
            graph: default_graph(),
            db_dir: default_db_dir(),
            build_id: None,
            enable_interpreted: true,
            native: default_native(),
            interpreted: default_interpreted(),
            toolchain: ToolchainConfig::default(),
        }
    }
}

impl ProcedureConfig {
    /// Default config rooted at `db_dir`.
    pub fn with_db_dir(db_dir: impl Into<PathBuf>) -> Self {
        ProcedureConfig {
            db_dir: db_dir.into(),
            ..Default::default()
        }
    }

    /// Build identifier in effect.
    pub fn effective_build_id(&self) -> String {
        self.build_id
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> ProcedureResult<()> {
        if self.native.table.is_empty() || self.interpreted.storage.table.is_empty() {
            return Err(ProcedureError::input(format!(
                "Registry table names in {} cannot be empty.",
                CONFIG_FILE_NAME
            )));
        }
        if self.enable_interpreted && self.native.table == self.interpreted.storage.table {
            return Err(ProcedureError::input(format!(
                "Native and interpreted procedures cannot share table '{}'.",
                self.native.table
            )));
        }
        if self.interpreted.poll_interval_ms == 0 {
            return Err(ProcedureError::input(format!(
                "Worker poll interval in {} must be positive.",
                CONFIG_FILE_NAME
            )));
        }
        self.toolchain.validate()
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# graphproc configuration
#
# Graph the procedures belong to
graph = "default"

# Data directory; relative plugin directories resolve against it
db_dir = "./graphproc_db"

# Build identifier stamped on compiled procedures (default: package version).
# Changing it recompiles every procedure from source at next startup.
# build_id = "2024-06-01"

# Serve interpreted procedures through worker processes
enable_interpreted = true

[native]
table = "native_plugins"
# plugin_dir = "native_plugins"

[interpreted]
table = "interpreted_plugins"
# plugin_dir = "interpreted_plugins"
# Free workers idle this long are reclaimed; <= 0 keeps them forever
max_idle_seconds = 600
# Workers older than this are retired after their current task; <= 0 disables
max_lifetime_seconds = 3600
poll_interval_ms = 1000
interpreter = "python3"
# worker_program = "/usr/local/bin/graphproc-task-runner"

[toolchain]
cpp_compile = ["g++", "-fno-gnu-unique", "-fPIC", "-g", "--std=c++17", "-O2", "{sources}", "-o", "{output}", "-shared"]
py_transpile = ["cython", "{source}", "-+", "-3", "-o", "{output}", "--module-name", "{name}"]
py_compile = ["g++", "-fno-gnu-unique", "-fPIC", "-g", "--std=c++17", "-O2", "{sources}", "-o", "{output}", "-shared"]
zip_unpack = ["unzip", "-o", "{archive}", "-d", "{dir}"]
zip_build = ["make"]
binary_extension = "so"
timeout_seconds = 300
"#
    }

    /// Read and parse config from a file path.
    pub fn from_file(path: &Path) -> ProcedureResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProcedureError::internal(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: ProcedureConfig = toml::from_str(&content).map_err(|e| {
            ProcedureError::input(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> ProcedureResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                ProcedureError::internal(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> ProcedureResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProcedureError::internal(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            ProcedureError::internal(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_toml_matches_default() {
        let parsed: ProcedureConfig = toml::from_str(ProcedureConfig::default_toml()).unwrap();
        assert_eq!(parsed, ProcedureConfig::default());
        parsed.validate().unwrap();
    }

    #[test]
    fn empty_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "").unwrap();

        let config = ProcedureConfig::from_file(&path).unwrap();
        assert_eq!(config.interpreted.max_idle_seconds, 600);
        assert_eq!(config.native.table, "native_plugins");
    }

    #[test]
    fn write_default_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "graph = \"social\"\n").unwrap();

        ProcedureConfig::write_default_if_missing(&path).unwrap();
        let config = ProcedureConfig::from_file(&path).unwrap();
        assert_eq!(config.graph, "social");
    }

    #[test]
    fn write_default_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        ProcedureConfig::write_default_if_missing(&path).unwrap();
        assert!(path.exists());
        assert_eq!(
            ProcedureConfig::from_file(&path).unwrap(),
            ProcedureConfig::default()
        );
    }

    #[test]
    fn non_positive_durations_disable_policies() {
        let config: ProcedureConfig = toml::from_str(
            "[interpreted]\ntable = \"py\"\nmax_idle_seconds = 0\nmax_lifetime_seconds = -1\n",
        )
        .unwrap();
        assert_eq!(config.interpreted.max_idle(), None);
        assert_eq!(config.interpreted.max_lifetime(), None);
        assert_eq!(
            ProcedureConfig::default().interpreted.max_idle(),
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn plugin_dir_resolution() {
        let db = Path::new("/data/db");
        let mut lang = LanguageConfig::with_table("native_plugins");
        assert_eq!(lang.resolve_plugin_dir(db), db.join("native_plugins"));
        lang.plugin_dir = Some(PathBuf::from("so"));
        assert_eq!(lang.resolve_plugin_dir(db), db.join("so"));
        lang.plugin_dir = Some(PathBuf::from("/opt/so"));
        assert_eq!(lang.resolve_plugin_dir(db), PathBuf::from("/opt/so"));
    }

    #[test]
    fn shared_table_rejected() {
        let mut config = ProcedureConfig::default();
        config.interpreted.storage.table = config.native.table.clone();
        assert!(config.validate().is_err());
        config.enable_interpreted = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_template_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[toolchain]\nzip_build = []\n").unwrap();
        let err = ProcedureConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("zip_build"));
    }

    #[test]
    fn build_id_override() {
        let mut config = ProcedureConfig::default();
        assert_eq!(config.effective_build_id(), env!("CARGO_PKG_VERSION"));
        config.build_id = Some("abc".into());
        assert_eq!(config.effective_build_id(), "abc");
    }

    #[test]
    fn round_trip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut config = ProcedureConfig::with_db_dir("/tmp/db");
        config.interpreted.worker_program = Some(PathBuf::from("/bin/runner"));
        config.interpreted.worker_args = vec!["--verbose".into()];
        config.write_to_file(&path).unwrap();
        assert_eq!(ProcedureConfig::from_file(&path).unwrap(), config);
    }
}
