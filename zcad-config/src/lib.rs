use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// 应用配置的根结构。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub preview: PreviewConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub bake: BakeConfig,
}

impl AppConfig {
    /// 从显式路径加载配置。
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// 自动发现配置文件：优先读取环境变量 `ZCAD_CONFIG`，否则寻找 `./config/default.toml`。
    /// 若文件缺失，则返回默认配置。
    pub fn discover() -> Result<Self, ConfigError> {
        if let Some(path) = env::var_os("ZCAD_CONFIG") {
            return Self::from_file(PathBuf::from(path));
        }

        let default_path = env::current_dir()
            .map(|dir| dir.join("config").join("default.toml"))
            .map_err(|source| ConfigError::Context {
                message: "获取当前工作目录失败".to_string(),
                source,
            })?;

        if default_path.exists() {
            Self::from_file(default_path)
        } else {
            Ok(Self::default())
        }
    }
}

/// 日志配置，支持设置默认等级。
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewMode {
    Off,
    #[default]
    Shaded,
    Wireframe,
}

/// 瞬态预览配置。
#[derive(Debug, Clone, Deserialize)]
pub struct PreviewConfig {
    #[serde(default)]
    pub mode: PreviewMode,
    #[serde(default = "PreviewConfig::default_layer")]
    pub layer: String,
    /// 未设置时调试构建严格校验、发布构建静默过滤。
    #[serde(default)]
    pub silent_validation: Option<bool>,
    /// ACI 颜色索引，未设置时随层。
    #[serde(default)]
    pub color: Option<u8>,
}

impl PreviewConfig {
    fn default_layer() -> String {
        "0".to_string()
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            mode: PreviewMode::default(),
            layer: Self::default_layer(),
            silent_validation: None,
            color: None,
        }
    }
}

/// 文档变更与图求解之间的同步配置。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncConfig {
    /// 文档变更后等待合并后续变更的毫秒数。
    #[serde(default)]
    pub solve_delay_ms: u64,
}

impl SyncConfig {
    pub fn solve_delay(&self) -> Duration {
        Duration::from_millis(self.solve_delay_ms)
    }
}

/// 烘焙覆盖项，均为可选。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BakeConfig {
    #[serde(default)]
    pub layer: Option<String>,
    #[serde(default)]
    pub linetype: Option<String>,
    #[serde(default)]
    pub color: Option<u8>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件 {path:?} 失败: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("解析配置文件 {path:?} 失败: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{message}")]
    Context {
        message: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_cover_every_section() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.preview.mode, PreviewMode::Shaded);
        assert_eq!(cfg.preview.layer, "0");
        assert!(cfg.preview.silent_validation.is_none());
        assert_eq!(cfg.sync.solve_delay(), Duration::ZERO);
        assert!(cfg.bake.layer.is_none());
    }

    #[test]
    fn load_from_temp_file() {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        writeln!(
            file,
            r#"
            [logging]
            level = "debug"

            [preview]
            mode = "wireframe"
            silent_validation = true
            color = 1

            [sync]
            solve_delay_ms = 250

            [bake]
            layer = "Baked"
            linetype = "DASHED"
            "#
        )
        .expect("write temp config");

        let cfg = AppConfig::from_file(file.path()).expect("load config");
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.preview.mode, PreviewMode::Wireframe);
        assert_eq!(cfg.preview.silent_validation, Some(true));
        assert_eq!(cfg.preview.color, Some(1));
        assert_eq!(cfg.preview.layer, "0");
        assert_eq!(cfg.sync.solve_delay(), Duration::from_millis(250));
        assert_eq!(cfg.bake.layer.as_deref(), Some("Baked"));
        assert_eq!(cfg.bake.linetype.as_deref(), Some("DASHED"));
        assert!(cfg.bake.color.is_none());
    }

    #[test]
    fn parse_errors_carry_the_path() {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        writeln!(file, "[preview]\nmode = \"hologram\"").expect("write temp config");

        let err = AppConfig::from_file(file.path()).unwrap_err();
        match err {
            ConfigError::Parse { path, .. } => assert_eq!(path, file.path()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let err = AppConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
