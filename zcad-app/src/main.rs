use std::path::PathBuf;

use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use zcad_config::{AppConfig, ConfigError};
use zcad_core::document::Color;
use zcad_engine::bake::BakeSettings;
use zcad_engine::convert::{PreviewMode, PreviewSettings};
use zcad_engine::session::SessionOptions;
use zcad_engine::validate::ValidationMode;

mod demo;

fn main() {
    let mut args = std::env::args().skip(1);
    let mut mode_override: Option<PreviewMode> = None;
    let mut config_override: Option<PathBuf> = None;
    let mut json = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--json" => json = true,
            "--mode" => {
                let Some(value) = args.next() else {
                    eprintln!("`--mode` 需要提供 off / shaded / wireframe 之一");
                    std::process::exit(1);
                };
                match value.parse() {
                    Ok(mode) => mode_override = Some(mode),
                    Err(err) => {
                        eprintln!("{err}");
                        std::process::exit(1);
                    }
                }
            }
            "--config" => {
                let Some(path) = args.next() else {
                    eprintln!("`--config` 需要提供配置文件路径");
                    std::process::exit(1);
                };
                config_override = Some(PathBuf::from(path));
            }
            other => {
                eprintln!("未知参数：{other}");
                std::process::exit(1);
            }
        }
    }

    let config = load_configuration(config_override);
    init_logging(&config);
    info!("启动 ZCAD 预览同步演示");

    let mut options = session_options(&config);
    if let Some(mode) = mode_override {
        options.preview.mode = mode;
    }

    match demo::run(options) {
        Ok(report) => {
            if json {
                match serde_json::to_string_pretty(&report) {
                    Ok(text) => println!("{text}"),
                    Err(err) => {
                        error!(error = %err, "序列化演示结果失败");
                        std::process::exit(1);
                    }
                }
            } else {
                report.print();
            }
        }
        Err(err) => {
            error!(error = %err, "执行演示失败");
            std::process::exit(1);
        }
    }
}

fn session_options(config: &AppConfig) -> SessionOptions {
    SessionOptions {
        preview: PreviewSettings {
            mode: config.preview.mode.into(),
            layer: config.preview.layer.clone(),
            color: aci(config.preview.color),
        },
        validation: ValidationMode::from_silent(config.preview.silent_validation),
        solve_delay: config.sync.solve_delay(),
        bake: BakeSettings {
            layer: config.bake.layer.clone(),
            linetype: config.bake.linetype.clone(),
            color: config.bake.color.map(Color::Index),
        },
    }
}

fn aci(index: Option<u8>) -> Color {
    index.map(Color::Index).unwrap_or(Color::ByLayer)
}

fn load_configuration(override_path: Option<PathBuf>) -> AppConfig {
    match override_path {
        Some(path) => AppConfig::from_file(&path).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "加载指定配置失败，使用默认配置");
            AppConfig::default()
        }),
        None => match AppConfig::discover() {
            Ok(cfg) => cfg,
            Err(err) => {
                match &err {
                    ConfigError::Io { path, .. } | ConfigError::Parse { path, .. } => {
                        warn!(path = %path.display(), error = %err, "加载默认配置失败，使用内建默认值");
                    }
                    ConfigError::Context { .. } => {
                        warn!(error = %err, "加载默认配置失败，使用内建默认值");
                    }
                }
                AppConfig::default()
            }
        },
    }
}

fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_new(config.logging.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter);
    if subscriber.try_init().is_err() {
        // 已初始化，忽略
    }
}
