//! Daemon configuration, resolved once from the environment at startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::store::default_store_root;

/// Which generation backend the daemon wires at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    Mock,
    Local,
    Subprocess,
}

impl FromStr for RunnerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mock" => Ok(RunnerKind::Mock),
            "local" => Ok(RunnerKind::Local),
            "subprocess" => Ok(RunnerKind::Subprocess),
            other => bail!("unknown runner kind '{other}' (expected mock, local, or subprocess)"),
        }
    }
}

impl RunnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerKind::Mock => "mock",
            RunnerKind::Local => "local",
            RunnerKind::Subprocess => "subprocess",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub store_root: PathBuf,
    pub runner: RunnerKind,
    pub model_paths_file: Option<PathBuf>,
    pub engine_binary: Option<PathBuf>,
    pub force_cpu: bool,
    pub allow_fallback: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let api_host = std::env::var("MODELSERVE_HOST").unwrap_or_else(|_| "127.0.0.1".into());
        let api_port = std::env::var("MODELSERVE_PORT")
            .unwrap_or_else(|_| "11434".into())
            .parse()
            .context("MODELSERVE_PORT must be a port number")?;

        let runner: RunnerKind = std::env::var("MODELSERVE_RUNNER")
            .unwrap_or_else(|_| "subprocess".into())
            .parse()?;

        let model_paths_file = match std::env::var("MODEL_PATHS") {
            Ok(path) => Some(PathBuf::from(path)),
            Err(_) => {
                let default = PathBuf::from("config/model-paths.json");
                default.exists().then_some(default)
            }
        };

        let engine_binary = match std::env::var("ENGINE_BIN") {
            Ok(bin) => Some(PathBuf::from(bin)),
            Err(_) => which::which("llama-cli").ok(),
        };
        if runner == RunnerKind::Subprocess && engine_binary.is_none() {
            bail!(
                "subprocess runner needs a generation binary: set ENGINE_BIN or put llama-cli on PATH"
            );
        }

        Ok(Self {
            api_host,
            api_port,
            store_root: default_store_root(),
            runner,
            model_paths_file,
            engine_binary,
            force_cpu: env_flag("FORCE_CPU"),
            allow_fallback: !env_flag("MODELSERVE_NO_FALLBACK"),
        })
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.api_host, self.api_port))
    }

    pub fn print_config(&self) {
        info!("Current configuration:");
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Store root: {}", self.store_root.display());
        info!("- Runner: {}", self.runner.as_str());
        if let Some(paths) = &self.model_paths_file {
            info!("- Model paths: {}", paths.display());
        }
        if let Some(binary) = &self.engine_binary {
            info!("- Engine binary: {}", binary.display());
        }
        info!("- Force CPU: {}", self.force_cpu);
        info!("- GPU fallback: {}", self.allow_fallback);
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            api_host: "127.0.0.1".to_string(),
            api_port: 11434,
            store_root: PathBuf::from("/tmp/modelserve"),
            runner: RunnerKind::Mock,
            model_paths_file: None,
            engine_binary: None,
            force_cpu: false,
            allow_fallback: true,
        }
    }

    #[test]
    fn api_addr_parses_host_and_port() {
        let config = test_config();
        let addr = config.api_addr().unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_eq!(addr.port(), 11434);
    }

    #[test]
    fn api_addr_with_all_interfaces() {
        let mut config = test_config();
        config.api_host = "0.0.0.0".to_string();
        config.api_port = 8080;

        let addr = config.api_addr().unwrap();
        assert_eq!(addr.ip().to_string(), "0.0.0.0");
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn runner_kind_parses_known_values() {
        assert_eq!("mock".parse::<RunnerKind>().unwrap(), RunnerKind::Mock);
        assert_eq!("local".parse::<RunnerKind>().unwrap(), RunnerKind::Local);
        assert_eq!(
            "subprocess".parse::<RunnerKind>().unwrap(),
            RunnerKind::Subprocess
        );
        assert!("python".parse::<RunnerKind>().is_err());
    }
}
