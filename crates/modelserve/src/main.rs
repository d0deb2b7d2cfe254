use std::collections::HashMap;
use std::sync::Arc;

use modelserve::runner::local::LocalRunner;
use modelserve::runner::mock::MockRunner;
use modelserve::runner::paths::load_model_paths;
use modelserve::runner::subprocess::SubprocessRunner;
use modelserve::store::FileModelStore;
use modelserve::{ApiServer, Config, ModelRunner, RunnerKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    modelserve::telemetry::init_tracing();

    let cfg = Config::from_env()?;
    cfg.print_config();

    let store = Arc::new(FileModelStore::new(&cfg.store_root)?);

    let model_paths = match &cfg.model_paths_file {
        Some(path) => load_model_paths(path)?,
        None => HashMap::new(),
    };

    let runner: Arc<dyn ModelRunner> = match cfg.runner {
        RunnerKind::Mock => Arc::new(MockRunner::new(vec!["hello", " from", " mock", " runner"])),
        RunnerKind::Local => Arc::new(LocalRunner::new(model_paths)),
        RunnerKind::Subprocess => {
            let Some(binary) = cfg.engine_binary.clone() else {
                anyhow::bail!("subprocess runner needs a generation binary (ENGINE_BIN)");
            };
            Arc::new(
                SubprocessRunner::new(binary, model_paths)
                    .force_cpu(cfg.force_cpu)
                    .allow_fallback(cfg.allow_fallback),
            )
        }
    };

    ApiServer::new(runner, store).run(cfg.api_addr()?).await
}
