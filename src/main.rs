use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use colabctl::auth::{CachedTokenProvider, TokenProvider};
use colabctl::cli::{AppContext, Cli};
use colabctl::colab::api_client::ColabApiClient;
use colabctl::config::{self, Config};
use colabctl::connection_pool::ConnectionPool;
use colabctl::history::HistoryStore;
use colabctl::runtime_manager::RuntimeManager;
use colabctl::session_manager::SessionManager;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("colabctl: {err}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<i32, colabctl::Error> {
    let cli = Cli::parse();

    let config_dir = match &cli.config {
        Some(path) => path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| config::config_dir().unwrap_or_default()),
        None => config::config_dir()?,
    };
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config::config_path(&config_dir));
    let config = Config::load_or_init(&config_path)?;

    let logs_dir = config::logs_dir(&config_dir);
    let _logging =
        colabctl::logging::init(&logs_dir).map_err(|err| colabctl::Error::io(logs_dir.display().to_string(), err))?;

    let token_provider: Arc<dyn TokenProvider> =
        Arc::new(CachedTokenProvider::new(config::oauth_session_path(&config_dir)));
    let access_token = token_provider.access_token().await?;

    let api = ColabApiClient::new(config.colab_api_base_url.clone(), access_token);
    let pool = ConnectionPool::init();

    if let Ok(ccu) = api.get_ccu_info().await {
        pool.set_tier(colabctl::colab::Tier::from_eligible_gpus(&ccu.eligible_gpus)).await;
    }

    let session_manager = SessionManager::new(
        config::sessions_path(&config_dir),
        RuntimeManager::new(api.clone(), config.notebook_hash.clone()),
        api.clone(),
        pool.clone(),
    );
    let runtime_manager = RuntimeManager::new(api, config.notebook_hash.clone());
    let history = HistoryStore::new(config::history_path(&config_dir));

    let ctx = AppContext {
        session_manager,
        runtime_manager,
        pool: pool.clone(),
        history,
        account: token_provider,
        json: cli.json,
    };

    let result = colabctl::cli::dispatch(cli, ctx).await;
    pool.shutdown().await;

    result.map_err(|err| {
        error!(%err, "command failed");
        err
    })
}
