use std::env;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use tower_triage::{
    builtin, config, run_case, CaseRecord, Client, OpenAIConfig, Triage, TriageConfig, TriageError,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: triage <case.json> [config.toml]";

fn init_tracing(debug: bool) {
    let default = if debug { "tower_triage=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&str>) -> tower_triage::Result<TriageConfig> {
    match path {
        Some(p) => config::from_file(p),
        None => {
            let cfg = config::from_env();
            cfg.validate()?;
            Ok(cfg)
        }
    }
}

async fn run(case_path: &Path, cfg: TriageConfig) -> tower_triage::Result<String> {
    let raw = tokio::fs::read_to_string(case_path).await?;
    let case = CaseRecord::from_json_str(&raw)?;

    let client = Arc::new(Client::<OpenAIConfig>::new());
    let mut triage = Triage::builder(client)
        .config(&cfg)
        .tools(builtin::default_tools())
        .agents(builtin::default_agents())
        .build()?;

    let outcome = match cfg.run_timeout() {
        Some(limit) => tokio::time::timeout(limit, run_case(&mut triage, case))
            .await
            .map_err(|_| TriageError::Service(format!("run timed out after {limit:?}").into()))??,
        None => run_case(&mut triage, case).await?,
    };
    info!(stop = outcome.stop.label(), steps = outcome.steps(), "case routed");
    Ok(serde_json::to_string_pretty(&outcome)?)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let Some(case_path) = args.first() else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };

    let cfg = match load_config(args.get(1).map(String::as_str)) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };
    init_tracing(cfg.debug_mode);
    if cfg.mock_response.is_some() {
        info!("mock response configured; running offline");
    }

    match run(Path::new(case_path), cfg).await {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "triage failed");
            ExitCode::FAILURE
        }
    }
}
