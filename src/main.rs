use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use custodian::audit::Actor;
use custodian::cli::{self, Cli, Commands};
use custodian::client::RpcBridgeFactory;
use custodian::config::CustodianConfig;
use custodian::error::{CustodianError, Result};
use custodian::storage::Storage;
use custodian::tasks::{CancelToken, EnrollRequest, Orchestrator, Scheduler, TokioPacer, VerifyCredential, WorkflowRequest};
use custodian::vault::Vault;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Commands::GenKey = cli.command {
        cli::keys::handle_gen_key();
        return;
    }

    let config = CustodianConfig::load_or_default(&cli.config);
    // RUST_LOG wins over [logging] level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(cli, config).await {
        error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn build_orchestrator(config: CustodianConfig) -> Result<Orchestrator> {
    let key = config.vault.resolve_master_key()?;
    let vault = Arc::new(Vault::from_config_key(&key));
    let storage = Storage::open(&config.storage.path)?;
    let factory = RpcBridgeFactory::new(
        config.platform.bridge_url.clone(),
        Duration::from_secs(config.platform.request_timeout_secs),
    )
    .map_err(|e| CustodianError::Config(e.to_string()))?;
    Ok(Orchestrator::new(storage, vault, Arc::new(factory), Arc::new(TokioPacer), Arc::new(config)))
}

async fn run(cli: Cli, config: CustodianConfig) -> Result<()> {
    let orch = Arc::new(build_orchestrator(config)?);
    let mut actor = Actor::new(cli.operator);
    if let Some(ip) = cli.ip {
        actor = actor.with_ip(ip);
    }

    match cli.command {
        Commands::GenKey => cli::keys::handle_gen_key(),
        Commands::Enroll { phone, employee_id, employee_name, recovery_email, note, proxy } => {
            let request = EnrollRequest { phone, employee_id, employee_name, recovery_email, note, proxy };
            cli::ops::handle_workflow(&orch, &actor, WorkflowRequest::Enroll(request)).await?;
        }
        Commands::Verify { phone, code, password } => {
            let credential = match (code, password) {
                (Some(code), _) => VerifyCredential::Code(code),
                (None, Some(password)) => VerifyCredential::Password(password),
                (None, None) => return Err(CustodianError::InvalidState("supply --code or --password".to_string())),
            };
            cli::ops::handle_workflow(&orch, &actor, WorkflowRequest::Verify { phone, credential }).await?;
        }
        Commands::Check { phone } => {
            cli::ops::handle_workflow(&orch, &actor, WorkflowRequest::Check { phone }).await?;
        }
        Commands::BulkCheck { phones } => cli::ops::handle_bulk_check(&orch, &actor, phones).await?,
        Commands::ChangePassword { phone, old_password, new_password, print_password } => {
            cli::ops::handle_change_password(&orch, &actor, phone, old_password, new_password, print_password).await?;
        }
        Commands::Reclaim { phone, two_factor_password } => {
            let request = WorkflowRequest::Reclaim { phone, two_factor_password };
            cli::ops::handle_workflow(&orch, &actor, request).await?;
        }
        Commands::Reauthorize { phone } => {
            cli::ops::handle_workflow(&orch, &actor, WorkflowRequest::Reauthorize { phone }).await?;
        }
        Commands::Suspend { phone } => {
            cli::ops::handle_workflow(&orch, &actor, WorkflowRequest::Suspend { phone }).await?;
        }
        Commands::Accounts { status } => cli::accounts::handle_accounts(&orch, status)?,
        Commands::Show { phone } => cli::accounts::handle_show(&orch, &phone)?,
        Commands::Audit { phone, limit } => cli::accounts::handle_audit(&orch, phone.as_deref(), limit)?,
        Commands::Tasks { cmd } => cli::tasks::handle_task_command(&orch, cmd)?,
        Commands::Serve => serve(orch).await?,
    }
    Ok(())
}

async fn serve(orch: Arc<Orchestrator>) -> Result<()> {
    let cancel = CancelToken::new();
    let scheduler = Scheduler::new(orch.clone(), cancel.clone());
    let daemon = tokio::spawn(scheduler.start());
    info!("Custodian daemon running. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| CustodianError::InvalidState(format!("cannot listen for Ctrl-C: {}", e)))?;
    info!("Shutdown requested");
    cancel.cancel();
    if let Err(e) = daemon.await {
        error!("Scheduler ended abnormally: {}", e);
    }
    orch.storage().flush()?;
    Ok(())
}
