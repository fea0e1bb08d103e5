use crate::account::AccountStatus;
use crate::audit::Actor;
use crate::error::Result;
use crate::tasks::{Orchestrator, Outcome, TaskRun, WorkflowRequest};

/// Run one workflow to completion and print its outcome.
pub async fn handle_workflow(orch: &Orchestrator, actor: &Actor, request: WorkflowRequest) -> Result<TaskRun> {
    let run = orch.run(request, actor).await?;
    print_run(&run);
    Ok(run)
}

pub async fn handle_bulk_check(orch: &Orchestrator, actor: &Actor, phones: Vec<String>) -> Result<()> {
    let phones = if phones.is_empty() {
        orch.sessions()
            .list_by_status(orch.storage(), AccountStatus::Active)?
            .into_iter()
            .map(|a| a.phone)
            .collect()
    } else {
        phones
    };
    println!("Checking {} accounts (this is paced and can take a while)...", phones.len());

    let mut progress = orch.subscribe_progress();
    let printer = tokio::spawn(async move {
        while let Ok(event) = progress.recv().await {
            println!("   {:>3}%  task {}", event.progress, event.task_id);
        }
    });
    let result = handle_workflow(orch, actor, WorkflowRequest::BulkCheck { phones }).await;
    printer.abort();

    let run = result?;
    if let Some(serde_json::Value::Object(results)) = &run.task.result {
        for (phone, value) in results {
            if phone == "outcome" {
                continue;
            }
            let status = value["status"].as_str().unwrap_or("?");
            println!("   {:<18} {}", phone, status);
        }
    }
    Ok(())
}

pub async fn handle_change_password(
    orch: &Orchestrator,
    actor: &Actor,
    phone: String,
    old_password: Option<String>,
    new_password: Option<String>,
    print_password: bool,
) -> Result<()> {
    let request = WorkflowRequest::ChangePassword { phone: phone.clone(), old_password, new_password };
    let run = handle_workflow(orch, actor, request).await?;
    if print_password && run.outcome.is_success() {
        if let Some(password) = orch.sessions().cloud_password(orch.storage(), &phone)? {
            println!("New password: {}", password);
        }
    }
    Ok(())
}

pub fn print_run(run: &TaskRun) {
    let marker = match &run.outcome {
        Outcome::Success { .. } => "✅",
        Outcome::Partial { .. } => "⚠️",
        Outcome::TwoFactorRequired { .. } | Outcome::CodeInvalid { .. } | Outcome::CodeExpired { .. } => "🔑",
        Outcome::RateLimited { .. } => "⏳",
        Outcome::Cancelled => "⏹",
        _ => "❌",
    };
    println!("{} {}", marker, run.outcome.message());
    println!("   Task: {} ({})", run.task.id, run.task.status);

    match &run.outcome {
        Outcome::Success { detail, .. } | Outcome::Partial { detail, .. } if !detail.is_null() => {
            if let Ok(pretty) = serde_json::to_string_pretty(detail) {
                println!("{}", pretty);
            }
        }
        Outcome::RateLimited { retry_at, .. } => println!("   Retry after: {}", retry_at),
        _ => {}
    }
}
