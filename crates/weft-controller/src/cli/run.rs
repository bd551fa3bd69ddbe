//! `weft run`: submit workflows, drive them to completion, print the result.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Args;
use tokio_util::sync::CancellationToken;
use weft_core::repository::workflow::WorkflowStore;
use weft_core::unit::UnitClient;
use weft_core::workflow::controller::Controller;
use weft_core::workflow::definition;
use weft_infra::memory::{ConfigMapRegistry, MemoryWorkflowStore, TemplateRegistry};
use weft_infra::unit::{ProcessUnitClient, SimulatedUnitClient};
use weft_types::config::ControllerConfig;
use weft_types::workflow::{Workflow, WorkflowKey, WorkflowPhase};

use super::render;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Args)]
pub struct RunArgs {
    /// Workflow manifests to submit.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Workflow template manifests available to `templateRef`.
    #[arg(short, long = "template")]
    pub templates: Vec<PathBuf>,

    /// Config map manifests (semaphore limits, artifact repositories).
    #[arg(long = "config-map")]
    pub config_maps: Vec<PathBuf>,

    /// Report every unit as succeeded instead of running its command.
    #[arg(long)]
    pub simulate: bool,

    /// Give up after this many seconds.
    #[arg(long)]
    pub timeout: Option<u64>,
}

pub async fn run(args: RunArgs, config: ControllerConfig, json: bool) -> anyhow::Result<()> {
    let templates = TemplateRegistry::new();
    for path in &args.templates {
        templates
            .load_file(path)
            .with_context(|| format!("loading template {}", path.display()))?;
    }
    let config_maps = ConfigMapRegistry::new();
    for path in &args.config_maps {
        let yaml = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        config_maps
            .insert_yaml(&yaml)
            .with_context(|| format!("loading config map {}", path.display()))?;
    }
    let workflows = args
        .files
        .iter()
        .map(|path| {
            definition::load_workflow_file(path)
                .with_context(|| format!("loading workflow {}", path.display()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let timeout = args.timeout.map(Duration::from_secs);
    tracing::info!(count = workflows.len(), simulate = args.simulate, "running workflows");
    let finished = if args.simulate {
        execute(SimulatedUnitClient::new(), templates, config_maps, config, workflows, timeout).await?
    } else {
        execute(ProcessUnitClient::new(), templates, config_maps, config, workflows, timeout).await?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&finished)?);
    } else {
        for workflow in &finished {
            render::print_workflow(workflow);
        }
    }

    let unsuccessful = finished
        .iter()
        .filter(|wf| wf.status.phase != WorkflowPhase::Succeeded)
        .count();
    if unsuccessful > 0 {
        bail!("{unsuccessful} of {} workflows did not succeed", finished.len());
    }
    Ok(())
}

async fn execute<U>(
    units: U,
    templates: TemplateRegistry,
    config_maps: ConfigMapRegistry,
    config: ControllerConfig,
    workflows: Vec<Workflow>,
    timeout: Option<Duration>,
) -> anyhow::Result<Vec<Workflow>>
where
    U: UnitClient + 'static,
{
    let store = Arc::new(MemoryWorkflowStore::new());
    let controller = Arc::new(Controller::new(
        Arc::clone(&store),
        Arc::new(units),
        Arc::new(templates),
        Arc::new(config_maps),
        config,
    ));

    let mut keys = Vec::with_capacity(workflows.len());
    for workflow in workflows {
        keys.push(controller.submit(workflow).await?.key());
    }

    let cancel = CancellationToken::new();
    for key in &keys {
        let mut watch = controller.events().watch(key.clone());
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = watch.recv() => match event {
                        Some(e) => tracing::info!(
                            workflow = %e.workflow,
                            reason = %e.reason,
                            message = %e.message,
                            "workflow event"
                        ),
                        None => break,
                    },
                }
            }
        });
    }
    let runner = tokio::spawn(Arc::clone(&controller).run(cancel.clone()));

    let waited = match timeout {
        Some(limit) => tokio::time::timeout(limit, wait_all(store.as_ref(), &keys))
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("workflows still running after {limit:?}"))),
        None => tokio::select! {
            done = wait_all(store.as_ref(), &keys) => done,
            _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("interrupted")),
        },
    };

    cancel.cancel();
    runner.await.context("controller task panicked")??;
    waited
}

/// Poll the store until every workflow is terminal.
async fn wait_all(store: &MemoryWorkflowStore, keys: &[WorkflowKey]) -> anyhow::Result<Vec<Workflow>> {
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    loop {
        interval.tick().await;
        let mut finished = Vec::with_capacity(keys.len());
        for key in keys {
            match store.get(key).await? {
                Some(wf) if wf.status.phase.is_terminal() => finished.push(wf),
                Some(_) => break,
                None => bail!("workflow {key} disappeared before completing"),
            }
        }
        if finished.len() == keys.len() {
            return Ok(finished);
        }
    }
}
