//! Runs execution units as local processes.
//!
//! The container image is not pulled or isolated: `command` followed by
//! `args` is executed directly on the host. Standard output becomes the
//! unit's `result`; output parameters with a `valueFrom.path` are read from
//! that path once the process exits.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use weft_core::unit::UnitClient;
use weft_types::error::UnitError;
use weft_types::unit::{UnitPhase, UnitRequest, UnitStatus};
use weft_types::workflow::{Parameter, WorkflowKey};

use super::table::{UnitTable, terminated};

#[derive(Clone)]
pub struct ProcessUnitClient {
    table: Arc<UnitTable>,
}

impl ProcessUnitClient {
    pub fn new() -> Self {
        Self {
            table: Arc::new(UnitTable::new()),
        }
    }
}

impl Default for ProcessUnitClient {
    fn default() -> Self {
        Self::new()
    }
}

/// The argv a unit runs: `command` then `args`, or `args` alone.
fn argv(request: &UnitRequest) -> Result<(String, Vec<String>), UnitError> {
    let mut words = request
        .container
        .command
        .iter()
        .chain(&request.container.args)
        .cloned();
    let program = words.next().ok_or_else(|| UnitError::Rejected {
        name: request.name.clone(),
        reason: "container has neither command nor args".to_string(),
    })?;
    Ok((program, words.collect()))
}

async fn collect_parameters(declared: &[Parameter]) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for param in declared {
        let Some(path) = param.value_from.as_ref().and_then(|v| v.path.as_deref()) else {
            continue;
        };
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                values.insert(param.name.clone(), content.trim_end().to_string());
            }
            Err(e) => tracing::debug!(parameter = %param.name, path, error = %e, "output parameter not readable"),
        }
    }
    values
}

async fn supervise(
    table: Arc<UnitTable>,
    name: String,
    child: tokio::process::Child,
    outputs: Vec<Parameter>,
    cancel: CancellationToken,
) {
    let status = tokio::select! {
        output = child.wait_with_output() => match output {
            Ok(output) => {
                let code = output.status.code().unwrap_or(-1);
                let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
                UnitStatus {
                    phase: if output.status.success() { UnitPhase::Succeeded } else { UnitPhase::Failed },
                    exit_code: Some(code),
                    result: (!stdout.is_empty()).then_some(stdout),
                    parameters: collect_parameters(&outputs).await,
                    ..Default::default()
                }
            }
            Err(e) => UnitStatus {
                phase: UnitPhase::Error,
                message: Some(format!("failed waiting for process: {e}")),
                ..Default::default()
            },
        },
        // Dropping the wait future drops the child, which kills it.
        _ = cancel.cancelled() => terminated(),
    };
    tracing::debug!(unit = %name, phase = ?status.phase, exit_code = ?status.exit_code, "unit process finished");
    table.finish(&name, status);
}

impl UnitClient for ProcessUnitClient {
    async fn create(&self, request: &UnitRequest) -> Result<(), UnitError> {
        let (program, args) = argv(request)?;
        let Some(cancel) = self.table.start(request) else {
            return Ok(());
        };

        let spawned = Command::new(&program)
            .args(&args)
            .envs(&request.container.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let message = format!("failed to start '{program}': {e}");
                tracing::warn!(unit = %request.name, %message, "unit process did not start");
                self.table.finish(
                    &request.name,
                    UnitStatus {
                        phase: UnitPhase::Error,
                        message: Some(message),
                        ..Default::default()
                    },
                );
                return Ok(());
            }
        };

        tracing::info!(unit = %request.name, image = %request.container.image, %program, "unit process started");
        tokio::spawn(supervise(
            Arc::clone(&self.table),
            request.name.clone(),
            child,
            request.output_parameters.clone(),
            cancel,
        ));
        Ok(())
    }

    async fn terminate(&self, name: &str) -> Result<(), UnitError> {
        self.table.terminate(name);
        Ok(())
    }

    async fn list(&self, workflow: &WorkflowKey) -> Result<Vec<UnitStatus>, UnitError> {
        Ok(self.table.list(workflow))
    }

    async fn remove_workflow(&self, workflow: &WorkflowKey) -> Result<(), UnitError> {
        self.table.remove_workflow(workflow);
        Ok(())
    }

    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowKey> {
        self.table.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use weft_types::workflow::{Container, ValueFrom};

    fn request(name: &str, command: &[&str]) -> UnitRequest {
        UnitRequest {
            name: name.to_string(),
            workflow: WorkflowKey::new("weft", "local"),
            node_name: name.to_string(),
            container: Container {
                image: "local".into(),
                command: command.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            input_artifacts: Vec::new(),
            output_artifacts: Vec::new(),
            output_parameters: Vec::new(),
        }
    }

    async fn wait_final(client: &ProcessUnitClient, name: &str) -> UnitStatus {
        let workflow = WorkflowKey::new("weft", "local");
        for _ in 0..200 {
            let status = client
                .list(&workflow)
                .await
                .unwrap()
                .into_iter()
                .find(|s| s.name == name)
                .unwrap();
            if status.phase != UnitPhase::Running {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("unit {name} never finished");
    }

    #[tokio::test]
    async fn stdout_becomes_the_result() {
        let client = ProcessUnitClient::new();
        client.create(&request("echo", &["sh", "-c", "echo hello"])).await.unwrap();

        let status = wait_final(&client, "echo").await;
        assert_eq!(status.phase, UnitPhase::Succeeded);
        assert_eq!(status.exit_code, Some(0));
        assert_eq!(status.result.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_fails_without_message() {
        let client = ProcessUnitClient::new();
        client.create(&request("boom", &["sh", "-c", "exit 3"])).await.unwrap();

        let status = wait_final(&client, "boom").await;
        assert_eq!(status.phase, UnitPhase::Failed);
        assert_eq!(status.exit_code, Some(3));
        assert!(status.message.is_none());
    }

    #[tokio::test]
    async fn missing_program_is_an_error_with_message() {
        let client = ProcessUnitClient::new();
        client
            .create(&request("nothing", &["/definitely/not/a/program"]))
            .await
            .unwrap();

        let status = wait_final(&client, "nothing").await;
        assert_eq!(status.phase, UnitPhase::Error);
        assert!(status.message.unwrap().contains("failed to start"));
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let client = ProcessUnitClient::new();
        let err = client.create(&request("empty", &[])).await.unwrap_err();
        assert!(matches!(err, UnitError::Rejected { .. }));
    }

    #[tokio::test]
    async fn terminate_stops_a_running_process() {
        let client = ProcessUnitClient::new();
        let mut changes = client.subscribe();
        client.create(&request("sleepy", &["sleep", "30"])).await.unwrap();
        assert_eq!(changes.recv().await.unwrap().name, "local");

        client.terminate("sleepy").await.unwrap();
        let status = wait_final(&client, "sleepy").await;
        assert_eq!(status.phase, UnitPhase::Failed);
        assert_eq!(status.message.as_deref(), Some("terminated"));
    }

    #[tokio::test]
    async fn output_parameters_are_read_from_their_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("answer");
        let script = format!("echo 42 > {}", path.display());
        let mut req = request("param", &["sh", "-c", &script]);
        req.output_parameters.push(Parameter {
            name: "answer".into(),
            value_from: Some(ValueFrom {
                path: Some(path.display().to_string()),
            }),
            ..Default::default()
        });

        let client = ProcessUnitClient::new();
        client.create(&req).await.unwrap();
        let status = wait_final(&client, "param").await;
        assert_eq!(status.parameters.get("answer").map(String::as_str), Some("42"));
    }
}
