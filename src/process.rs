#![forbid(unsafe_code)]

use async_trait::async_trait;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
#[error("service `{service}` failed: {reason}")]
pub struct ProcessError {
    pub service: String,
    pub reason: String,
}

impl ProcessError {
    pub fn new(service: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            service: service.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Running,
    Stopped,
    Unknown,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Running => "running",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub output: String,
}

/// Narrow surface over the container runtime. The orchestrator never talks to
/// containers except through this trait.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    async fn start(&self, services: &[String]) -> Result<(), ProcessError>;
    async fn status(&self, service: &str) -> Result<ServiceStatus, ProcessError>;
    async fn exec_in_service(
        &self,
        service: &str,
        command: &str,
    ) -> Result<ExecOutput, ProcessError>;
    async fn stop_all(&self) -> Result<(), ProcessError>;
    async fn logs(&self, services: &[String]) -> Result<(), ProcessError>;
}

/// `docker compose` backed implementation.
pub struct ComposeProcessManager {
    compose_file: String,
    project: Option<String>,
}

impl ComposeProcessManager {
    pub fn new(compose_file: impl Into<String>, project: Option<String>) -> Self {
        Self {
            compose_file: compose_file.into(),
            project,
        }
    }

    fn base_command(&self) -> Command {
        let mut command = Command::new("docker");
        command.arg("compose").arg("-f").arg(&self.compose_file);
        if let Some(project) = &self.project {
            command.arg("-p").arg(project);
        }
        command
    }

    async fn capture(
        &self,
        service: &str,
        mut command: Command,
    ) -> Result<ExecOutput, ProcessError> {
        let output = command
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| ProcessError::new(service, err))?;

        let mut rendered = String::from_utf8_lossy(&output.stdout).into_owned();
        rendered.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            output: rendered,
        })
    }

    async fn running_services(&self) -> Result<Vec<String>, ProcessError> {
        let mut command = self.base_command();
        command.args(["ps", "--services", "--status", "running"]);
        let result = self.capture("compose", command).await?;
        if result.exit_code != 0 {
            return Err(ProcessError::new("compose", result.output.trim()));
        }
        Ok(result
            .output
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }
}

#[async_trait]
impl ProcessManager for ComposeProcessManager {
    async fn start(&self, services: &[String]) -> Result<(), ProcessError> {
        if services.is_empty() {
            return Ok(());
        }

        let mut command = self.base_command();
        command.args(["up", "-d"]).args(services);
        let first = services[0].clone();
        let result = self.capture(&first, command).await?;
        if result.exit_code != 0 {
            return Err(ProcessError::new(first, result.output.trim()));
        }

        tracing::info!(services = services.join(","), "services started");
        Ok(())
    }

    async fn status(&self, service: &str) -> Result<ServiceStatus, ProcessError> {
        if self
            .running_services()
            .await?
            .iter()
            .any(|name| name == service)
        {
            return Ok(ServiceStatus::Running);
        }

        let mut command = self.base_command();
        command.args(["ps", "--services", "--all"]);
        let result = self.capture(service, command).await?;
        if result.exit_code != 0 {
            return Ok(ServiceStatus::Unknown);
        }

        if result.output.lines().any(|line| line.trim() == service) {
            Ok(ServiceStatus::Stopped)
        } else {
            Ok(ServiceStatus::Unknown)
        }
    }

    async fn exec_in_service(
        &self,
        service: &str,
        command_line: &str,
    ) -> Result<ExecOutput, ProcessError> {
        let mut command = self.base_command();
        command
            .args(["exec", "-T", service, "sh", "-c"])
            .arg(command_line);
        self.capture(service, command).await
    }

    async fn stop_all(&self) -> Result<(), ProcessError> {
        let mut command = self.base_command();
        command.arg("down");
        let result = self.capture("compose", command).await?;
        if result.exit_code != 0 {
            return Err(ProcessError::new("compose", result.output.trim()));
        }
        tracing::info!("services stopped");
        Ok(())
    }

    async fn logs(&self, services: &[String]) -> Result<(), ProcessError> {
        let mut command = self.base_command();
        command.args(["logs", "--tail", "100"]).args(services);

        let status = command
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|err| ProcessError::new("compose", err))?;

        if status.success() {
            Ok(())
        } else {
            Err(ProcessError::new(
                "compose",
                format!("logs exited with {status}"),
            ))
        }
    }
}

/// Runs a plan task on the host instead of inside a container.
pub async fn run_host_command(command_line: &str) -> Result<ExecOutput, ProcessError> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command_line)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|err| ProcessError::new("host", err))?;

    let mut rendered = String::from_utf8_lossy(&output.stdout).into_owned();
    rendered.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        output: rendered,
    })
}
