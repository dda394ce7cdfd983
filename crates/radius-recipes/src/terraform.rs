//! Terraform driver: materializes a working directory per invocation and
//! runs `init`/`apply`/`destroy` as supervised subprocesses.
//!
//! State handling is what makes retries and deletes idempotent: the state
//! file is captured into the secret store after every apply under a name
//! derived deterministically from the invocation identity, and restored into
//! the working directory before every run.

use std::{collections::BTreeMap, path::PathBuf, process::Stdio};

use serde_json::json;
use sha2::{Digest, Sha256};
use snafu::ResultExt;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::{
    DriverOutput, DriverRequest, RecipeDriver, RecipeError, StateSecretSnafu,
    WorkingDirectorySnafu, parse_recipe_result,
};
use radius_store::{SecretScope, SecretStore, SecretStoreError};
use std::sync::Arc;

const STATE_FILE: &str = "terraform.tfstate";
const MAIN_FILE: &str = "main.tf.json";

pub struct TerraformDriver {
    binary: PathBuf,
    root_dir: PathBuf,
    secrets: Arc<dyn SecretStore>,
}

impl TerraformDriver {
    pub fn new(binary: PathBuf, root_dir: PathBuf, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            binary,
            root_dir,
            secrets,
        }
    }

    /// The state secret name is a stable function of (environment,
    /// application, resource), so the same logical resource reuses its state
    /// across retries and two resources never share state.
    pub fn state_secret_name(request: &DriverRequest<'_>) -> String {
        let application = request
            .context
            .application
            .as_ref()
            .map(|application| application.id.to_string().to_ascii_lowercase())
            .unwrap_or_default();
        let key = format!(
            "{}|{application}|{}",
            request.context.environment.id.to_string().to_ascii_lowercase(),
            request.context.resource.id.to_string().to_ascii_lowercase(),
        );
        let digest = Sha256::digest(key.as_bytes());
        let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
        format!("tfstate-{}", &hex[..16])
    }

    fn state_scope(request: &DriverRequest<'_>) -> SecretScope {
        SecretScope::Resource(request.context.resource.id.clone())
    }

    /// The generated root module: a local backend, the recipe module and a
    /// sensitive `result` output mirroring the module's own.
    fn render_main(request: &DriverRequest<'_>) -> serde_json::Value {
        let mut module = serde_json::Map::new();
        module.insert(
            "source".to_owned(),
            json!(request.definition.template_path),
        );
        if let Some(version) = &request.definition.template_version {
            module.insert("version".to_owned(), json!(version));
        }
        for (key, value) in request.parameters {
            module.insert(key.clone(), value.clone());
        }
        module.insert("context".to_owned(), json!(request.context));

        json!({
            "terraform": {
                "backend": {"local": {"path": STATE_FILE}}
            },
            "module": {"result": module},
            "output": {
                "result": {
                    "value": "${module.result.result}",
                    "sensitive": true,
                }
            }
        })
    }

    async fn materialize(
        &self,
        request: &DriverRequest<'_>,
    ) -> Result<tempfile::TempDir, RecipeError> {
        tokio::fs::create_dir_all(&self.root_dir)
            .await
            .context(WorkingDirectorySnafu)?;
        let workdir = tempfile::Builder::new()
            .prefix("tf-recipe-")
            .tempdir_in(&self.root_dir)
            .context(WorkingDirectorySnafu)?;

        let main = serde_json::to_vec_pretty(&Self::render_main(request))
            .map_err(|error| RecipeError::InvalidResult {
                message: error.to_string(),
            })?;
        tokio::fs::write(workdir.path().join(MAIN_FILE), main)
            .await
            .context(WorkingDirectorySnafu)?;

        // Re-materialize prior state so retries and deletes see what the
        // last successful apply produced.
        match self
            .secrets
            .get_secret(&Self::state_scope(request), &Self::state_secret_name(request))
            .await
        {
            Ok(state) => {
                tokio::fs::write(workdir.path().join(STATE_FILE), state)
                    .await
                    .context(WorkingDirectorySnafu)?;
            }
            Err(SecretStoreError::NotFound { .. }) => {}
            Err(error) => return Err(RecipeError::StateSecret { source: error }),
        }

        Ok(workdir)
    }

    async fn run(
        &self,
        workdir: &std::path::Path,
        phase: &str,
        args: &[&str],
        cancellation: &CancellationToken,
    ) -> Result<String, RecipeError> {
        tracing::debug!(phase, ?args, "running terraform");
        let mut child = tokio::process::Command::new(&self.binary)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| RecipeError::TerraformUnavailable {
                message: format!("failed to spawn {}: {error}", self.binary.display()),
            })?;

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();

        let status = tokio::select! {
            () = cancellation.cancelled() => {
                let _ = child.kill().await;
                return Err(RecipeError::Cancelled);
            }
            result = async {
                if let Some(stdout) = stdout.as_mut() {
                    let _ = stdout.read_to_end(&mut stdout_buf).await;
                }
                if let Some(stderr) = stderr.as_mut() {
                    let _ = stderr.read_to_end(&mut stderr_buf).await;
                }
                child.wait().await
            } => result.map_err(|error| RecipeError::TerraformUnavailable {
                message: error.to_string(),
            })?,
        };

        if !status.success() {
            return Err(RecipeError::TerraformFailed {
                phase: phase.to_owned(),
                status: status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&stdout_buf).into_owned())
    }

    async fn capture_state(
        &self,
        workdir: &std::path::Path,
        request: &DriverRequest<'_>,
    ) -> Result<(), RecipeError> {
        match tokio::fs::read(workdir.join(STATE_FILE)).await {
            Ok(state) => self
                .secrets
                .put_secret(
                    &Self::state_scope(request),
                    &Self::state_secret_name(request),
                    &state,
                )
                .await
                .context(StateSecretSnafu),
            // No state file means the module created nothing stateful.
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(RecipeError::WorkingDirectory { source: error }),
        }
    }
}

#[async_trait::async_trait]
impl RecipeDriver for TerraformDriver {
    fn kind(&self) -> &'static str {
        "terraform"
    }

    async fn execute(&self, request: &DriverRequest<'_>) -> Result<DriverOutput, RecipeError> {
        let workdir = self.materialize(request).await?;
        let path = workdir.path();

        self.run(path, "init", &["init", "-no-color", "-input=false"], request.cancellation)
            .await?;
        let apply = self
            .run(
                path,
                "apply",
                &["apply", "-auto-approve", "-input=false", "-no-color"],
                request.cancellation,
            )
            .await;
        // State may have advanced even when apply failed; capture it either
        // way so cleanup can find partially created resources.
        self.capture_state(path, request).await?;
        apply?;

        let raw = self
            .run(
                path,
                "output",
                &["output", "-no-color", "-json", "result"],
                request.cancellation,
            )
            .await?;
        let value: serde_json::Value =
            serde_json::from_str(raw.trim()).map_err(|error| RecipeError::InvalidResult {
                message: format!("terraform output is not valid JSON: {error}"),
            })?;
        parse_recipe_result(&value)
    }

    async fn destroy(
        &self,
        request: &DriverRequest<'_>,
        _recorded: &[radius_resource::OutputResource],
    ) -> Result<(), RecipeError> {
        let workdir = self.materialize(request).await?;
        let path = workdir.path();

        self.run(path, "init", &["init", "-no-color", "-input=false"], request.cancellation)
            .await?;
        self.run(
            path,
            "destroy",
            &["destroy", "-auto-approve", "-input=false", "-no-color"],
            request.cancellation,
        )
        .await?;

        self.secrets
            .delete_secret(&Self::state_scope(request), &Self::state_secret_name(request))
            .await
            .context(StateSecretSnafu)?;
        Ok(())
    }
}
