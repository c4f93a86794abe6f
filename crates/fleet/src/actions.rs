//! Per-node remote actions.
//!
//! Each function is one executor action: it opens its own session, runs
//! its steps strictly in order and stops at the first failure. Container
//! management goes through `docker compose -f docker-compose.json` inside
//! the node's `deploy_path`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::ClusterConfig;
use crate::error::NodeError;
use crate::manifest::{self, Manifest, ManifestError, MANIFEST_FILE};
use crate::model::NodeSpec;
use crate::transport::{shell_quote, RemoteShell, RemoteTransport};

const COMPOSE: &str = "docker compose -f docker-compose.json";
const RUNNING: &str = "running";
const PENDING_DIR: &str = ".pending";

/// Everything an action needs besides the node itself.
#[derive(Clone)]
pub struct ActionContext {
    pub transport: Arc<dyn RemoteTransport>,
    pub cluster: Arc<ClusterConfig>,
}

impl ActionContext {
    async fn shell(&self, node: &NodeSpec) -> Result<RemoteShell, NodeError> {
        RemoteShell::open(self.transport.as_ref(), node).await
    }

    fn image(&self, tag: &str) -> String {
        format!("{}:{}", self.cluster.image, tag)
    }

    fn stage_dir(&self, node: &NodeSpec) -> PathBuf {
        self.cluster.node_dir(&node.name)
    }

    /// Scratch directory for a manifest not yet live on the host. Kept out
    /// of the staging directory, which `deploy` uploads whole.
    fn pending_dir(&self, node: &NodeSpec) -> PathBuf {
        self.cluster.workdir.join(PENDING_DIR).join(&node.name)
    }
}

fn remote_tmp(node: &NodeSpec) -> String {
    format!("/tmp/{}", node.name)
}

// ════════════════════════════════════════════════════════════════════════════════
// DEPLOY / UPDATE
// ════════════════════════════════════════════════════════════════════════════════

/// Fresh deployment from the node's staged directory.
///
/// Wipes the remote chain data, copies the staged files into `deploy_path`,
/// pulls the images and brings the services up.
pub async fn deploy(ctx: &ActionContext, node: &NodeSpec) -> Result<String, NodeError> {
    let stage = ctx.stage_dir(node);
    if !stage.join(MANIFEST_FILE).is_file() {
        return Err(NodeError::Precondition(format!(
            "{} has no staged manifest",
            stage.display()
        )));
    }

    let shell = ctx.shell(node).await?;
    let path = shell_quote(&node.deploy_path);
    let tmp = remote_tmp(node);

    shell.sudo(&format!("rm -rf {}/data", path)).await?;
    shell
        .sudo(&format!("mkdir -p {p}/log && chmod 777 {p}/log", p = path))
        .await?;
    shell.run(&format!("rm -rf {}", shell_quote(&tmp))).await?;
    shell.upload(&stage, &tmp, true).await?;
    shell
        .sudo(&format!("cp -r {}/. {}", shell_quote(&tmp), path))
        .await?;

    let image = ctx.image(&node.image_tag);
    if let Some(staking) = node.role.staking() {
        shell
            .sudo(&format!("docker pull {}", shell_quote(&ctx.image(&staking.image_tag))))
            .await?;
    }
    shell.sudo(&format!("docker pull {}", shell_quote(&image))).await?;
    shell
        .sudo_in(&node.deploy_path, &format!("{} up -d", COMPOSE))
        .await?;

    Ok(format!("deployed {}", image))
}

/// Swaps the node's image for `tag` without touching chain data.
///
/// The prior manifest comes from the local staging directory, or from the
/// host when it is missing locally. The new manifest is uploaded before the
/// remote one is touched, and the remote copy is kept as `.bak` until the
/// services are recreated. On any failure after that point the backup is
/// copied back, and the staged manifest keeps the prior content.
pub async fn update(ctx: &ActionContext, node: &NodeSpec, tag: &str) -> Result<String, NodeError> {
    let stage = ctx.stage_dir(node);
    let shell = ctx.shell(node).await?;
    let remote_manifest = format!("{}/{}", node.deploy_path, MANIFEST_FILE);

    let prior = match Manifest::load(&stage) {
        Ok(m) => m,
        Err(ManifestError::Missing(_)) => {
            std::fs::create_dir_all(&stage)
                .map_err(|e| NodeError::Artifact(format!("{}: {}", stage.display(), e)))?;
            shell
                .download(&remote_manifest, &stage.join(MANIFEST_FILE))
                .await
                .map_err(|e| NodeError::Artifact(format!("no prior manifest: {}", e)))?;
            Manifest::load(&stage)?
        }
        Err(e) => return Err(e.into()),
    };

    let updated = manifest::update(&prior, &ctx.cluster.image, tag)?;
    let pending = ctx.pending_dir(node);
    updated.save(&pending)?;

    let image = ctx.image(tag);
    let result = swap_manifest(&shell, node, &pending, &remote_manifest, &image).await;
    discard_pending(&pending);
    result?;

    updated.save(&stage)?;
    Ok(format!("updated to {}", image))
}

/// Uploads the pending manifest, backs up the deployed one and recreates
/// the services. Restores the backup if anything after it fails.
async fn swap_manifest(
    shell: &RemoteShell,
    node: &NodeSpec,
    pending: &Path,
    remote_manifest: &str,
    image: &str,
) -> Result<(), NodeError> {
    let tmp = format!("{}-{}", remote_tmp(node), MANIFEST_FILE);
    let quoted = shell_quote(remote_manifest);

    shell.upload(&pending.join(MANIFEST_FILE), &tmp, false).await?;
    shell.sudo(&format!("cp -p {m} {m}.bak", m = quoted)).await?;

    let swapped = async {
        shell
            .sudo(&format!("cp {} {}", shell_quote(&tmp), quoted))
            .await?;
        shell.sudo(&format!("docker pull {}", shell_quote(image))).await?;
        shell
            .sudo_in(&node.deploy_path, &format!("{} up -d --force-recreate", COMPOSE))
            .await?;
        Ok::<(), NodeError>(())
    }
    .await;

    if let Err(e) = swapped {
        match shell.sudo(&format!("cp -p {m}.bak {m}", m = quoted)).await {
            Ok(_) => warn!(node = %node.label(), "update failed, prior manifest restored"),
            Err(restore) => {
                warn!(node = %node.label(), error = %restore, "prior manifest could not be restored")
            }
        }
        return Err(e);
    }
    Ok(())
}

fn discard_pending(pending: &Path) {
    if let Err(e) = std::fs::remove_dir_all(pending) {
        debug!(dir = %pending.display(), error = %e, "pending manifest not removed");
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// START / STOP / REMOVE / STATUS
// ════════════════════════════════════════════════════════════════════════════════

/// `start` or `stop` the node's services.
pub async fn compose(ctx: &ActionContext, node: &NodeSpec, verb: &str) -> Result<String, NodeError> {
    let shell = ctx.shell(node).await?;
    shell
        .sudo_in(&node.deploy_path, &format!("{} {}", COMPOSE, verb))
        .await?;
    Ok(format!("{} issued", verb))
}

/// Takes the services down and deletes `deploy_path`.
pub async fn remove(ctx: &ActionContext, node: &NodeSpec) -> Result<String, NodeError> {
    let shell = ctx.shell(node).await?;
    shell
        .sudo_in(&node.deploy_path, &format!("{} down", COMPOSE))
        .await?;
    shell
        .sudo(&format!("rm -rf {}", shell_quote(&node.deploy_path)))
        .await?;
    Ok("removed".to_string())
}

/// Container state; succeeds only when it is `running`.
pub async fn status(ctx: &ActionContext, node: &NodeSpec) -> Result<String, NodeError> {
    let shell = ctx.shell(node).await?;
    let command = format!(
        "docker inspect -f '{{{{.State.Status}}}}' {}",
        shell_quote(node.container_name())
    );
    let state = match shell.query(&command).await {
        Ok(state) => state.trim().to_string(),
        Err(NodeError::RemoteExit { stderr, .. }) if stderr.contains("No such") => {
            return Err(NodeError::NotRunning("not exist".to_string()))
        }
        Err(e) => return Err(e),
    };
    if state == RUNNING {
        Ok(state)
    } else if state.is_empty() {
        Err(NodeError::NotRunning("unknown".to_string()))
    } else {
        Err(NodeError::NotRunning(state))
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// RUNTIME
// ════════════════════════════════════════════════════════════════════════════════

/// Installs the container runtime and adds the login user to its group.
pub async fn install_runtime(ctx: &ActionContext, node: &NodeSpec) -> Result<String, NodeError> {
    let shell = ctx.shell(node).await?;
    let script = "/tmp/install-runtime.sh";
    shell
        .run(&format!(
            "curl -fsSL {} -o {}",
            shell_quote(&ctx.cluster.runtime_install_url),
            script
        ))
        .await?;
    shell.sudo(&format!("sh {}", script)).await?;
    shell
        .sudo(&format!("gpasswd -a {} docker", shell_quote(&node.user)))
        .await?;
    let version = shell.query("docker --version").await?;
    Ok(if version.is_empty() { "installed".to_string() } else { version })
}

pub async fn restart_runtime(ctx: &ActionContext, node: &NodeSpec) -> Result<String, NodeError> {
    let shell = ctx.shell(node).await?;
    shell.sudo("systemctl restart docker").await?;
    Ok("runtime restarted".to_string())
}

/// Runtime and compose plugin versions, `docker <v> / compose <v>`.
pub async fn runtime_versions(ctx: &ActionContext, node: &NodeSpec) -> Result<String, NodeError> {
    let shell = ctx.shell(node).await?;
    let docker = shell.query("docker --version").await?;
    let compose = shell.query("docker compose version").await?;
    if docker.is_empty() {
        return Err(NodeError::EmptyResponse("docker --version".to_string()));
    }
    Ok(format!("{} / {}", docker, compose))
}

/// Full `df -h` output of the host.
pub async fn disk_usage(ctx: &ActionContext, node: &NodeSpec) -> Result<String, NodeError> {
    let shell = ctx.shell(node).await?;
    let output = shell.run("df -h").await?;
    Ok(output.stdout.join("\n"))
}

// ════════════════════════════════════════════════════════════════════════════════
// QUERIES
// ════════════════════════════════════════════════════════════════════════════════

/// Evaluates `expression` in the node's client console.
pub async fn attach_query(ctx: &ActionContext, node: &NodeSpec, expression: &str) -> Result<String, NodeError> {
    let shell = ctx.shell(node).await?;
    let command = format!(
        "docker exec {} {} attach ws://127.0.0.1:{} --exec {}",
        shell_quote(node.container_name()),
        shell_quote(&ctx.cluster.client_binary),
        node.ws_port,
        shell_quote(expression)
    );
    shell.query(&command).await
}

pub async fn block_number(ctx: &ActionContext, node: &NodeSpec) -> Result<String, NodeError> {
    let expression = format!("{}.blockNumber", ctx.cluster.chain_namespace);
    attach_query(ctx, node, &expression).await
}

pub async fn peer_count(ctx: &ActionContext, node: &NodeSpec) -> Result<String, NodeError> {
    attach_query(ctx, node, "net.peerCount").await
}

/// First account of the node's client.
pub async fn account(ctx: &ActionContext, node: &NodeSpec) -> Result<String, NodeError> {
    let expression = format!("{}.accounts", ctx.cluster.chain_namespace);
    let raw = attach_query(ctx, node, &expression).await?;
    first_account(&raw).ok_or(NodeError::EmptyResponse(expression))
}

/// `["0xab..", "0xcd.."]` -> `0xab..`
fn first_account(raw: &str) -> Option<String> {
    let inner = raw.trim().trim_start_matches('[').trim_end_matches(']');
    inner
        .split(',')
        .next()
        .map(|a| a.trim().trim_matches('"').to_string())
        .filter(|a| !a.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::node;
    use crate::model::Role;
    use crate::transport::{CommandOutput, MockTransport};

    fn ctx(mock: &MockTransport, workdir: &std::path::Path) -> ActionContext {
        ActionContext {
            transport: Arc::new(mock.clone()),
            cluster: Arc::new(ClusterConfig {
                workdir: workdir.to_path_buf(),
                image: "img".into(),
                ..ClusterConfig::default()
            }),
        }
    }

    #[tokio::test]
    async fn status_requires_running_state() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mock = MockTransport::healthy();
        mock.respond_on("h2", "docker inspect", CommandOutput::ok(&["exited"]));
        mock.respond_on("h3", "docker inspect", CommandOutput::failed(1, "Error: No such object: c"));
        let c = ctx(&mock, tmp.path());

        let ok = status(&c, &node("a", "h1", Role::validator(), 0)).await;
        assert_eq!(ok, Ok("running".to_string()));
        let exited = status(&c, &node("b", "h2", Role::validator(), 0)).await;
        assert_eq!(exited, Err(NodeError::NotRunning("exited".into())));
        let missing = status(&c, &node("c", "h3", Role::validator(), 0)).await;
        assert_eq!(missing, Err(NodeError::NotRunning("not exist".into())));
    }

    #[tokio::test]
    async fn status_command_inspects_container_by_name() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mock = MockTransport::healthy();
        let c = ctx(&mock, tmp.path());
        status(&c, &node("val-1", "h1", Role::validator(), 0)).await.expect("status");
        let execs = mock.executions("h1");
        assert!(execs[0].0.contains("{{.State.Status}}"));
        assert!(execs[0].0.contains("val-1"));
    }

    #[tokio::test]
    async fn deploy_without_stage_is_precondition_failure() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mock = MockTransport::healthy();
        let err = deploy(&ctx(&mock, tmp.path()), &node("a", "h1", Role::validator(), 0))
            .await
            .expect_err("no stage");
        assert!(matches!(err, NodeError::Precondition(_)));
        assert!(mock.calls().is_empty(), "no remote call before the precondition holds");
    }

    #[tokio::test]
    async fn update_without_any_prior_manifest_is_artifact_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mock = MockTransport::healthy();
        let err = update(&ctx(&mock, tmp.path()), &node("a", "h1", Role::validator(), 0), "v2")
            .await
            .expect_err("no manifest");
        assert!(matches!(err, NodeError::Artifact(_)));
    }

    #[tokio::test]
    async fn update_falls_back_to_remote_manifest() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mock = MockTransport::healthy();
        let n = node("a", "h1", Role::validator(), 0);
        let prior = serde_json::json!({
            "services": { "node": { "image": "img:v1", "environment": { "INIT": "true", "P2PPORT": 1 } } }
        });
        mock.serve_file(
            "h1",
            &format!("{}/docker-compose.json", n.deploy_path),
            prior.to_string().as_bytes(),
        );

        let out = update(&ctx(&mock, tmp.path()), &n, "v2").await.expect("update");
        assert_eq!(out, "updated to img:v2");
        let saved = Manifest::load(&tmp.path().join("a")).expect("saved");
        assert_eq!(saved.image(), Some("img:v2"));
        assert!(saved.env("INIT").is_none());
        assert!(mock
            .executions("h1")
            .iter()
            .any(|(c, _)| c.contains("up -d --force-recreate")));
    }

    fn stage_v1(workdir: &std::path::Path, name: &str) {
        let prior = serde_json::json!({
            "services": { "node": { "image": "img:v1", "environment": { "P2PPORT": 1 } } }
        });
        Manifest::from_value(prior)
            .expect("manifest")
            .save(&workdir.join(name))
            .expect("stage");
    }

    fn position(execs: &[(String, Option<String>)], needle: &str) -> Option<usize> {
        execs.iter().position(|(c, _)| c.contains(needle))
    }

    #[tokio::test]
    async fn failed_manifest_swap_restores_backup() {
        let tmp = tempfile::tempdir().expect("tempdir");
        stage_v1(tmp.path(), "a");
        let mock = MockTransport::healthy();
        mock.respond_on(
            "h1",
            "cp /tmp/a-docker-compose.json",
            CommandOutput::failed(1, "cp: cannot create regular file: No space left on device"),
        );
        let c = ctx(&mock, tmp.path());
        let n = node("a", "h1", Role::validator(), 0);

        let err = update(&c, &n, "v2").await.expect_err("swap fails");
        assert!(matches!(err, NodeError::RemoteExit { .. }));

        let execs = mock.executions("h1");
        assert!(!execs.iter().any(|(cmd, _)| cmd.contains("mv ")), "deployed manifest is never moved away");
        let backup = position(&execs, "cp -p /data/ledger/a/docker-compose.json /data/ledger/a/docker-compose.json.bak")
            .expect("backup taken");
        let failed = position(&execs, "cp /tmp/a-docker-compose.json").expect("swap attempted");
        let restored = position(&execs, "cp -p /data/ledger/a/docker-compose.json.bak /data/ledger/a/docker-compose.json")
            .expect("backup restored");
        assert!(backup < failed && failed < restored);

        let staged = Manifest::load(&tmp.path().join("a")).expect("staged");
        assert_eq!(staged.image(), Some("img:v1"), "staged manifest keeps the prior tag");
        assert!(!tmp.path().join(".pending").join("a").exists());

        // a retry with the host fixed goes through from the same prior state
        mock.respond_on("h1", "cp /tmp/a-docker-compose.json", CommandOutput::default());
        let out = update(&c, &n, "v2").await.expect("retry");
        assert_eq!(out, "updated to img:v2");
        let staged = Manifest::load(&tmp.path().join("a")).expect("staged");
        assert_eq!(staged.image(), Some("img:v2"));
    }

    #[tokio::test]
    async fn failed_pull_after_swap_restores_backup() {
        let tmp = tempfile::tempdir().expect("tempdir");
        stage_v1(tmp.path(), "a");
        let mock = MockTransport::healthy();
        mock.respond_on("h1", "docker pull", CommandOutput::failed(1, "manifest unknown"));
        let c = ctx(&mock, tmp.path());

        update(&c, &node("a", "h1", Role::validator(), 0), "v2")
            .await
            .expect_err("pull fails");
        let execs = mock.executions("h1");
        assert!(position(&execs, "docker-compose.json.bak /data/ledger/a/docker-compose.json").is_some());
        assert!(position(&execs, "up -d --force-recreate").is_none());
        let staged = Manifest::load(&tmp.path().join("a")).expect("staged");
        assert_eq!(staged.image(), Some("img:v1"));
    }

    #[tokio::test]
    async fn failed_backup_leaves_host_untouched() {
        let tmp = tempfile::tempdir().expect("tempdir");
        stage_v1(tmp.path(), "a");
        let mock = MockTransport::healthy();
        mock.respond_on("h1", "cp -p", CommandOutput::failed(1, "cp: permission denied"));
        let c = ctx(&mock, tmp.path());

        update(&c, &node("a", "h1", Role::validator(), 0), "v2")
            .await
            .expect_err("backup fails");
        let execs = mock.executions("h1");
        assert!(position(&execs, "cp /tmp/a-docker-compose.json").is_none());
        assert_eq!(execs.len(), 1, "only the backup was attempted");
    }

    #[test]
    fn first_account_strips_console_list() {
        assert_eq!(first_account(r#"["0xab12", "0xcd34"]"#), Some("0xab12".into()));
        assert_eq!(first_account(" [\"lat1qx\"] "), Some("lat1qx".into()));
        assert_eq!(first_account("[]"), None);
        assert_eq!(first_account(""), None);
    }

    #[tokio::test]
    async fn account_without_any_is_empty_response() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mock = MockTransport::new();
        mock.respond("accounts", CommandOutput::ok(&["[]"]));
        let n = node("a", "h1", Role::validator(), 0);
        let err = account(&ctx(&mock, tmp.path()), &n).await.expect_err("no account");
        assert_eq!(err, NodeError::EmptyResponse("eth.accounts".into()));
    }

    #[tokio::test]
    async fn runtime_versions_joins_both_tools() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mock = MockTransport::new();
        mock.respond("docker --version", CommandOutput::ok(&["Docker version 24.0.7"]));
        mock.respond("docker compose version", CommandOutput::ok(&["Docker Compose version v2.21.0"]));
        let n = node("a", "h1", Role::validator(), 0);
        let out = runtime_versions(&ctx(&mock, tmp.path()), &n).await.expect("versions");
        assert_eq!(out, "Docker version 24.0.7 / Docker Compose version v2.21.0");

        let bare = MockTransport::new();
        let err = runtime_versions(&ctx(&bare, tmp.path()), &n).await.expect_err("no runtime");
        assert!(matches!(err, NodeError::EmptyResponse(_)));
    }

    #[tokio::test]
    async fn block_number_uses_attach_console() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mock = MockTransport::new();
        mock.respond("attach", CommandOutput::ok(&["4242"]));
        let n = node("a", "h1", Role::validator(), 0);
        let out = block_number(&ctx(&mock, tmp.path()), &n).await.expect("query");
        assert_eq!(out, "4242");
        let cmd = &mock.executions("h1")[0].0;
        assert!(cmd.contains("geth attach ws://127.0.0.1:7789"));
        assert!(cmd.contains("eth.blockNumber"));
    }
}
