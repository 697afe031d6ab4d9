//! External server protocol (§6.1) — the RPC transport itself is out of
//! scope (§1); this module only specifies the query/commit contract a
//! transport implementation must honor, plus the dynamic-resource script
//! contract (§6.3).
//!
//! Production code talks to the scheduler server over an opaque
//! transport (PBS's `IFL` protocol and its successors); this crate models
//! only the typed shape on the wire (`batch_status` lists of name +
//! attribute tuples) and the operations the cycle orchestrator needs.

use crate::error::ScheduleResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One attribute on a `batch_status` entry: `(name, resource?, value, op)`
/// (§6.1). `resource` is `Some` for resource-indexed attributes like
/// `Resource_List.ncpus`; `op` mirrors the wire's set/incr/decr/default
/// but this crate only ever reads `Set`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchAttrib {
    pub name: String,
    pub resource: Option<String>,
    pub value: String,
    #[serde(default)]
    pub op: AttribOp,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttribOp {
    #[default]
    Set,
    Incr,
    Decr,
    Default,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BatchStatus {
    pub name: String,
    pub attribs: Vec<BatchAttrib>,
}

impl BatchStatus {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attribs.iter().find(|a| a.name == name).map(|a| a.value.as_str())
    }

    pub fn get_resource(&self, name: &str, resource: &str) -> Option<&str> {
        self.attribs
            .iter()
            .find(|a| a.name == name && a.resource.as_deref() == Some(resource))
            .map(|a| a.value.as_str())
    }
}

/// Selection criteria for [`ServerConnector::selstat_jobs`] (§6.1:
/// `selstat_jobs(selection, attrs, extend)`).
#[derive(Debug, Clone, Default)]
pub struct JobSelection {
    pub queue: Option<String>,
    pub state: Option<String>,
    pub user: Option<String>,
}

/// Reply to a preempt request: `(name, method)` where method is
/// `S|C|Q|D|0` (§6.1).
#[derive(Debug, Clone)]
pub struct PreemptReply {
    pub job_name: String,
    pub method: Option<crate::preempt::PreemptMethod>,
}

/// The typed query/commit interface the cycle orchestrator consumes
/// (§6.1). A transport crate implements this over whatever wire protocol
/// the site's server speaks; this crate never constructs sockets itself.
#[async_trait]
pub trait ServerConnector: Send + Sync {
    async fn stat_server(&self) -> ScheduleResult<BatchStatus>;
    async fn stat_sched(&self) -> ScheduleResult<BatchStatus>;
    async fn stat_queue(&self) -> ScheduleResult<Vec<BatchStatus>>;
    async fn stat_node(&self) -> ScheduleResult<Vec<BatchStatus>>;
    async fn stat_resv(&self) -> ScheduleResult<Vec<BatchStatus>>;
    async fn selstat_jobs(
        &self,
        selection: &JobSelection,
        attrs: &[&str],
        extend: Option<&str>,
    ) -> ScheduleResult<Vec<BatchStatus>>;

    async fn run_job(&self, name: &str, exec_vnode: &str, async_commit: bool) -> ScheduleResult<()>;
    async fn alter_job(&self, name: &str, attrs: &[BatchAttrib]) -> ScheduleResult<()>;
    async fn async_alter_job(&self, name: &str, attrs: &[BatchAttrib]) -> ScheduleResult<()>;
    async fn preempt_jobs(&self, names: &[String]) -> ScheduleResult<Vec<PreemptReply>>;

    async fn confirm_resv(&self, name: &str, exec_vnode: &str, start: i64) -> ScheduleResult<()>;
    async fn delete_resv(&self, name: &str) -> ScheduleResult<()>;
}

/// §6.3: dynamic-resource child-process contract. Production spawns
/// `/bin/sh -c CMD` in a new process group and reads one line of stdout
/// within `server_dyn_res_alarm` seconds; on timeout the group is
/// SIGTERM-ed then SIGKILL-ed. This crate models only the contract —
/// "run this command, give me back one trimmed line or a timeout" — the
/// actual process plumbing lives in [`run_dynamic_resource_script`],
/// which is the one place this contract is exercised for real.
#[async_trait]
pub trait DynamicResourceRunner: Send + Sync {
    async fn run(&self, command_line: &str, timeout: Duration) -> DynResOutcome;
}

#[derive(Debug, Clone, PartialEq)]
pub enum DynResOutcome {
    Value(String),
    Timeout,
    NonZeroExit(i32),
    ParseError,
}

/// Real implementation of [`DynamicResourceRunner`] using `tokio::process`
/// (§6.3, §5: "blocking I/O occurs only at three narrow call sites").
pub struct ShellDynamicResourceRunner;

#[async_trait]
impl DynamicResourceRunner for ShellDynamicResourceRunner {
    async fn run(&self, command_line: &str, timeout: Duration) -> DynResOutcome {
        use tokio::io::AsyncBufReadExt;
        use tokio::process::Command;

        #[cfg(unix)]
        let mut child = match Command::new("/bin/sh")
            .arg("-c")
            .arg(command_line)
            .stdout(std::process::Stdio::piped())
            .process_group(0)
            .spawn()
        {
            Ok(c) => c,
            Err(_) => return DynResOutcome::NonZeroExit(-1),
        };
        #[cfg(not(unix))]
        let mut child = match Command::new("/bin/sh")
            .arg("-c")
            .arg(command_line)
            .stdout(std::process::Stdio::piped())
            .spawn()
        {
            Ok(c) => c,
            Err(_) => return DynResOutcome::NonZeroExit(-1),
        };

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill().await;
            return DynResOutcome::NonZeroExit(-1);
        };
        let mut lines = tokio::io::BufReader::new(stdout).lines();

        let read = tokio::time::timeout(timeout, lines.next_line()).await;
        match read {
            Ok(Ok(Some(line))) => {
                let _ = child.kill().await;
                DynResOutcome::Value(line.trim_end_matches(['\r', '\n']).to_string())
            }
            Ok(Ok(None)) | Ok(Err(_)) => {
                let status = child.wait().await.ok();
                match status.and_then(|s| s.code()) {
                    Some(0) => DynResOutcome::ParseError,
                    Some(code) => DynResOutcome::NonZeroExit(code),
                    None => DynResOutcome::NonZeroExit(-1),
                }
            }
            Err(_) => {
                let _ = child.kill().await;
                DynResOutcome::Timeout
            }
        }
    }
}

/// §6.3 permission check: the script file must not be group- or
/// world-writable. `command_line`'s first whitespace-separated token is
/// taken as the script path, matching how `/bin/sh -c CMD` resolves it.
/// Non-Unix targets and unreadable paths fail closed (not safe to run).
pub fn script_permission_ok(command_line: &str) -> bool {
    let Some(path) = command_line.split_whitespace().next() else { return false };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(path) {
            Ok(meta) => meta.permissions().mode() & 0o022 == 0,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        false
    }
}

/// Drive one dynamic-resource script to completion and fold the result
/// into `resources_available`, per §6.3's success/failure table. The
/// permission check (script must not be group- or world-writable) is the
/// caller's responsibility before invoking this — it needs filesystem
/// metadata this function deliberately does not touch, keeping the
/// timeout/parse contract independent of the audit-log side effect.
pub async fn run_dynamic_resource_script(
    runner: &dyn DynamicResourceRunner,
    resource_name: &str,
    command_line: &str,
    timeout: Duration,
    is_consumable: bool,
) -> crate::resource::ResourceValue {
    match runner.run(command_line, timeout).await {
        DynResOutcome::Value(line) => {
            if is_consumable {
                line.trim()
                    .parse::<i64>()
                    .map(crate::resource::ResourceValue::Long)
                    .unwrap_or(crate::resource::ResourceValue::Long(0))
            } else {
                crate::resource::ResourceValue::Str(line)
            }
        }
        DynResOutcome::Timeout | DynResOutcome::NonZeroExit(_) | DynResOutcome::ParseError => {
            tracing::warn!(resource = resource_name, command = command_line, "server_dyn_res script failed or timed out");
            crate::resource::ResourceValue::Long(0)
        }
    }
}

/// Run every configured `server_dyn_res` script and return the resolved
/// `(resource name, value)` pairs, ready to fold into
/// [`crate::entities::server::Server::resources_available`]. The
/// permission check happens here, per-script, before the process is ever
/// spawned; a failing check never calls `runner.run` at all and is logged
/// as an audit record distinct from a timeout/parse failure.
pub async fn refresh_dynamic_resources(
    runner: &dyn DynamicResourceRunner,
    entries: &[crate::config::DynResEntry],
    alarm: Duration,
    resource_defs: &std::collections::HashMap<String, std::sync::Arc<crate::resource::ResourceDef>>,
) -> std::collections::HashMap<String, crate::resource::ResourceValue> {
    let mut out = std::collections::HashMap::new();
    for entry in entries {
        if !script_permission_ok(&entry.command_line) {
            tracing::warn!(
                audit = true,
                resource = entry.resource.as_str(),
                command = entry.command_line.as_str(),
                "server_dyn_res script is group- or world-writable, refusing to run"
            );
            out.insert(entry.resource.clone(), crate::resource::ResourceValue::Long(0));
            continue;
        }
        let is_consumable = resource_defs.get(&entry.resource).map_or(true, |d| d.flags.consumable);
        let value = run_dynamic_resource_script(runner, &entry.resource, &entry.command_line, alarm, is_consumable).await;
        out.insert(entry.resource.clone(), value);
    }
    out
}

/// Full attribute-name surface recognized on the wire (§6.1), for
/// validating/documenting what a transport implementation must be able
/// to project.
pub const RECOGNIZED_ATTRIBUTES: &[&str] = &[
    "queue",
    "state",
    "substate",
    "Resource_List",
    "resources_used",
    "exec_vnode",
    "schedselect",
    "place",
    "estimated.start_time",
    "estimated.exec_vnode",
    "eligible_time",
    "accrue_type",
    "comment",
    "sched_preempted",
    "array_indices_remaining",
    "max_run_subjobs",
    "depend",
    "server_inst_id",
    "partition",
    "node_group_key",
    "node_group_enable",
    "eligible_time_enable",
    "backfill_depth",
    "do_not_span_psets",
    "restrict_res_to_release_on_suspend",
    "has_runjob_hook",
];

/// One cycle's worth of `batch_status` lists, as written to disk by the
/// JSON-file connector. Mirrors exactly what a real transport would hand
/// back from `stat_server`/`stat_queue`/`stat_node`/`stat_resv`/
/// `selstat_jobs` in one shot; used by [`JsonFileConnector`] and by the
/// CLI's `run-file` subcommand to drive a cycle without a live server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub server: BatchStatus,
    pub queues: Vec<BatchStatus>,
    pub nodes: Vec<BatchStatus>,
    pub resvs: Vec<BatchStatus>,
    pub jobs: Vec<BatchStatus>,
}

/// A [`ServerConnector`] backed by a JSON snapshot file and a commit log,
/// rather than a live server socket (§1: "The RPC transport... [is] out
/// of scope"). This is not a production transport — it exists so the CLI
/// and integration tests can drive a full cycle end to end against a
/// fixture, the way the teacher's `StateStore` drives its CLI against a
/// local directory instead of a remote service.
pub struct JsonFileConnector {
    snapshot: SnapshotFile,
    commits: std::sync::Mutex<Vec<String>>,
}

impl JsonFileConnector {
    pub fn from_file(path: &std::path::Path) -> ScheduleResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            crate::error::ConnectorError::QueryRejected(format!("reading {}: {e}", path.display()))
        })?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> ScheduleResult<Self> {
        let snapshot: SnapshotFile = serde_json::from_str(text)
            .map_err(|e| crate::error::ConnectorError::QueryRejected(format!("parsing snapshot: {e}")))?;
        Ok(Self { snapshot, commits: std::sync::Mutex::new(Vec::new()) })
    }

    /// Every commit issued this run, in order, for the CLI to print or a
    /// test to assert against.
    pub fn commit_log(&self) -> Vec<String> {
        self.commits.lock().map(|g| g.clone()).unwrap_or_default()
    }

    fn log(&self, line: String) {
        if let Ok(mut g) = self.commits.lock() {
            g.push(line);
        }
    }
}

#[async_trait]
impl ServerConnector for JsonFileConnector {
    async fn stat_server(&self) -> ScheduleResult<BatchStatus> {
        Ok(self.snapshot.server.clone())
    }
    async fn stat_sched(&self) -> ScheduleResult<BatchStatus> {
        Ok(BatchStatus { name: "sched".into(), attribs: vec![] })
    }
    async fn stat_queue(&self) -> ScheduleResult<Vec<BatchStatus>> {
        Ok(self.snapshot.queues.clone())
    }
    async fn stat_node(&self) -> ScheduleResult<Vec<BatchStatus>> {
        Ok(self.snapshot.nodes.clone())
    }
    async fn stat_resv(&self) -> ScheduleResult<Vec<BatchStatus>> {
        Ok(self.snapshot.resvs.clone())
    }
    async fn selstat_jobs(&self, _selection: &JobSelection, _attrs: &[&str], _extend: Option<&str>) -> ScheduleResult<Vec<BatchStatus>> {
        Ok(self.snapshot.jobs.clone())
    }
    async fn run_job(&self, name: &str, exec_vnode: &str, _async_commit: bool) -> ScheduleResult<()> {
        self.log(format!("run_job {name} {exec_vnode}"));
        Ok(())
    }
    async fn alter_job(&self, name: &str, attrs: &[BatchAttrib]) -> ScheduleResult<()> {
        self.log(format!("alter_job {name} {}", attrs.len()));
        Ok(())
    }
    async fn async_alter_job(&self, name: &str, attrs: &[BatchAttrib]) -> ScheduleResult<()> {
        self.log(format!("async_alter_job {name} {}", attrs.len()));
        Ok(())
    }
    async fn preempt_jobs(&self, names: &[String]) -> ScheduleResult<Vec<PreemptReply>> {
        self.log(format!("preempt_jobs {}", names.join(",")));
        Ok(names.iter().map(|n| PreemptReply { job_name: n.clone(), method: Some(crate::preempt::PreemptMethod::Suspend) }).collect())
    }
    async fn confirm_resv(&self, name: &str, exec_vnode: &str, start: i64) -> ScheduleResult<()> {
        self.log(format!("confirm_resv {name} {exec_vnode} {start}"));
        Ok(())
    }
    async fn delete_resv(&self, name: &str) -> ScheduleResult<()> {
        self.log(format!("delete_resv {name}"));
        Ok(())
    }
}

#[cfg(test)]
mod file_connector_tests {
    use super::*;

    #[tokio::test]
    async fn loads_snapshot_and_records_commits() {
        let json = r#"{
            "server": {"name": "server", "attribs": []},
            "queues": [{"name": "workq", "attribs": [{"name": "Priority", "resource": null, "value": "100", "op": "Set"}]}],
            "nodes": [],
            "resvs": [],
            "jobs": []
        }"#;
        let connector = JsonFileConnector::from_str(json).unwrap();
        let queues = connector.stat_queue().await.unwrap();
        assert_eq!(queues.len(), 1);
        connector.run_job("1.host", "(n1:ncpus=1)", false).await.unwrap();
        assert_eq!(connector.commit_log(), vec!["run_job 1.host (n1:ncpus=1)".to_string()]);
    }
}
