//! Stage backed by an external model-runner program.
//!
//! The program is spawned without a shell. Argument templates are expanded
//! per invocation:
//!
//! | placeholder     | value                                   |
//! |-----------------|-----------------------------------------|
//! | `{input}`       | primary input path                      |
//! | `{output}`      | path the stage must write               |
//! | `{source.N}`    | N-th input the job was submitted with   |
//! | `{job_id}`      | job id                                  |
//! | `{stage_index}` | zero-based stage index                  |
//! | `{param.KEY}`   | submission parameter `KEY`              |
//!
//! Lines of the form `PROGRESS <percent> [note]` on stdout are forwarded as
//! progress reports.

use std::collections::{BTreeMap, VecDeque};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::progress::ProgressReporter;
use super::stage::{
    DurationClass, ResourceClass, Stage, StageContext, StageError, StageInput, StageOutput,
};
use crate::domain::MediaKind;

const STDERR_TAIL_LINES: usize = 20;
const OOM_PHRASES: [&str; 3] = ["out of memory", "cannot allocate memory", "oom-kill"];

/// Declarative description of a command stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandStageSpec {
    pub name: String,
    pub resource_class: ResourceClass,
    #[serde(default)]
    pub duration_class: DurationClass,
    pub input_kinds: Vec<MediaKind>,
    pub output_kind: MediaKind,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Kill the process when the job is cancelled instead of waiting for it.
    #[serde(default = "default_interruptible")]
    pub interruptible: bool,
    /// Exit code the runner uses for device memory exhaustion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oom_exit_code: Option<i32>,
}

fn default_interruptible() -> bool {
    true
}

pub struct CommandStage {
    spec: CommandStageSpec,
}

impl CommandStage {
    pub fn new(spec: CommandStageSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &CommandStageSpec {
        &self.spec
    }

    /// Expand placeholders in one argument template.
    fn expand(template: &str, input: &StageInput) -> Result<String, StageError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let Some(len) = rest[start..].find('}') else {
                out.push_str(&rest[start..]);
                return Ok(out);
            };
            let key = &rest[start + 1..start + len];
            out.push_str(&Self::resolve(key, input)?);
            rest = &rest[start + len + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn resolve(key: &str, input: &StageInput) -> Result<String, StageError> {
        match key {
            "input" => Ok(input.primary.path.display().to_string()),
            "output" => Ok(input.output_path.display().to_string()),
            "job_id" => Ok(input.job_id.clone()),
            "stage_index" => Ok(input.stage_index.to_string()),
            _ => {
                if let Some(index) = key.strip_prefix("source.") {
                    let source = index
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| input.sources.get(i))
                        .ok_or_else(|| {
                            StageError::invalid_input(format!("missing input #{}", index))
                        })?;
                    return Ok(source.path.display().to_string());
                }
                if let Some(param) = key.strip_prefix("param.") {
                    return match input.params.get(param) {
                        Some(serde_json::Value::String(s)) => Ok(s.clone()),
                        Some(serde_json::Value::Null) | None => Err(StageError::invalid_input(
                            format!("missing parameter '{}'", param),
                        )),
                        Some(other) => Ok(other.to_string()),
                    };
                }
                Err(StageError::internal(format!(
                    "unknown placeholder '{{{}}}'",
                    key
                )))
            }
        }
    }

    fn classify_failure(&self, code: Option<i32>, stderr_tail: &str) -> StageError {
        let lowered = stderr_tail.to_ascii_lowercase();
        let oom_code = code.is_some() && code == self.spec.oom_exit_code;
        if oom_code || mentions_oom(&lowered) {
            return StageError::ResourceExhausted(format!(
                "{} ran out of device memory: {}",
                self.spec.program,
                stderr_tail.trim()
            ));
        }
        StageError::Internal(format!(
            "{} exited with code {}: {}",
            self.spec.program,
            code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
            stderr_tail.trim()
        ))
    }
}

/// Whether lowercased stderr reports memory exhaustion. A bare "oom" only
/// counts as a whole word, so "zoom" or "room" do not match.
fn mentions_oom(lowered: &str) -> bool {
    OOM_PHRASES.iter().any(|p| lowered.contains(p))
        || lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|word| word == "oom" || word == "oomkilled")
}

/// Parse a `PROGRESS <percent> [note]` line.
pub fn parse_progress_line(line: &str) -> Option<(u8, Option<String>)> {
    let rest = line.trim().strip_prefix("PROGRESS")?;
    let mut parts = rest.trim_start().splitn(2, char::is_whitespace);
    let percent = parts.next()?.trim_end_matches('%').parse::<f64>().ok()?;
    let note = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Some((percent.clamp(0.0, 100.0) as u8, note))
}

async fn pump_stdout(
    stdout: tokio::process::ChildStdout,
    progress: ProgressReporter,
    stage: String,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match parse_progress_line(&line) {
            Some((percent, note)) => progress.report(percent, note),
            None => debug!(stage = %stage, "stdout: {}", line),
        }
    }
}

async fn collect_stderr_tail(stderr: tokio::process::ChildStderr, stage: String) -> String {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(stage = %stage, "stderr: {}", line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

#[async_trait]
impl Stage for CommandStage {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn resource_class(&self) -> ResourceClass {
        self.spec.resource_class
    }

    fn duration_class(&self) -> DurationClass {
        self.spec.duration_class
    }

    fn input_kinds(&self) -> &[MediaKind] {
        &self.spec.input_kinds
    }

    fn output_kind(&self) -> MediaKind {
        self.spec.output_kind
    }

    fn timeout(&self) -> Option<Duration> {
        self.spec.timeout_secs.map(Duration::from_secs)
    }

    fn supports_interrupt(&self) -> bool {
        self.spec.interruptible
    }

    async fn execute(&self, input: StageInput, ctx: StageContext) -> Result<StageOutput, StageError> {
        let args = self
            .spec
            .args
            .iter()
            .map(|a| Self::expand(a, &input))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            job_id = %input.job_id,
            stage = %self.spec.name,
            program = %self.spec.program,
            "Spawning stage runner"
        );

        let mut cmd = Command::new(&self.spec.program);
        cmd.args(&args)
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            StageError::internal(format!("failed to spawn {}: {}", self.spec.program, e))
        })?;

        let stdout_task = child
            .stdout
            .take()
            .map(|s| tokio::spawn(pump_stdout(s, ctx.progress.clone(), self.spec.name.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|s| tokio::spawn(collect_stderr_tail(s, self.spec.name.clone())));

        let interrupt = async {
            if !self.spec.interruptible {
                return std::future::pending::<()>().await;
            }
            ctx.stopped().await
        };

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| {
                StageError::internal(format!("failed to wait for {}: {}", self.spec.program, e))
            })?,
            _ = interrupt => {
                warn!(job_id = %input.job_id, stage = %self.spec.name, "Killing interrupted stage runner");
                let _ = child.kill().await;
                return Err(StageError::Cancelled);
            }
        };

        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        let stderr_tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(self.classify_failure(status.code(), &stderr_tail));
        }

        Ok(StageOutput {
            note: Some(format!("{} finished", self.spec.name)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MediaRef;
    use std::path::PathBuf;

    fn spec() -> CommandStageSpec {
        CommandStageSpec {
            name: "swap".to_string(),
            resource_class: ResourceClass::GpuExclusive,
            duration_class: DurationClass::Long,
            input_kinds: vec![MediaKind::FaceData],
            output_kind: MediaKind::Video,
            program: "runner".to_string(),
            args: vec![],
            env: BTreeMap::new(),
            timeout_secs: None,
            interruptible: true,
            oom_exit_code: Some(86),
        }
    }

    fn input() -> StageInput {
        StageInput {
            job_id: "j1".to_string(),
            stage_index: 1,
            primary: MediaRef::new("/jobs/j1/stage-00.json", MediaKind::FaceData),
            sources: vec![
                MediaRef::new("/in/target.mp4", MediaKind::Video),
                MediaRef::new("/in/face.png", MediaKind::Image),
            ],
            output_path: PathBuf::from("/jobs/j1/stage-01.mp4.partial"),
            output_kind: MediaKind::Video,
            params: serde_json::json!({"gender": "female", "strength": 0.8}),
        }
    }

    #[test]
    fn test_expand_placeholders() {
        let input = input();
        assert_eq!(
            CommandStage::expand("--face={source.1}", &input).unwrap(),
            "--face=/in/face.png"
        );
        assert_eq!(
            CommandStage::expand("{input}:{output}", &input).unwrap(),
            "/jobs/j1/stage-00.json:/jobs/j1/stage-01.mp4.partial"
        );
        assert_eq!(
            CommandStage::expand("{job_id}-{stage_index}", &input).unwrap(),
            "j1-1"
        );
        assert_eq!(
            CommandStage::expand("{param.gender}/{param.strength}", &input).unwrap(),
            "female/0.8"
        );
        assert!(matches!(
            CommandStage::expand("{source.5}", &input),
            Err(StageError::InvalidInput(_))
        ));
        assert!(matches!(
            CommandStage::expand("{param.missing}", &input),
            Err(StageError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_parse_progress_line() {
        assert_eq!(parse_progress_line("PROGRESS 42"), Some((42, None)));
        assert_eq!(
            parse_progress_line("PROGRESS 99.5% enhancing frames"),
            Some((99, Some("enhancing frames".to_string())))
        );
        assert_eq!(parse_progress_line("PROGRESS 250"), Some((100, None)));
        assert_eq!(parse_progress_line("loading model"), None);
    }

    #[test]
    fn test_classify_failure() {
        let stage = CommandStage::new(spec());
        assert!(matches!(
            stage.classify_failure(Some(86), ""),
            StageError::ResourceExhausted(_)
        ));
        assert!(matches!(
            stage.classify_failure(Some(1), "RuntimeError: CUDA error: out of memory"),
            StageError::ResourceExhausted(_)
        ));
        assert!(matches!(
            stage.classify_failure(Some(1), "No face detected"),
            StageError::Internal(_)
        ));
        assert!(matches!(
            stage.classify_failure(Some(137), "worker killed: OOM"),
            StageError::ResourceExhausted(_)
        ));
        for unrelated in [
            "ValueError: invalid zoom factor",
            "no room left in batch",
            "bloom filter mismatch",
        ] {
            assert!(
                matches!(stage.classify_failure(Some(1), unrelated), StageError::Internal(_)),
                "{unrelated}"
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_reports_progress_and_exit() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let mut spec = spec();
        spec.input_kinds = vec![MediaKind::Video];
        spec.program = "sh".to_string();
        spec.args = vec![
            "-c".to_string(),
            "echo 'PROGRESS 50 half'; echo done > \"$0\"".to_string(),
            "{output}".to_string(),
        ];
        let stage = CommandStage::new(spec);

        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let ctx = StageContext {
            cancel: tokio_util::sync::CancellationToken::new(),
            lease_revoked: None,
            progress: ProgressReporter::new("j1", 0, tx),
        };
        let mut input = input();
        input.output_path = out.clone();

        stage.execute(input, ctx).await.unwrap();
        assert!(out.exists());
        let update = rx.recv().await.unwrap();
        assert_eq!(update.progress.percent, 50);
        assert_eq!(update.progress.note.as_deref(), Some("half"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_cancel_kills_runner() {
        let mut spec = spec();
        spec.program = "sleep".to_string();
        spec.args = vec!["30".to_string()];
        let stage = CommandStage::new(spec);

        let cancel = tokio_util::sync::CancellationToken::new();
        let ctx = StageContext {
            cancel: cancel.clone(),
            lease_revoked: None,
            progress: ProgressReporter::noop("j1"),
        };
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), stage.execute(input(), ctx))
            .await
            .unwrap();
        assert_eq!(result.unwrap_err(), StageError::Cancelled);
    }
}
