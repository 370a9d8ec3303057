//! Docker backend driving the local `docker` CLI.
//!
//! Every invocation runs under a deadline: the child is polled and killed if
//! it outlives the configured timeout, and the call fails with
//! [`EngineError::Timeout`].

use crate::backend::{CreateSpec, EngineAdapter, EngineStatus, RemoveOutcome};
use crate::EngineError;
use roost_schema::EngineRef;
use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

pub struct DockerEngine {
    binary: String,
    timeout: Duration,
    stop_grace_secs: u32,
}

impl Default for DockerEngine {
    fn default() -> Self {
        Self {
            binary: "docker".to_owned(),
            timeout: Duration::from_secs(120),
            stop_grace_secs: 10,
        }
    }
}

fn read_pipe(pipe: Option<impl Read>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    buf
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_owned()
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

impl DockerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different CLI binary (a compatible wrapper, or a fake in tests).
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_stop_grace(mut self, secs: u32) -> Self {
        self.stop_grace_secs = secs;
        self
    }

    fn run(&self, args: &[String]) -> Result<Output, EngineError> {
        let cmd_str = format!("{} {}", self.binary, args.join(" "));
        debug!("running {cmd_str}");

        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    EngineError::Unavailable(self.binary.clone())
                } else {
                    EngineError::Io(e)
                }
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_reader = thread::spawn(move || read_pipe(stdout));
        let err_reader = thread::spawn(move || read_pipe(stderr));

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(EngineError::Timeout {
                    command: cmd_str,
                    secs: self.timeout.as_secs(),
                });
            }
            thread::sleep(POLL_INTERVAL);
        };

        Ok(Output {
            status,
            stdout: out_reader.join().unwrap_or_default(),
            stderr: err_reader.join().unwrap_or_default(),
        })
    }

    fn run_args(&self, args: &[&str]) -> Result<Output, EngineError> {
        let owned: Vec<String> = args.iter().map(|s| (*s).to_owned()).collect();
        self.run(&owned)
    }

    /// `docker run` arguments for `spec`, without the binary.
    pub fn run_arguments(spec: &CreateSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "-i".into(),
            "-t".into(),
            "--name".into(),
            spec.name.clone(),
            "--hostname".into(),
            spec.name.clone(),
            "--network".into(),
            spec.network.clone(),
            "--label".into(),
            format!("roost.owner={}", spec.owner),
            "--label".into(),
            format!("roost.instance={}", spec.instance),
        ];
        if let Some(mb) = spec.resources.memory_mb {
            args.push("--memory".into());
            args.push(format!("{mb}m"));
        }
        if let Some(cpus) = spec.resources.cpus_arg() {
            args.push("--cpus".into());
            args.push(cpus);
        }
        for port in &spec.resources.ports {
            args.push("-p".into());
            args.push(port.to_string());
        }
        for (key, value) in spec.env() {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.resources.image.clone());
        args
    }

    fn simple_op(
        &self,
        op: &'static str,
        args: &[&str],
        target: &EngineRef,
    ) -> Result<(), EngineError> {
        let output = self.run_args(args)?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = stderr_of(&output);
        if is_missing(&stderr) {
            return Err(EngineError::NotFound(target.to_string()));
        }
        Err(EngineError::Op {
            op,
            target: target.to_string(),
            message: stderr,
        })
    }
}

impl EngineAdapter for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn available(&self) -> bool {
        self.run_args(&["version", "--format", "{{.Server.Version}}"])
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn create(&self, spec: &CreateSpec) -> Result<EngineRef, EngineError> {
        let image = spec.resources.image.as_str();
        let pull = self.run_args(&["pull", image])?;
        if !pull.status.success() {
            return Err(EngineError::Create(format!(
                "pulling {image}: {}",
                stderr_of(&pull)
            )));
        }

        let output = self.run(&Self::run_arguments(spec))?;
        if !output.status.success() {
            return Err(EngineError::Create(stderr_of(&output)));
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if id.is_empty() {
            return Err(EngineError::Create(
                "engine returned an empty container id".to_owned(),
            ));
        }
        info!(
            "created container {} ({})",
            spec.name,
            id.get(..12).unwrap_or(&id)
        );
        Ok(EngineRef::new(id))
    }

    fn start(&self, engine_ref: &EngineRef) -> Result<(), EngineError> {
        self.simple_op("start", &["start", engine_ref.as_str()], engine_ref)
    }

    fn stop(&self, engine_ref: &EngineRef) -> Result<(), EngineError> {
        let grace = self.stop_grace_secs.to_string();
        self.simple_op("stop", &["stop", "-t", &grace, engine_ref.as_str()], engine_ref)
    }

    fn remove(&self, engine_ref: &EngineRef) -> Result<RemoveOutcome, EngineError> {
        let output = self.run_args(&["rm", "-f", engine_ref.as_str()])?;
        if output.status.success() {
            return Ok(RemoveOutcome::Removed);
        }
        let stderr = stderr_of(&output);
        if is_missing(&stderr) {
            return Ok(RemoveOutcome::AlreadyAbsent);
        }
        Err(EngineError::Op {
            op: "remove",
            target: engine_ref.to_string(),
            message: stderr,
        })
    }

    fn inspect(&self, engine_ref: &EngineRef) -> Result<EngineStatus, EngineError> {
        let output =
            self.run_args(&["inspect", "--format", "{{.State.Status}}", engine_ref.as_str()])?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if is_missing(&stderr) {
                return Ok(EngineStatus::Absent);
            }
            return Err(EngineError::Op {
                op: "inspect",
                target: engine_ref.to_string(),
                message: stderr,
            });
        }
        match String::from_utf8_lossy(&output.stdout).trim() {
            "running" | "paused" | "restarting" => Ok(EngineStatus::Running),
            "created" | "exited" | "dead" | "removing" => Ok(EngineStatus::Stopped),
            other => Err(EngineError::Op {
                op: "inspect",
                target: engine_ref.to_string(),
                message: format!("unrecognised container state '{other}'"),
            }),
        }
    }
}
