//! Deterministic in-process runtime
//!
//! Containers are plain records whose start behaviour is scripted per image.
//! Exec instances run a tiny line interpreter (`echo`, `exit`, `kill`, `pwd`)
//! behind a duplex pipe, which is enough to drive terminal sessions end to end.
//! Shells started as `sh -c 'echo $$ > FILE; ...'` register their pid under
//! FILE so later `$(cat FILE)` substitutions resolve to it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{Config, LogOutput};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{
    ContainerConfig, ContainerCreateResponse, ContainerInspectResponse,
    ContainerState as RuntimeState, ContainerStateStatusEnum, ContainerSummary, CreateImageInfo,
    ExecInspectResponse, ImageInspect, Port, PortTypeEnum, ProgressDetail,
};
use bytes::Bytes;
use futures::channel::mpsc;
use futures::stream;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{not_found, ContainerRuntime, LogStream, PullStream};

/// What a container does once started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedBehavior {
    /// Runs until stopped
    StaysRunning,
    /// Exits immediately with the given code
    ExitsWith(i64),
    /// Accepts the start call but never leaves the created state
    NeverRuns,
    /// The start call itself fails with this message
    FailsToStart(String),
}

/// Runtime double holding every container and exec in memory
#[derive(Clone, Default)]
pub struct InMemoryRuntime {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    containers: HashMap<String, FakeContainer>,
    images: HashSet<String>,
    pull_failures: HashMap<String, String>,
    behaviors: HashMap<String, ScriptedBehavior>,
    execs: HashMap<String, FakeExec>,
    created_configs: Vec<(String, Config<String>)>,
    fail_next_create: Option<String>,
    create_delay: Option<Duration>,
    start_delay: Option<Duration>,
    inspect_calls: usize,
    next_pid: i64,
    pidfiles: HashMap<String, i64>,
}

struct FakeContainer {
    id: String,
    name: String,
    image: String,
    labels: HashMap<String, String>,
    host_ports: Vec<u16>,
    status: ContainerStateStatusEnum,
    exit_code: i64,
    error: String,
    logs: Vec<String>,
}

struct FakeExec {
    container_id: String,
    cmd: Vec<String>,
    interactive: bool,
    started: bool,
    running: bool,
    exit_code: Option<i64>,
    pid: i64,
    size: Option<(u16, u16)>,
    cancel: CancellationToken,
}

enum Outcome {
    Output(String, i64),
    Exit(i64),
}

fn server_error(status_code: u16, message: impl Into<String>) -> DockerError {
    DockerError::DockerResponseServerError {
        status_code,
        message: message.into(),
    }
}

fn console(text: &str) -> Result<LogOutput, DockerError> {
    Ok(LogOutput::Console {
        message: Bytes::from(text.to_string()),
    })
}

impl State {
    fn find_container(&self, id_or_name: &str) -> Option<&FakeContainer> {
        let name = id_or_name.trim_start_matches('/');
        self.containers
            .get(id_or_name)
            .or_else(|| self.containers.values().find(|c| c.name == name))
    }

    fn container_id(&self, id_or_name: &str) -> Option<String> {
        self.find_container(id_or_name).map(|c| c.id.clone())
    }

    fn behavior_for(&self, image: &str) -> ScriptedBehavior {
        self.behaviors
            .get(image)
            .cloned()
            .unwrap_or(ScriptedBehavior::StaysRunning)
    }

    fn kill_execs_of(&mut self, container_id: &str) {
        for exec in self.execs.values_mut() {
            if exec.container_id == container_id && exec.running {
                exec.cancel.cancel();
            }
        }
    }

    fn kill_pid(&mut self, pid: i64) -> bool {
        match self
            .execs
            .values()
            .find(|e| e.pid == pid && e.running)
        {
            Some(exec) => {
                exec.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Apply the scripted start behaviour to an existing container
    fn boot(&mut self, id: &str) -> Result<(), DockerError> {
        let image = match self.containers.get(id) {
            Some(c) => c.image.clone(),
            None => return Err(not_found("container", id)),
        };
        let behavior = self.behavior_for(&image);
        let container = self
            .containers
            .get_mut(id)
            .ok_or_else(|| not_found("container", id))?;

        match behavior {
            ScriptedBehavior::StaysRunning => {
                container.status = ContainerStateStatusEnum::RUNNING;
                container.exit_code = 0;
                container.error.clear();
                container.logs.push("sandbox ready".to_string());
            }
            ScriptedBehavior::ExitsWith(code) => {
                container.status = ContainerStateStatusEnum::EXITED;
                container.exit_code = code;
                container.logs.push(format!("process exited with code {}", code));
            }
            ScriptedBehavior::NeverRuns => {
                container.status = ContainerStateStatusEnum::CREATED;
            }
            ScriptedBehavior::FailsToStart(message) => {
                container.error = message.clone();
                return Err(server_error(500, message));
            }
        }
        Ok(())
    }

    fn finish_exec(&mut self, exec_id: &str, code: i64) {
        if let Some(exec) = self.execs.get_mut(exec_id) {
            exec.running = false;
            exec.exit_code = Some(code);
        }
    }

    /// First statement of a script with pidfile reads substituted
    fn expand(&self, script: &str) -> String {
        let statement = script.split(';').next().unwrap_or_default().trim();
        self.pidfiles
            .iter()
            .fold(statement.to_string(), |line, (path, pid)| {
                line.replace(&format!("$(cat {})", path), &pid.to_string())
            })
    }

    fn interpret(&mut self, line: &str) -> Outcome {
        let mut words = line.split_whitespace();
        let Some(program) = words.next() else {
            return Outcome::Output(String::new(), 0);
        };
        let args: Vec<&str> = words.collect();

        match program {
            "exit" => Outcome::Exit(args.first().and_then(|a| a.parse().ok()).unwrap_or(0)),
            "echo" => Outcome::Output(format!("{}\n", args.join(" ")), 0),
            "pwd" => Outcome::Output("/workspace\n".to_string(), 0),
            "true" => Outcome::Output(String::new(), 0),
            "false" => Outcome::Output(String::new(), 1),
            "kill" => {
                let target = args.iter().rev().find_map(|a| a.parse::<i64>().ok());
                match target {
                    Some(pid) if self.kill_pid(pid) => Outcome::Output(String::new(), 0),
                    Some(pid) => {
                        Outcome::Output(format!("kill: ({}) - No such process\n", pid), 1)
                    }
                    None => Outcome::Output("kill: usage: kill [-s sigspec] pid\n".to_string(), 2),
                }
            }
            other => Outcome::Output(format!("{}: command not found\n", other), 127),
        }
    }
}

/// Turn an exec command vector into the line the interpreter runs
fn command_line(cmd: &[String]) -> String {
    match cmd {
        [shell, flag, script, ..] if shell.ends_with("sh") && flag == "-c" => script.clone(),
        _ => cmd.join(" "),
    }
}

/// Path a wrapper script writes its own pid to, if any
fn pidfile_of(script: &str) -> Option<String> {
    let rest = script.split("echo $$ > ").nth(1)?;
    let path = rest.split(';').next()?.trim();
    (!path.is_empty()).then(|| path.to_string())
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Script what containers created from `image` do when started
    pub fn set_behavior(&self, image: &str, behavior: ScriptedBehavior) {
        self.lock().behaviors.insert(image.to_string(), behavior);
    }

    /// Mark an image as already present locally
    pub fn add_image(&self, image: &str) {
        self.lock().images.insert(image.to_string());
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.lock().images.contains(image)
    }

    /// Make pulls of `image` fail with the given engine message
    pub fn fail_pull(&self, image: &str, message: &str) {
        self.lock()
            .pull_failures
            .insert(image.to_string(), message.to_string());
    }

    /// Fail the next create call with the given message
    pub fn fail_next_create(&self, message: &str) {
        self.lock().fail_next_create = Some(message.to_string());
    }

    /// Delay every create call, widening race windows in tests
    pub fn set_create_delay(&self, delay: Duration) {
        self.lock().create_delay = Some(delay);
    }

    /// Hold every start call for `delay` before it takes effect
    pub fn set_start_delay(&self, delay: Duration) {
        self.lock().start_delay = Some(delay);
    }

    /// Names and configs of every container created so far
    pub fn created_configs(&self) -> Vec<(String, Config<String>)> {
        self.lock().created_configs.clone()
    }

    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    pub fn inspect_calls(&self) -> usize {
        self.lock().inspect_calls
    }

    pub fn push_log(&self, id: &str, line: &str) {
        let mut state = self.lock();
        if let Some(id) = state.container_id(id) {
            if let Some(c) = state.containers.get_mut(&id) {
                c.logs.push(line.to_string());
            }
        }
    }

    /// Simulate the container process dying on its own
    pub fn set_exited(&self, id: &str, exit_code: i64) {
        let mut state = self.lock();
        if let Some(id) = state.container_id(id) {
            state.kill_execs_of(&id);
            if let Some(c) = state.containers.get_mut(&id) {
                c.status = ContainerStateStatusEnum::EXITED;
                c.exit_code = exit_code;
            }
        }
    }

    /// Simulate the container being removed by something else
    pub fn remove_externally(&self, id: &str) {
        let mut state = self.lock();
        if let Some(id) = state.container_id(id) {
            state.kill_execs_of(&id);
            state.containers.remove(&id);
        }
    }

    /// Add a container the controller did not create
    pub fn insert_external_container(
        &self,
        name: &str,
        image: &str,
        labels: HashMap<String, String>,
        host_ports: Vec<u16>,
        running: bool,
    ) -> String {
        let id = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let container = FakeContainer {
            id: id.clone(),
            name: name.to_string(),
            image: image.to_string(),
            labels,
            host_ports,
            status: if running {
                ContainerStateStatusEnum::RUNNING
            } else {
                ContainerStateStatusEnum::EXITED
            },
            exit_code: 0,
            error: String::new(),
            logs: Vec::new(),
        };
        let mut state = self.lock();
        state.images.insert(image.to_string());
        state.containers.insert(id.clone(), container);
        id
    }

    pub fn exec_running(&self, exec_id: &str) -> bool {
        self.lock()
            .execs
            .get(exec_id)
            .map(|e| e.running)
            .unwrap_or(false)
    }

    pub fn exec_ids_for(&self, container_id: &str) -> Vec<String> {
        self.lock()
            .execs
            .iter()
            .filter(|(_, e)| e.container_id == container_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn exec_command(&self, exec_id: &str) -> Option<Vec<String>> {
        self.lock().execs.get(exec_id).map(|e| e.cmd.clone())
    }

    /// Last terminal size applied to an exec as (rows, cols)
    pub fn exec_size(&self, exec_id: &str) -> Option<(u16, u16)> {
        self.lock().execs.get(exec_id).and_then(|e| e.size)
    }

    fn spawn_shell(
        &self,
        exec_id: String,
        mut reader: DuplexStream,
        tx: mpsc::UnboundedSender<Result<LogOutput, DockerError>>,
        cancel: CancellationToken,
    ) {
        let runtime = self.clone();
        tokio::spawn(async move {
            let _ = tx.unbounded_send(console("$ "));
            let mut line = Vec::new();
            let mut buf = [0u8; 256];

            let code = 'shell: loop {
                let read = tokio::select! {
                    _ = cancel.cancelled() => break 'shell 129,
                    read = reader.read(&mut buf) => read,
                };
                let n = match read {
                    Ok(0) | Err(_) => break 'shell 0,
                    Ok(n) => n,
                };

                for &byte in &buf[..n] {
                    if byte != b'\r' && byte != b'\n' {
                        line.push(byte);
                        let _ = tx.unbounded_send(console(&String::from_utf8_lossy(&[byte])));
                        continue;
                    }
                    let _ = tx.unbounded_send(console("\r\n"));
                    let command = String::from_utf8_lossy(&line).into_owned();
                    line.clear();
                    let outcome = runtime.lock().interpret(&command);
                    match outcome {
                        Outcome::Exit(code) => break 'shell code,
                        Outcome::Output(text, _) => {
                            if !text.is_empty() {
                                let _ = tx.unbounded_send(console(&text.replace('\n', "\r\n")));
                            }
                            let _ = tx.unbounded_send(console("$ "));
                        }
                    }
                }
            };

            runtime.lock().finish_exec(&exec_id, code);
        });
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    fn endpoint(&self) -> String {
        "memory://".to_string()
    }

    async fn ping(&self) -> Result<(), DockerError> {
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> Result<ContainerCreateResponse, DockerError> {
        let delay = self.lock().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if let Some(message) = state.fail_next_create.take() {
            return Err(server_error(500, message));
        }

        let image = config.image.clone().unwrap_or_default();
        if !state.images.contains(&image) {
            return Err(not_found("image", &image));
        }
        if state.containers.values().any(|c| c.name == name) {
            return Err(server_error(
                409,
                format!("Conflict. The container name \"/{}\" is already in use", name),
            ));
        }

        let host_ports = config
            .host_config
            .as_ref()
            .and_then(|h| h.port_bindings.as_ref())
            .map(|bindings| {
                bindings
                    .values()
                    .flatten()
                    .flatten()
                    .filter_map(|b| b.host_port.as_ref()?.parse().ok())
                    .collect()
            })
            .unwrap_or_default();

        let id = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: name.to_string(),
                image,
                labels: config.labels.clone().unwrap_or_default(),
                host_ports,
                status: ContainerStateStatusEnum::CREATED,
                exit_code: 0,
                error: String::new(),
                logs: Vec::new(),
            },
        );
        state.created_configs.push((name.to_string(), config));

        Ok(ContainerCreateResponse {
            id,
            warnings: Vec::new(),
        })
    }

    async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        let delay = self.lock().start_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        let id = state
            .container_id(id)
            .ok_or_else(|| not_found("container", id))?;
        if state.containers.get(&id).map(|c| &c.status) == Some(&ContainerStateStatusEnum::RUNNING)
        {
            return Err(server_error(304, "container already started"));
        }
        state.boot(&id)
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), DockerError> {
        let mut state = self.lock();
        let id = state
            .container_id(id)
            .ok_or_else(|| not_found("container", id))?;
        state.kill_execs_of(&id);
        let container = state
            .containers
            .get_mut(&id)
            .ok_or_else(|| not_found("container", &id))?;
        if container.status != ContainerStateStatusEnum::RUNNING {
            return Err(server_error(304, "container already stopped"));
        }
        container.status = ContainerStateStatusEnum::EXITED;
        container.exit_code = 0;
        Ok(())
    }

    async fn restart_container(&self, id: &str, _grace: Duration) -> Result<(), DockerError> {
        let mut state = self.lock();
        let id = state
            .container_id(id)
            .ok_or_else(|| not_found("container", id))?;
        state.kill_execs_of(&id);
        state.boot(&id)
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), DockerError> {
        let mut state = self.lock();
        let id = state
            .container_id(id)
            .ok_or_else(|| not_found("container", id))?;
        let running = state.containers.get(&id).map(|c| &c.status)
            == Some(&ContainerStateStatusEnum::RUNNING);
        if running && !force {
            return Err(server_error(
                409,
                "You cannot remove a running container. Stop the container before attempting removal or force remove",
            ));
        }
        state.kill_execs_of(&id);
        state.containers.remove(&id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, DockerError> {
        let mut state = self.lock();
        state.inspect_calls += 1;
        let c = state
            .find_container(id)
            .ok_or_else(|| not_found("container", id))?;

        let running = c.status == ContainerStateStatusEnum::RUNNING;
        Ok(ContainerInspectResponse {
            id: Some(c.id.clone()),
            name: Some(format!("/{}", c.name)),
            image: Some(c.image.clone()),
            state: Some(RuntimeState {
                status: Some(c.status.clone()),
                running: Some(running),
                exit_code: Some(c.exit_code),
                error: Some(c.error.clone()),
                oom_killed: Some(false),
                dead: Some(c.status == ContainerStateStatusEnum::DEAD),
                ..Default::default()
            }),
            config: Some(ContainerConfig {
                image: Some(c.image.clone()),
                labels: Some(c.labels.clone()),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    async fn list_containers(
        &self,
        label: Option<String>,
    ) -> Result<Vec<ContainerSummary>, DockerError> {
        let filter = label.map(|l| match l.split_once('=') {
            Some((k, v)) => (k.to_string(), Some(v.to_string())),
            None => (l, None),
        });

        let state = self.lock();
        let summaries = state
            .containers
            .values()
            .filter(|c| match &filter {
                Some((key, Some(value))) => c.labels.get(key) == Some(value),
                Some((key, None)) => c.labels.contains_key(key),
                None => true,
            })
            .map(|c| ContainerSummary {
                id: Some(c.id.clone()),
                names: Some(vec![format!("/{}", c.name)]),
                image: Some(c.image.clone()),
                labels: Some(c.labels.clone()),
                state: Some(c.status.to_string()),
                ports: Some(
                    c.host_ports
                        .iter()
                        .map(|p| Port {
                            ip: Some("0.0.0.0".to_string()),
                            private_port: *p,
                            public_port: Some(*p),
                            typ: Some(PortTypeEnum::TCP),
                        })
                        .collect(),
                ),
                ..Default::default()
            })
            .collect();
        Ok(summaries)
    }

    fn logs(&self, id: &str, tail: Option<usize>, _follow: bool) -> LogStream {
        let state = self.lock();
        let items: Vec<Result<LogOutput, DockerError>> = match state.find_container(id) {
            Some(c) => {
                let skip = tail.map(|n| c.logs.len().saturating_sub(n)).unwrap_or(0);
                c.logs
                    .iter()
                    .skip(skip)
                    .map(|line| {
                        Ok(LogOutput::StdOut {
                            message: Bytes::from(format!("{}\n", line)),
                        })
                    })
                    .collect()
            }
            None => vec![Err(not_found("container", id))],
        };
        Box::pin(stream::iter(items))
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageInspect, DockerError> {
        if self.lock().images.contains(image) {
            Ok(ImageInspect {
                id: Some(format!("sha256:{}", Uuid::new_v4().simple())),
                repo_tags: Some(vec![image.to_string()]),
                ..Default::default()
            })
        } else {
            Err(not_found("image", image))
        }
    }

    fn pull_image(&self, image: &str) -> PullStream {
        let mut state = self.lock();
        if let Some(message) = state.pull_failures.get(image) {
            return Box::pin(stream::iter(vec![Err(server_error(404, message.clone()))]));
        }
        state.images.insert(image.to_string());

        let layer = Uuid::new_v4().simple().to_string()[..12].to_string();
        let record = |status: &str, current: Option<i64>| CreateImageInfo {
            id: Some(layer.clone()),
            status: Some(status.to_string()),
            progress_detail: current.map(|c| ProgressDetail {
                current: Some(c),
                total: Some(100),
            }),
            ..Default::default()
        };
        let items = vec![
            Ok(record("Pulling fs layer", None)),
            Ok(record("Downloading", Some(40))),
            Ok(record("Downloading", Some(100))),
            Ok(record("Pull complete", None)),
            Ok(CreateImageInfo {
                status: Some(format!("Status: Downloaded newer image for {}", image)),
                ..Default::default()
            }),
        ];
        Box::pin(stream::iter(items))
    }

    async fn create_exec(
        &self,
        container_id: &str,
        options: CreateExecOptions<String>,
    ) -> Result<String, DockerError> {
        let mut state = self.lock();
        let id = state
            .container_id(container_id)
            .ok_or_else(|| not_found("container", container_id))?;
        let running = state.containers.get(&id).map(|c| &c.status)
            == Some(&ContainerStateStatusEnum::RUNNING);
        if !running {
            return Err(server_error(
                409,
                format!("Container {} is not running", container_id),
            ));
        }

        state.next_pid += 1;
        let pid = 100 + state.next_pid;
        let exec_id = Uuid::new_v4().simple().to_string();
        state.execs.insert(
            exec_id.clone(),
            FakeExec {
                container_id: id,
                cmd: options.cmd.unwrap_or_default(),
                interactive: options.attach_stdin.unwrap_or(false),
                started: false,
                running: false,
                exit_code: None,
                pid,
                size: None,
                cancel: CancellationToken::new(),
            },
        );
        Ok(exec_id)
    }

    async fn start_exec(
        &self,
        exec_id: &str,
        options: StartExecOptions,
    ) -> Result<StartExecResults, DockerError> {
        let detach = options.detach;
        let (interactive, line, cancel) = {
            let mut state = self.lock();
            let exec = state
                .execs
                .get_mut(exec_id)
                .ok_or_else(|| not_found("exec instance", exec_id))?;
            if exec.started {
                return Err(server_error(409, "exec instance already started"));
            }
            exec.started = true;
            exec.running = true;
            let (interactive, line, cancel, pid) = (
                exec.interactive,
                command_line(&exec.cmd),
                exec.cancel.clone(),
                exec.pid,
            );

            if interactive {
                if let Some(path) = pidfile_of(&line) {
                    state.pidfiles.insert(path, pid);
                }
            }
            (interactive, line, cancel)
        };

        if interactive && !detach {
            let (input, reader) = tokio::io::duplex(4096);
            let (tx, rx) = mpsc::unbounded();
            self.spawn_shell(exec_id.to_string(), reader, tx, cancel);
            return Ok(StartExecResults::Attached {
                output: Box::pin(rx),
                input: Box::pin(input),
            });
        }

        let mut state = self.lock();
        let line = state.expand(&line);
        let (text, code) = match state.interpret(&line) {
            Outcome::Output(text, code) => (text, code),
            Outcome::Exit(code) => (String::new(), code),
        };
        state.finish_exec(exec_id, code);

        if detach {
            return Ok(StartExecResults::Detached);
        }
        let output: Vec<Result<LogOutput, DockerError>> = if text.is_empty() {
            Vec::new()
        } else if code == 0 {
            vec![Ok(LogOutput::StdOut {
                message: Bytes::from(text),
            })]
        } else {
            vec![Ok(LogOutput::StdErr {
                message: Bytes::from(text),
            })]
        };
        Ok(StartExecResults::Attached {
            output: Box::pin(stream::iter(output)),
            input: Box::pin(tokio::io::sink()),
        })
    }

    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> Result<(), DockerError> {
        let mut state = self.lock();
        let exec = state
            .execs
            .get_mut(exec_id)
            .ok_or_else(|| not_found("exec instance", exec_id))?;
        exec.size = Some((rows, cols));
        Ok(())
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspectResponse, DockerError> {
        let state = self.lock();
        let exec = state
            .execs
            .get(exec_id)
            .ok_or_else(|| not_found("exec instance", exec_id))?;
        Ok(ExecInspectResponse {
            id: Some(exec_id.to_string()),
            container_id: Some(exec.container_id.clone()),
            running: Some(exec.running),
            exit_code: exec.exit_code,
            pid: Some(exec.pid),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;

    async fn running_container(runtime: &InMemoryRuntime) -> String {
        runtime.add_image("alpine:3");
        let config = Config {
            image: Some("alpine:3".to_string()),
            ..Default::default()
        };
        let created = runtime.create_container("box", config).await.unwrap();
        runtime.start_container(&created.id).await.unwrap();
        created.id
    }

    #[tokio::test]
    async fn test_stop_twice_reports_not_modified() {
        let runtime = InMemoryRuntime::new();
        let id = running_container(&runtime).await;

        runtime.stop_container(&id, Duration::from_secs(1)).await.unwrap();
        let err = runtime
            .stop_container(&id, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DockerError::DockerResponseServerError { status_code: 304, .. }
        ));
    }

    #[tokio::test]
    async fn test_scripted_exit_code_is_visible() {
        let runtime = InMemoryRuntime::new();
        runtime.set_behavior("alpine:3", ScriptedBehavior::ExitsWith(3));
        let id = running_container(&runtime).await;

        let inspect = runtime.inspect_container(&id).await.unwrap();
        let state = inspect.state.unwrap();
        assert_eq!(state.status, Some(ContainerStateStatusEnum::EXITED));
        assert_eq!(state.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_interactive_exec_echoes_and_exits() {
        let runtime = InMemoryRuntime::new();
        let id = running_container(&runtime).await;

        let exec_id = runtime
            .create_exec(
                &id,
                CreateExecOptions {
                    cmd: Some(vec!["/bin/bash".to_string()]),
                    attach_stdin: Some(true),
                    tty: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let StartExecResults::Attached { mut output, mut input } =
            runtime
                .start_exec(&exec_id, StartExecOptions::default())
                .await
                .unwrap()
        else {
            panic!("expected attached exec");
        };

        input.write_all(b"echo hi\nexit\n").await.unwrap();

        let mut seen = String::new();
        while let Some(Ok(frame)) = output.next().await {
            seen.push_str(&frame.to_string());
        }
        assert!(seen.contains("hi\r\n"));
        assert!(!runtime.exec_running(&exec_id));
    }

    #[tokio::test]
    async fn test_kill_terminates_shell_by_pid() {
        let runtime = InMemoryRuntime::new();
        let id = running_container(&runtime).await;

        let shell = runtime
            .create_exec(
                &id,
                CreateExecOptions {
                    cmd: Some(vec!["/bin/bash".to_string()]),
                    attach_stdin: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let StartExecResults::Attached { mut output, input: _input } =
            runtime
                .start_exec(&shell, StartExecOptions::default())
                .await
                .unwrap()
        else {
            panic!("expected attached exec");
        };
        let pid = runtime.inspect_exec(&shell).await.unwrap().pid.unwrap();

        let killer = runtime
            .create_exec(
                &id,
                CreateExecOptions {
                    cmd: Some(vec![
                        "/bin/sh".to_string(),
                        "-c".to_string(),
                        format!("kill -HUP {}", pid),
                    ]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        runtime
            .start_exec(
                &killer,
                StartExecOptions {
                    detach: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        while output.next().await.is_some() {}
        let inspect = runtime.inspect_exec(&shell).await.unwrap();
        assert_eq!(inspect.running, Some(false));
        assert_eq!(inspect.exit_code, Some(129));
    }

    #[tokio::test]
    async fn test_wrapped_shell_can_be_killed_through_its_pidfile() {
        let runtime = InMemoryRuntime::new();
        let id = running_container(&runtime).await;

        let shell = runtime
            .create_exec(
                &id,
                CreateExecOptions {
                    cmd: Some(vec![
                        "/bin/sh".to_string(),
                        "-c".to_string(),
                        "echo $$ > /tmp/t.pid; exec /bin/bash".to_string(),
                    ]),
                    attach_stdin: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let StartExecResults::Attached { mut output, input: _input } =
            runtime
                .start_exec(&shell, StartExecOptions::default())
                .await
                .unwrap()
        else {
            panic!("expected attached exec");
        };

        let killer = runtime
            .create_exec(
                &id,
                CreateExecOptions {
                    cmd: Some(vec![
                        "/bin/sh".to_string(),
                        "-c".to_string(),
                        "kill -HUP $(cat /tmp/t.pid) 2>/dev/null; rm -f /tmp/t.pid".to_string(),
                    ]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let detached = StartExecOptions {
            detach: true,
            ..Default::default()
        };
        runtime.start_exec(&killer, detached).await.unwrap();

        while output.next().await.is_some() {}
        assert!(!runtime.exec_running(&shell));
    }

    #[tokio::test]
    async fn test_list_filters_by_label() {
        let runtime = InMemoryRuntime::new();
        let mut labels = HashMap::new();
        labels.insert("playground.managed".to_string(), "true".to_string());
        runtime.insert_external_container("a", "img", labels, vec![5432], true);
        runtime.insert_external_container("b", "img", HashMap::new(), vec![], true);

        let managed = runtime
            .list_containers(Some("playground.managed=true".to_string()))
            .await
            .unwrap();
        assert_eq!(managed.len(), 1);
        assert_eq!(managed[0].ports.as_ref().unwrap()[0].public_port, Some(5432));

        let all = runtime.list_containers(None).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
