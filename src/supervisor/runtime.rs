use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, info, info_span, warn};

use super::output::OutputServer;
use super::state::{transition, Effect, Escalation, Event, RestartPolicy, SupervisorState};
use crate::config::{
    ServiceConfig, ENV_CHECKUP_SOCKET, ENV_COMMAND_SOCKET, ENV_KEY, ENV_OUT_SOCKET,
};
use crate::control::{
    generate_key, Command, CommandGate, CommandPublisher, CommandSubscriber, ControlMessage,
    ShutdownLatch,
};
use crate::errors::{Result, VigilError};
use crate::event_loop::{self, Flow, LoopHandler, Scheduler, TimerId};
use crate::fingerprint::{diff, snapshot, FingerprintMap, ScanOptions};
use crate::heartbeat::{
    CheckupEvent, CheckupFrame, CheckupLink, CheckupServer, HeartbeatMonitor, Liveness,
    ReplyOutcome, TimeoutOutcome,
};
use crate::process::{LaunchSpec, Launcher, ProcessHandle};
use crate::sink::{EventSink, OutputLine, TracingSink, SECURITY};

/// How often a stopping instance is checked for exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Timers the supervisor schedules on its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    ChangeCheck,
    Heartbeat,
    HeartbeatTimeout(u64),
    Restart,
    /// Check whether the instance being stopped has exited.
    ExitPoll,
    /// The instance being stopped outlived its grace window.
    GraceExpired(Escalation),
}

/// Everything that can arrive in the supervisor's inbox.
#[derive(Debug)]
pub enum Inbound {
    Checkup(CheckupEvent),
    Output(Result<OutputLine>),
    /// A command from the control plane, not yet authenticated.
    Control(Result<ControlMessage>),
    ControlClosed,
    /// SIGINT or SIGTERM delivered to the supervisor process.
    Signal,
}

impl From<CheckupEvent> for Inbound {
    fn from(event: CheckupEvent) -> Self {
        Self::Checkup(event)
    }
}

enum Step {
    Done,
    Follow(Event),
    /// Hold the rest of the batch until the instance has exited.
    Await,
    Exit,
}

/// Keeps one managed instance alive.
///
/// Owns the instance's command, checkup and output endpoints. All state is
/// mutated on the loop thread inside [`run`](Self::run).
pub struct Supervisor<L: Launcher> {
    config: ServiceConfig,
    scan: ScanOptions,
    policy: RestartPolicy,
    launcher: L,
    key: String,
    state: SupervisorState,
    baseline: FingerprintMap,
    heartbeat: HeartbeatMonitor,
    link: Option<CheckupLink>,
    process: Option<L::Handle>,
    launch_failures: u32,
    periodic: Vec<TimerId>,
    restart_timer: Option<TimerId>,
    exit_watch: Vec<TimerId>,
    after_exit: VecDeque<Effect>,
    commands: CommandPublisher,
    checkup: CheckupServer,
    output: OutputServer,
    control: Option<CommandGate>,
    control_link: Option<CommandSubscriber>,
    sink: Arc<dyn EventSink>,
    latch: ShutdownLatch,
    tx: Sender<Inbound>,
    inbox: Receiver<Inbound>,
}

impl<L: Launcher> Supervisor<L> {
    /// Bind the service's endpoints and take the baseline snapshot.
    ///
    /// Fails if the timing is invalid, an endpoint cannot be bound, or the
    /// initial scan of the working directory fails.
    pub fn new(config: ServiceConfig, launcher: L) -> Result<Self> {
        config.timing.validate()?;
        for endpoint in [
            &config.endpoints.command,
            &config.endpoints.checkup,
            &config.endpoints.out,
        ] {
            if let Some(parent) = endpoint.parent() {
                fs::create_dir_all(parent).map_err(|e| VigilError::io(parent, e))?;
            }
        }

        let scan = config.scan_options();
        let baseline = snapshot(&config.working_dir, &scan)?;
        debug!(files = baseline.len(), "baseline snapshot taken");

        let (tx, inbox) = unbounded();
        let key = generate_key();
        let commands = CommandPublisher::bind(&config.endpoints.command, key.clone())?;
        let checkup = CheckupServer::bind(&config.endpoints.checkup, tx.clone())?;
        let output = OutputServer::bind(&config.endpoints.out, tx.clone(), Inbound::Output)?;

        Ok(Self {
            scan,
            policy: RestartPolicy {
                debounce: config.timing.restart_debounce(),
                max_launch_attempts: config.timing.max_launch_attempts,
            },
            heartbeat: HeartbeatMonitor::new(config.timing.heartbeat_timeout()),
            sink: Arc::new(TracingSink::for_source(config.name.clone())),
            config,
            launcher,
            key,
            state: SupervisorState::Stopped,
            baseline,
            link: None,
            process: None,
            launch_failures: 0,
            periodic: Vec::new(),
            restart_timer: None,
            exit_watch: Vec::new(),
            after_exit: VecDeque::new(),
            commands,
            checkup,
            output,
            control: None,
            control_link: None,
            latch: ShutdownLatch::new(),
            tx,
            inbox,
        })
    }

    /// Route events (security rejections, relayed output, status reports)
    /// somewhere other than the log.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Accept `die` and `status-probe` from the control plane when they carry
    /// `key`. Without a control key every control command is rejected.
    pub fn with_control_key(mut self, key: impl Into<String>) -> Self {
        self.control = Some(CommandGate::with_latch(
            key,
            Arc::clone(&self.sink),
            self.latch.clone(),
        ));
        self
    }

    /// Subscribe to the control plane's command bus at `socket`.
    pub fn connect_control(&mut self, socket: &Path) -> Result<()> {
        let subscriber = CommandSubscriber::connect(socket)?;
        self.control_link = Some(subscriber.try_clone()?);
        subscriber.forward(self.tx.clone(), Inbound::Control, Some(Inbound::ControlClosed))?;
        Ok(())
    }

    /// Handle for injecting events, e.g. from a signal handler.
    pub fn sender(&self) -> Sender<Inbound> {
        self.tx.clone()
    }

    /// The per-run key the managed instance must present.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Launch the managed instance and supervise it until stopped.
    pub fn run(mut self) {
        let span = info_span!("supervisor", service = %self.config.name);
        let _guard = span.enter();

        let mut timers = Scheduler::new();
        if self.apply(&mut timers, Event::Start) == Flow::Exit {
            return;
        }
        let inbox = self.inbox.clone();
        event_loop::run(&mut self, &mut timers, &inbox);
        info!("supervisor stopped");
    }

    fn apply(&mut self, timers: &mut Scheduler<Tick>, event: Event) -> Flow {
        let (next, effects) = transition(self.state, event, &self.policy);
        if next != self.state {
            info!(from = %self.state, to = %next, ?event, "state change");
        }
        self.state = next;
        self.run_effects(timers, effects.into())
    }

    /// Execute `effects` in order. Events they produce are applied after the
    /// whole batch; an exit wait parks the rest of the batch.
    fn run_effects(&mut self, timers: &mut Scheduler<Tick>, mut effects: VecDeque<Effect>) -> Flow {
        let mut follow = Vec::new();
        while let Some(effect) = effects.pop_front() {
            match self.execute(timers, effect) {
                Step::Done => {}
                Step::Follow(event) => follow.push(event),
                Step::Await => {
                    self.after_exit = effects;
                    break;
                }
                Step::Exit => return Flow::Exit,
            }
        }
        for event in follow {
            if self.apply(timers, event) == Flow::Exit {
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    fn execute(&mut self, timers: &mut Scheduler<Tick>, effect: Effect) -> Step {
        let now = Instant::now();
        match effect {
            Effect::Launch => match self.launch(timers) {
                Ok(()) => {
                    self.launch_failures = 0;
                    Step::Follow(Event::Launched)
                }
                Err(e) => {
                    self.launch_failures += 1;
                    error!(code = e.code(), error = %e, attempt = self.launch_failures, "launch failed");
                    if self.launch_failures >= self.policy.max_launch_attempts {
                        self.sink.emit("MAIN", "giving up after repeated launch failures");
                    }
                    Step::Follow(Event::LaunchFailed {
                        attempts: self.launch_failures,
                    })
                }
            },
            Effect::ArmTimers => {
                let timing = &self.config.timing;
                self.periodic = vec![
                    timers.every(now, timing.check_interval(), Tick::ChangeCheck),
                    timers.every(now, timing.heartbeat_interval(), Tick::Heartbeat),
                ];
                Step::Done
            }
            Effect::PauseTimers => {
                for id in self.periodic.drain(..) {
                    timers.cancel(id);
                }
                self.heartbeat.pause(timers);
                Step::Done
            }
            Effect::ScheduleRestart { delay } => {
                if let Some(previous) = self.restart_timer.take() {
                    timers.cancel(previous);
                }
                self.restart_timer = Some(timers.once(now, delay, Tick::Restart));
                Step::Done
            }
            Effect::BroadcastShutdown => {
                let reached = self.commands.publish(Command::Die);
                debug!(reached, "broadcast die");
                Step::Done
            }
            Effect::ForceTerminate => {
                if let Some(process) = self.process.as_mut() {
                    warn!(pid = process.pid(), "killing unresponsive instance");
                    if let Err(e) = process.kill() {
                        error!(code = e.code(), error = %e, "failed to kill instance");
                    }
                }
                Step::Done
            }
            Effect::AwaitExit(escalation) => {
                let running = self
                    .process
                    .as_mut()
                    .is_some_and(|p| p.try_exited().is_none());
                if !running {
                    return Step::Done;
                }
                self.cancel_exit_watch(timers);
                let grace = self.config.timing.kill_grace();
                self.exit_watch = vec![
                    timers.every(now, EXIT_POLL_INTERVAL, Tick::ExitPoll),
                    timers.once(now, grace, Tick::GraceExpired(escalation)),
                ];
                Step::Await
            }
            Effect::CancelAll => {
                timers.clear();
                self.heartbeat.reset(timers);
                self.periodic.clear();
                self.restart_timer = None;
                self.exit_watch.clear();
                self.after_exit.clear();
                Step::Done
            }
            Effect::CloseChannels => {
                self.commands.close();
                self.checkup.close();
                self.output.close();
                if let Some(link) = self.link.take() {
                    link.close();
                }
                if let Some(control) = self.control_link.take() {
                    control.close();
                }
                Step::Done
            }
            Effect::Exit => Step::Exit,
        }
    }

    fn cancel_exit_watch(&mut self, timers: &mut Scheduler<Tick>) {
        for id in self.exit_watch.drain(..) {
            timers.cancel(id);
        }
    }

    /// Run whatever was parked behind an exit wait once the instance is gone.
    fn poll_exit(&mut self, timers: &mut Scheduler<Tick>) -> Flow {
        if let Some(process) = self.process.as_mut() {
            match process.try_exited() {
                Some(status) => debug!(pid = process.pid(), %status, "instance exited"),
                None => return Flow::Continue,
            }
        }
        self.cancel_exit_watch(timers);
        let parked = std::mem::take(&mut self.after_exit);
        self.run_effects(timers, parked)
    }

    fn grace_expired(&mut self, timers: &mut Scheduler<Tick>, escalation: Escalation) -> Flow {
        let Some(process) = self.process.as_mut() else {
            return self.poll_exit(timers);
        };
        if process.try_exited().is_some() {
            return self.poll_exit(timers);
        }
        let pid = process.pid();
        match escalation {
            Escalation::TermThenKill => {
                warn!(pid, "instance outlived its grace window, sending SIGTERM");
                if let Err(e) = process.request_stop() {
                    error!(code = e.code(), error = %e, "failed to signal instance");
                }
                let grace = self.config.timing.kill_grace();
                let id = timers.once(Instant::now(), grace, Tick::GraceExpired(Escalation::Kill));
                self.exit_watch.push(id);
            }
            Escalation::Kill => {
                warn!(pid, "instance outlived its grace window, killing");
                if let Err(e) = process.kill() {
                    error!(code = e.code(), error = %e, "failed to kill instance");
                }
            }
        }
        Flow::Continue
    }

    /// Start a new instance. Exit waits settle the previous one beforehand.
    fn launch(&mut self, timers: &mut Scheduler<Tick>) -> Result<()> {
        if let Some(mut previous) = self.process.take() {
            if previous.try_exited().is_none() {
                warn!(pid = previous.pid(), "previous instance still running, killing");
                if let Err(e) = previous.kill() {
                    self.process = Some(previous);
                    return Err(e);
                }
            }
        }

        self.heartbeat.reset(timers);
        if let Some(link) = self.link.take() {
            link.close();
        }

        let endpoints = &self.config.endpoints;
        let spec = LaunchSpec::new(&self.config.command, &self.config.working_dir)
            .envs(&self.config.env)
            .env(ENV_KEY, self.key.clone())
            .env(ENV_COMMAND_SOCKET, endpoints.command.display().to_string())
            .env(ENV_CHECKUP_SOCKET, endpoints.checkup.display().to_string())
            .env(ENV_OUT_SOCKET, endpoints.out.display().to_string());

        let handle = self.launcher.launch(&spec)?;
        info!(pid = handle.pid(), command = %spec, "instance launched");
        self.process = Some(handle);
        Ok(())
    }

    fn check_for_changes(&mut self, timers: &mut Scheduler<Tick>) -> Flow {
        if self.state != SupervisorState::Running {
            return Flow::Continue;
        }
        let current = match snapshot(&self.config.working_dir, &self.scan) {
            Ok(current) => current,
            Err(e) => {
                warn!(code = e.code(), error = %e, "scan failed, keeping previous snapshot");
                return Flow::Continue;
            }
        };

        let changes = diff(&current, &self.baseline);
        if changes.is_empty() {
            return Flow::Continue;
        }
        let paths: Vec<&str> = changes.paths().collect();
        info!(files = ?paths, "source changed, restarting");
        self.sink
            .emit("MAIN", &format!("files changed: {}", paths.join(", ")));
        self.baseline = current;
        self.apply(timers, Event::FilesChanged)
    }

    fn heartbeat_tick(&mut self, timers: &mut Scheduler<Tick>) -> Flow {
        if self.state != SupervisorState::Running {
            return Flow::Continue;
        }
        if let Some(status) = self.process.as_mut().and_then(|p| p.try_exited()) {
            warn!(%status, "instance exited on its own");
            self.sink.emit("MAIN", &format!("instance exited: {status}"));
            return self.apply(timers, Event::ProcessExited);
        }

        let seq = match self
            .heartbeat
            .probe(timers, Instant::now(), Tick::HeartbeatTimeout)
        {
            Ok(seq) => seq,
            Err(e) => {
                error!(code = e.code(), error = %e, "heartbeat not sent");
                return Flow::Continue;
            }
        };

        match self.link.as_mut() {
            Some(link) => {
                if let Err(e) = link.send_probe(seq) {
                    debug!(seq, error = %e, "checkup link lost");
                    self.link = None;
                }
            }
            None => debug!(seq, "no checkup link yet, probe held"),
        }
        Flow::Continue
    }

    fn heartbeat_expired(&mut self, timers: &mut Scheduler<Tick>, seq: u64) -> Flow {
        match self.heartbeat.on_timeout(seq) {
            TimeoutOutcome::Unresponsive => {
                warn!(seq, "instance did not answer heartbeat");
                self.sink.emit("MAIN", "instance unresponsive");
                self.apply(timers, Event::HeartbeatTimedOut)
            }
            TimeoutOutcome::Stale => Flow::Continue,
        }
    }

    fn on_checkup(&mut self, timers: &mut Scheduler<Tick>, event: CheckupEvent) {
        match event {
            CheckupEvent::Connected(mut link) => {
                if let Some(seq) = self.heartbeat.outstanding() {
                    if let Err(e) = link.send_probe(seq) {
                        debug!(seq, error = %e, "held probe not delivered");
                        return;
                    }
                }
                if let Some(previous) = self.link.replace(link) {
                    previous.close();
                }
            }
            CheckupEvent::Frame { link, frame } => {
                if self.link.as_ref().map(CheckupLink::id) != Some(link) {
                    debug!(link, "frame from retired checkup link ignored");
                    return;
                }
                match frame {
                    Ok(CheckupFrame::Ack(seq)) => match self.heartbeat.on_reply(timers, seq) {
                        ReplyOutcome::Accepted => {}
                        ReplyOutcome::Late => debug!(seq, "late heartbeat reply discarded"),
                        ReplyOutcome::Unexpected => warn!(seq, "unexpected heartbeat reply"),
                    },
                    Ok(CheckupFrame::Probe(seq)) => warn!(seq, "instance sent a probe, ignoring"),
                    Err(e) => warn!(code = e.code(), error = %e, "bad checkup frame"),
                }
            }
            CheckupEvent::Disconnected { link } => {
                if self.link.as_ref().map(CheckupLink::id) == Some(link) {
                    debug!(link, "checkup link closed");
                    self.link = None;
                }
            }
        }
    }

    fn on_control(&mut self, timers: &mut Scheduler<Tick>, message: ControlMessage) -> Flow {
        let Some(gate) = self.control.as_ref() else {
            warn!(command = message.command.as_str(), "control command without a control key");
            self.sink.emit(SECURITY, "WRONG_KEY");
            return Flow::Continue;
        };

        let mut accepted = None;
        gate.handle(&message, |command| accepted = Some(command));
        match accepted {
            Some(Command::Die) => {
                self.sink.emit("MAIN", "GOODBYE");
                self.apply(timers, Event::Stop)
            }
            Some(Command::StatusProbe) => {
                self.report_status();
                Flow::Continue
            }
            None => Flow::Continue,
        }
    }

    fn report_status(&self) {
        let pid = self
            .process
            .as_ref()
            .map_or_else(|| "-".to_string(), |p| p.pid().to_string());
        let liveness = match self.heartbeat.liveness() {
            Liveness::Unknown => "unknown",
            Liveness::Alive => "alive",
            Liveness::Unresponsive => "unresponsive",
        };
        self.sink.emit(
            "STATUS",
            &format!("{} pid={pid} liveness={liveness}", self.state),
        );
    }
}

impl<L: Launcher> LoopHandler for Supervisor<L> {
    type Timer = Tick;
    type Message = Inbound;

    fn on_timer(
        &mut self,
        timers: &mut Scheduler<Tick>,
        _id: TimerId,
        timer: Tick,
    ) -> anyhow::Result<Flow> {
        Ok(match timer {
            Tick::ChangeCheck => self.check_for_changes(timers),
            Tick::Heartbeat => self.heartbeat_tick(timers),
            Tick::HeartbeatTimeout(seq) => self.heartbeat_expired(timers, seq),
            Tick::Restart => {
                self.restart_timer = None;
                self.apply(timers, Event::RestartDue)
            }
            Tick::ExitPoll => self.poll_exit(timers),
            Tick::GraceExpired(escalation) => self.grace_expired(timers, escalation),
        })
    }

    fn on_message(
        &mut self,
        timers: &mut Scheduler<Tick>,
        message: Inbound,
    ) -> anyhow::Result<Flow> {
        Ok(match message {
            Inbound::Checkup(event) => {
                self.on_checkup(timers, event);
                Flow::Continue
            }
            Inbound::Output(Ok(line)) => {
                self.sink.emit(&line.category, &line.message);
                Flow::Continue
            }
            Inbound::Output(Err(e)) => {
                warn!(code = e.code(), error = %e, "bad output frame");
                Flow::Continue
            }
            Inbound::Control(Ok(message)) => self.on_control(timers, message),
            Inbound::Control(Err(e)) => {
                warn!(code = e.code(), error = %e, "bad control frame");
                Flow::Continue
            }
            Inbound::ControlClosed => {
                warn!("control plane connection closed");
                Flow::Continue
            }
            Inbound::Signal => {
                if self.latch.trip() {
                    info!("termination signal received");
                    self.apply(timers, Event::Stop)
                } else {
                    Flow::Continue
                }
            }
        })
    }
}
