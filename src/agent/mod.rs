//! The managed-service side of supervision.
//!
//! A service built on this crate creates one [`ServiceAgent`] from the
//! environment its supervisor set up, then calls [`ServiceAgent::poll`] from
//! its main loop. Heartbeat probes are acknowledged inside `poll`, so a
//! service whose main loop stalls stops answering and gets restarted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use tracing::{debug, warn};

use crate::config::{ENV_CHECKUP_SOCKET, ENV_COMMAND_SOCKET, ENV_KEY, ENV_OUT_SOCKET};
use crate::control::{Command, CommandGate, CommandSubscriber, ControlMessage};
use crate::errors::{Result, VigilError};
use crate::heartbeat::{CheckupFrame, CheckupResponder};
use crate::sink::{EventSink, OutputPublisher};

/// Endpoints and key handed to a managed instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub key: String,
    pub command_socket: PathBuf,
    pub checkup_socket: PathBuf,
    pub out_socket: PathBuf,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source, e.g. a launch spec's environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name).ok_or_else(|| VigilError::InvalidConfig {
                details: format!("{name} is not set; was this process started by vigil?"),
            })
        };
        Ok(Self {
            key: get(ENV_KEY)?,
            command_socket: PathBuf::from(get(ENV_COMMAND_SOCKET)?),
            checkup_socket: PathBuf::from(get(ENV_CHECKUP_SOCKET)?),
            out_socket: PathBuf::from(get(ENV_OUT_SOCKET)?),
        })
    }
}

/// What [`ServiceAgent::poll`] surfaces to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    /// An authenticated `die` arrived. Reported once.
    Shutdown,
    /// An authenticated `status-probe` arrived and was answered.
    StatusProbe,
    /// Both supervisor channels are gone.
    SupervisorLost,
}

enum AgentInbound {
    Probe(u64),
    Stray(CheckupFrame),
    BadFrame(VigilError),
    CheckupClosed,
    Command(Result<ControlMessage>),
    CommandClosed,
}

fn classify(frame: Result<CheckupFrame>) -> AgentInbound {
    match frame {
        Ok(CheckupFrame::Probe(seq)) => AgentInbound::Probe(seq),
        Ok(other) => AgentInbound::Stray(other),
        Err(e) => AgentInbound::BadFrame(e),
    }
}

pub struct ServiceAgent {
    gate: CommandGate,
    inbox: Receiver<AgentInbound>,
    checkup: CheckupResponder,
    commands: CommandSubscriber,
    output: Arc<OutputPublisher>,
}

impl ServiceAgent {
    pub fn from_env() -> Result<Self> {
        Self::connect(&AgentConfig::from_env()?)
    }

    /// Connect to all three supervisor endpoints.
    ///
    /// An unreachable `out` endpoint is tolerated; output then goes to the
    /// local log only.
    pub fn connect(config: &AgentConfig) -> Result<Self> {
        let output = match OutputPublisher::connect(&config.out_socket) {
            Ok(publisher) => publisher,
            Err(e) => {
                warn!(error = %e, "output endpoint unavailable, logging locally");
                OutputPublisher::detached()
            }
        };
        let output = Arc::new(output);
        let sink: Arc<dyn EventSink> = output.clone();

        let (tx, inbox) = unbounded();

        let subscriber = CommandSubscriber::connect(&config.command_socket)?;
        let commands = subscriber.try_clone()?;
        subscriber.forward(tx.clone(), AgentInbound::Command, Some(AgentInbound::CommandClosed))?;

        let checkup = CheckupResponder::connect(&config.checkup_socket)?;
        checkup.forward(tx, classify, Some(AgentInbound::CheckupClosed))?;

        Ok(Self {
            gate: CommandGate::new(config.key.clone(), sink),
            inbox,
            checkup,
            commands,
            output,
        })
    }

    /// Sink that publishes to the supervisor's `out` endpoint.
    pub fn sink(&self) -> Arc<dyn EventSink> {
        self.output.clone()
    }

    pub fn emit(&self, category: &str, message: &str) {
        self.output.emit(category, message);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.gate.latch().is_tripped()
    }

    /// Answer heartbeats and wait up to `timeout` for a command.
    ///
    /// Returns `None` when the timeout passes with nothing for the service
    /// to act on.
    pub fn poll(&mut self, timeout: Duration) -> Option<AgentEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let message = match self.inbox.recv_deadline(deadline) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => return Some(AgentEvent::SupervisorLost),
            };

            match message {
                AgentInbound::Probe(seq) => {
                    if let Err(e) = self.checkup.ack(seq) {
                        debug!(seq, error = %e, "heartbeat ack not delivered");
                    }
                }
                AgentInbound::Stray(frame) => warn!(?frame, "unexpected checkup frame"),
                AgentInbound::BadFrame(e) => warn!(code = e.code(), error = %e, "bad checkup frame"),
                AgentInbound::CheckupClosed => debug!("checkup channel closed"),
                AgentInbound::Command(Ok(message)) => {
                    let mut accepted = None;
                    self.gate.handle(&message, |command| accepted = Some(command));
                    match accepted {
                        Some(Command::Die) => {
                            self.output.emit("MAIN", "GOODBYE");
                            self.close();
                            return Some(AgentEvent::Shutdown);
                        }
                        Some(Command::StatusProbe) => {
                            self.output.emit("STATUS", "yep.");
                            return Some(AgentEvent::StatusProbe);
                        }
                        None => {}
                    }
                }
                AgentInbound::Command(Err(e)) => {
                    warn!(code = e.code(), error = %e, "bad command frame");
                }
                AgentInbound::CommandClosed => warn!("command channel closed by supervisor"),
            }
        }
    }

    /// Close both supervisor channels.
    pub fn close(&self) {
        self.commands.close();
        self.checkup.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::CommandPublisher;
    use crate::heartbeat::{CheckupEvent, CheckupServer};
    use crate::sink::OutputLine;
    use crate::supervisor::OutputServer;
    use std::collections::HashMap;
    use std::thread;
    use tempfile::TempDir;

    struct Harness {
        _temp_dir: TempDir,
        config: AgentConfig,
        publisher: CommandPublisher,
        checkup_events: Receiver<CheckupEvent>,
        _checkup: CheckupServer,
        lines: Receiver<Option<OutputLine>>,
        _output: OutputServer,
    }

    fn harness() -> Harness {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = AgentConfig {
            key: "run-key".to_string(),
            command_socket: temp_dir.path().join("cmd.sock"),
            checkup_socket: temp_dir.path().join("checkup.sock"),
            out_socket: temp_dir.path().join("out.sock"),
        };
        let publisher = CommandPublisher::bind(&config.command_socket, "run-key").unwrap();
        let (checkup_tx, checkup_events) = unbounded();
        let checkup = CheckupServer::bind(&config.checkup_socket, checkup_tx).unwrap();
        let (line_tx, lines) = unbounded();
        let output = OutputServer::bind(&config.out_socket, line_tx, |line| line.ok()).unwrap();
        Harness {
            _temp_dir: temp_dir,
            config,
            publisher,
            checkup_events,
            _checkup: checkup,
            lines,
            _output: output,
        }
    }

    fn wait_for_subscriber(publisher: &CommandPublisher) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while publisher.subscriber_count() == 0 {
            assert!(Instant::now() < deadline, "agent never subscribed");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (ENV_KEY, "k"),
            (ENV_COMMAND_SOCKET, "/run/a-command.sock"),
            (ENV_CHECKUP_SOCKET, "/run/a-checkup.sock"),
            (ENV_OUT_SOCKET, "/run/a-out.sock"),
        ]
        .into_iter()
        .collect();

        let config = AgentConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();
        assert_eq!(config.key, "k");
        assert_eq!(config.checkup_socket, PathBuf::from("/run/a-checkup.sock"));

        let err = AgentConfig::from_lookup(|_| None).unwrap_err();
        assert!(err.to_string().contains(ENV_KEY));
    }

    #[test]
    fn test_poll_acknowledges_probes() {
        let h = harness();
        let mut agent = ServiceAgent::connect(&h.config).expect("Failed to connect agent");

        let mut link = match h.checkup_events.recv_timeout(Duration::from_secs(5)).unwrap() {
            CheckupEvent::Connected(link) => link,
            other => panic!("Expected Connected, got {other:?}"),
        };
        link.send_probe(1).unwrap();

        assert_eq!(agent.poll(Duration::from_millis(200)), None);
        match h.checkup_events.recv_timeout(Duration::from_secs(5)).unwrap() {
            CheckupEvent::Frame { frame, .. } => assert_eq!(frame.unwrap(), CheckupFrame::Ack(1)),
            other => panic!("Expected Frame, got {other:?}"),
        }
    }

    #[test]
    fn test_die_is_reported_once_and_wrong_key_ignored() {
        let h = harness();
        let mut agent = ServiceAgent::connect(&h.config).expect("Failed to connect agent");
        wait_for_subscriber(&h.publisher);

        h.publisher
            .publish_message(&ControlMessage::new("wrong", Command::Die));
        assert_eq!(agent.poll(Duration::from_millis(200)), None);
        assert!(!agent.is_shutting_down());

        let security = h.lines.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(security.category, "SECURITY");
        assert_eq!(security.message, "WRONG_KEY");

        h.publisher.publish(Command::Die);
        h.publisher.publish(Command::Die);
        assert_eq!(agent.poll(Duration::from_secs(5)), Some(AgentEvent::Shutdown));
        assert!(agent.is_shutting_down());

        let goodbye = h.lines.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(goodbye.message, "GOODBYE");
    }

    #[test]
    fn test_status_probe_answers_yep() {
        let h = harness();
        let mut agent = ServiceAgent::connect(&h.config).expect("Failed to connect agent");
        wait_for_subscriber(&h.publisher);

        h.publisher.publish(Command::StatusProbe);
        assert_eq!(agent.poll(Duration::from_secs(5)), Some(AgentEvent::StatusProbe));

        let line = h.lines.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!((line.category.as_str(), line.message.as_str()), ("STATUS", "yep."));
    }
}
