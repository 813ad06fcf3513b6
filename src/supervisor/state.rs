//! Supervisor lifecycle as a pure transition function.
//!
//! `transition` never touches processes, sockets or timers. It returns the
//! next state and an ordered list of effects for the runtime to carry out.

use std::fmt;
use std::time::Duration;

/// Upper bound on the delay between launch retries.
pub const MAX_LAUNCH_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartCause {
    FilesChanged,
    Unresponsive,
    Exited,
    LaunchFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Restarting(RestartCause),
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Restarting(cause) => write!(f, "restarting ({cause:?})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Start,
    Launched,
    /// A launch attempt failed; `attempts` counts consecutive failures.
    LaunchFailed { attempts: u32 },
    FilesChanged,
    HeartbeatTimedOut,
    ProcessExited,
    RestartDue,
    Stop,
}

/// What to do when an instance outlives its grace window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// SIGKILL straight away.
    Kill,
    /// SIGTERM, then SIGKILL after a second grace window.
    TermThenKill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Start a new instance. The previous one has already exited.
    Launch,
    /// Arm the periodic change-check and heartbeat timers.
    ArmTimers,
    /// Cancel the periodic timers and any outstanding probe.
    PauseTimers,
    ScheduleRestart { delay: Duration },
    /// Publish an authenticated `die` to the managed instance.
    BroadcastShutdown,
    /// Kill the managed instance immediately.
    ForceTerminate,
    /// Hold the remaining effects until the managed instance has exited,
    /// escalating once the grace window runs out.
    AwaitExit(Escalation),
    CancelAll,
    CloseChannels,
    Exit,
}

/// Knobs the transition function needs from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub debounce: Duration,
    pub max_launch_attempts: u32,
}

impl RestartPolicy {
    /// Delay before retrying after the `attempts`-th consecutive launch failure.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(16);
        self.debounce
            .saturating_mul(1u32 << shift)
            .min(MAX_LAUNCH_BACKOFF)
    }
}

fn stop_effects() -> Vec<Effect> {
    vec![
        Effect::CancelAll,
        Effect::BroadcastShutdown,
        Effect::AwaitExit(Escalation::TermThenKill),
        Effect::CloseChannels,
        Effect::Exit,
    ]
}

pub fn transition(
    state: SupervisorState,
    event: Event,
    policy: &RestartPolicy,
) -> (SupervisorState, Vec<Effect>) {
    use Event::*;
    use SupervisorState::*;

    match (state, event) {
        (Stopped, Start) => (Starting, vec![Effect::Launch]),

        (Stopped, _) => (Stopped, Vec::new()),
        (_, Stop) => (Stopped, stop_effects()),

        (Starting, Launched) => (Running, vec![Effect::ArmTimers]),
        (Starting, LaunchFailed { attempts }) if attempts >= policy.max_launch_attempts => {
            (Stopped, stop_effects())
        }
        (Starting, LaunchFailed { attempts }) => (
            Restarting(RestartCause::LaunchFailed),
            vec![Effect::ScheduleRestart {
                delay: policy.backoff(attempts),
            }],
        ),

        (Running, FilesChanged) => (
            Restarting(RestartCause::FilesChanged),
            vec![
                Effect::PauseTimers,
                Effect::BroadcastShutdown,
                Effect::AwaitExit(Escalation::Kill),
                Effect::ScheduleRestart {
                    delay: policy.debounce,
                },
            ],
        ),
        (Running, HeartbeatTimedOut) => (
            Restarting(RestartCause::Unresponsive),
            vec![
                Effect::PauseTimers,
                Effect::ForceTerminate,
                Effect::AwaitExit(Escalation::Kill),
                Effect::ScheduleRestart {
                    delay: policy.debounce,
                },
            ],
        ),
        (Running, ProcessExited) => (
            Restarting(RestartCause::Exited),
            vec![
                Effect::PauseTimers,
                Effect::ScheduleRestart {
                    delay: policy.debounce,
                },
            ],
        ),

        (Restarting(_), RestartDue) => (Starting, vec![Effect::Launch]),

        // Triggers while restarting or starting, and anything out of order, are no-ops.
        (state, _) => (state, Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SupervisorState::*;

    fn policy() -> RestartPolicy {
        RestartPolicy {
            debounce: Duration::from_millis(150),
            max_launch_attempts: 3,
        }
    }

    #[test]
    fn test_start_then_launch_arms_timers() {
        let (state, effects) = transition(Stopped, Event::Start, &policy());
        assert_eq!(state, Starting);
        assert_eq!(effects, vec![Effect::Launch]);

        let (state, effects) = transition(state, Event::Launched, &policy());
        assert_eq!(state, Running);
        assert_eq!(effects, vec![Effect::ArmTimers]);
    }

    #[test]
    fn test_files_changed_broadcasts_die() {
        let (state, effects) = transition(Running, Event::FilesChanged, &policy());
        assert_eq!(state, Restarting(RestartCause::FilesChanged));
        assert!(effects.contains(&Effect::BroadcastShutdown));
        assert!(!effects.contains(&Effect::ForceTerminate));
        assert_eq!(effects[0], Effect::PauseTimers);
    }

    #[test]
    fn test_restart_waits_for_exit_before_debounce() {
        for event in [Event::FilesChanged, Event::HeartbeatTimedOut] {
            let (_, effects) = transition(Running, event, &policy());
            let waits = effects
                .iter()
                .position(|e| *e == Effect::AwaitExit(Escalation::Kill))
                .expect("restart does not wait for the old instance");
            let schedules = effects
                .iter()
                .position(|e| matches!(e, Effect::ScheduleRestart { .. }))
                .unwrap();
            assert!(waits < schedules);
        }
    }

    #[test]
    fn test_heartbeat_timeout_force_terminates() {
        let (state, effects) = transition(Running, Event::HeartbeatTimedOut, &policy());
        assert_eq!(state, Restarting(RestartCause::Unresponsive));
        assert_eq!(
            effects,
            vec![
                Effect::PauseTimers,
                Effect::ForceTerminate,
                Effect::AwaitExit(Escalation::Kill),
                Effect::ScheduleRestart {
                    delay: Duration::from_millis(150)
                },
            ]
        );
    }

    #[test]
    fn test_second_trigger_while_restarting_is_noop() {
        let restarting = Restarting(RestartCause::FilesChanged);
        for event in [Event::FilesChanged, Event::HeartbeatTimedOut, Event::ProcessExited] {
            let (state, effects) = transition(restarting, event, &policy());
            assert_eq!(state, restarting);
            assert!(effects.is_empty());
        }
    }

    #[test]
    fn test_restart_due_relaunches() {
        let (state, effects) = transition(
            Restarting(RestartCause::Unresponsive),
            Event::RestartDue,
            &policy(),
        );
        assert_eq!(state, Starting);
        assert_eq!(effects, vec![Effect::Launch]);
    }

    #[test]
    fn test_stop_from_any_live_state() {
        for state in [Starting, Running, Restarting(RestartCause::Exited)] {
            let (next, effects) = transition(state, Event::Stop, &policy());
            assert_eq!(next, Stopped);
            assert_eq!(effects.last(), Some(&Effect::Exit));
            assert_eq!(effects.first(), Some(&Effect::CancelAll));
            assert!(effects.contains(&Effect::AwaitExit(Escalation::TermThenKill)));
        }
        let (next, effects) = transition(Stopped, Event::Stop, &policy());
        assert_eq!(next, Stopped);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_launch_failures_back_off_then_give_up() {
        let (state, effects) = transition(Starting, Event::LaunchFailed { attempts: 1 }, &policy());
        assert_eq!(state, Restarting(RestartCause::LaunchFailed));
        assert_eq!(
            effects,
            vec![Effect::ScheduleRestart {
                delay: Duration::from_millis(150)
            }]
        );

        let (_, effects) = transition(Starting, Event::LaunchFailed { attempts: 2 }, &policy());
        assert_eq!(
            effects,
            vec![Effect::ScheduleRestart {
                delay: Duration::from_millis(300)
            }]
        );

        let (state, effects) = transition(Starting, Event::LaunchFailed { attempts: 3 }, &policy());
        assert_eq!(state, Stopped);
        assert_eq!(effects.last(), Some(&Effect::Exit));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RestartPolicy {
            debounce: Duration::from_secs(10),
            max_launch_attempts: 100,
        };
        assert_eq!(policy.backoff(50), MAX_LAUNCH_BACKOFF);
    }
}
