//! The loop driver: waits on the inbox, fires due timers, contains failures.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error};

use super::scheduler::{Scheduler, TimerId};

/// Whether the loop keeps going after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Callbacks invoked by [`run`]. Each call runs to completion before the next.
pub trait LoopHandler {
    type Timer: Clone;
    type Message;

    fn on_timer(
        &mut self,
        timers: &mut Scheduler<Self::Timer>,
        id: TimerId,
        timer: Self::Timer,
    ) -> anyhow::Result<Flow>;

    fn on_message(
        &mut self,
        timers: &mut Scheduler<Self::Timer>,
        message: Self::Message,
    ) -> anyhow::Result<Flow>;
}

/// Drive `handler` until it returns [`Flow::Exit`] or every sender is gone.
///
/// A handler that returns an error or panics is logged and the loop carries
/// on; only an explicit exit stops it.
pub fn run<H: LoopHandler>(
    handler: &mut H,
    timers: &mut Scheduler<H::Timer>,
    inbox: &Receiver<H::Message>,
) {
    loop {
        let now = Instant::now();
        while let Some((id, timer)) = timers.pop_due(now) {
            let flow = contain("timer", || handler.on_timer(timers, id, timer));
            if flow == Flow::Exit {
                return;
            }
        }

        let received = match timers.next_deadline() {
            Some(deadline) => inbox.recv_deadline(deadline),
            None => inbox.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(message) => {
                let flow = contain("message", || handler.on_message(timers, message));
                if flow == Flow::Exit {
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!("event loop inbox closed, exiting");
                return;
            }
        }
    }
}

fn contain<F>(kind: &'static str, callback: F) -> Flow
where
    F: FnOnce() -> anyhow::Result<Flow>,
{
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(flow)) => flow,
        Ok(Err(err)) => {
            error!(handler = kind, error = %format!("{err:#}"), "handler failed, loop continues");
            Flow::Continue
        }
        Err(payload) => {
            error!(handler = kind, panic = %panic_message(payload.as_ref()), "handler panicked, loop continues");
            Flow::Continue
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Tick {
        Periodic,
        Stop,
    }

    #[derive(Default)]
    struct Recorder {
        ticks: u32,
        messages: Vec<&'static str>,
    }

    impl LoopHandler for Recorder {
        type Timer = Tick;
        type Message = &'static str;

        fn on_timer(
            &mut self,
            timers: &mut Scheduler<Tick>,
            _id: TimerId,
            timer: Tick,
        ) -> anyhow::Result<Flow> {
            match timer {
                Tick::Periodic => {
                    self.ticks += 1;
                    if self.ticks == 3 {
                        timers.clear();
                        timers.once(Instant::now(), Duration::from_millis(1), Tick::Stop);
                    }
                    Ok(Flow::Continue)
                }
                Tick::Stop => Ok(Flow::Exit),
            }
        }

        fn on_message(
            &mut self,
            _timers: &mut Scheduler<Tick>,
            message: &'static str,
        ) -> anyhow::Result<Flow> {
            match message {
                "fail" => bail!("handler error"),
                "panic" => panic!("handler bug"),
                "exit" => Ok(Flow::Exit),
                other => {
                    self.messages.push(other);
                    Ok(Flow::Continue)
                }
            }
        }
    }

    #[test]
    fn test_periodic_timer_drives_loop_until_exit() {
        let (_tx, rx) = unbounded();
        let mut timers = Scheduler::new();
        timers.every(Instant::now(), Duration::from_millis(5), Tick::Periodic);

        let mut handler = Recorder::default();
        run(&mut handler, &mut timers, &rx);

        assert_eq!(handler.ticks, 3);
    }

    #[test]
    fn test_errors_and_panics_do_not_stop_loop() {
        let (tx, rx) = unbounded();
        for message in ["one", "fail", "panic", "two", "exit", "never"] {
            tx.send(message).unwrap();
        }

        let mut timers = Scheduler::new();
        let mut handler = Recorder::default();
        run(&mut handler, &mut timers, &rx);

        assert_eq!(handler.messages, vec!["one", "two"]);
    }

    #[test]
    fn test_disconnected_inbox_without_timers_exits() {
        let (tx, rx) = unbounded::<&'static str>();
        drop(tx);

        let mut timers = Scheduler::new();
        let mut handler = Recorder::default();
        run(&mut handler, &mut timers, &rx);

        assert!(handler.messages.is_empty());
    }
}
