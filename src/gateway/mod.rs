//! Bounded-timeout request/reply to a peer service.
//!
//! A [`PeerCallGateway`] owns at most one channel to its peer. A call that
//! times out or breaks leaves the channel in an unknown state, so the channel
//! is thrown away and a fresh one is opened before the next call.

pub mod frontend;
pub mod session;
mod unix;

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::errors::VigilError;

pub use unix::{PeerServer, UnixChannel, UnixConnector};

/// Why a peer call produced no reply.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("peer did not reply within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("peer channel failed: {0}")]
    Channel(#[source] VigilError),
}

/// One request/reply connection to a peer.
pub trait PeerChannel: Send {
    fn send(&mut self, seq: u64, payload: &[u8]) -> crate::errors::Result<()>;

    /// Wait until `deadline` for the next reply frame, whatever its sequence.
    /// A deadline miss must be reported as an error for which
    /// [`VigilError::is_timeout`] holds.
    fn recv(&mut self, deadline: Instant) -> crate::errors::Result<(u64, Vec<u8>)>;

    fn close(&mut self);
}

/// Opens fresh channels to the same peer.
pub trait Connector: Send {
    type Channel: PeerChannel;

    fn connect(&mut self) -> crate::errors::Result<Self::Channel>;
}

pub struct PeerCallGateway<C: Connector> {
    connector: C,
    channel: Option<C::Channel>,
    next_seq: u64,
    generation: u64,
}

impl<C: Connector> PeerCallGateway<C> {
    /// Create the gateway and try to open the first channel. A failed connect
    /// is not an error here; the next call retries.
    pub fn new(connector: C) -> Self {
        let mut gateway = Self {
            connector,
            channel: None,
            next_seq: 0,
            generation: 0,
        };
        gateway.reopen();
        gateway
    }

    /// Identity of the current channel. Changes every time one is opened.
    pub fn channel_id(&self) -> Option<u64> {
        self.channel.as_ref().map(|_| self.generation)
    }

    pub fn call(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, CallError> {
        let deadline = Instant::now() + timeout;
        if self.channel.is_none() {
            self.reopen();
        }
        let Some(channel) = self.channel.as_mut() else {
            return Err(CallError::Channel(VigilError::ChannelDesync {
                channel: "peer",
                details: "no channel to peer".to_string(),
            }));
        };

        self.next_seq += 1;
        match exchange(channel, self.next_seq, request, deadline) {
            Ok(payload) => Ok(payload),
            Err(e) => {
                let timed_out = e.is_timeout();
                self.discard(&e);
                if timed_out {
                    Err(CallError::Timeout {
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    })
                } else {
                    Err(CallError::Channel(e))
                }
            }
        }
    }

    fn discard(&mut self, cause: &VigilError) {
        if let Some(mut channel) = self.channel.take() {
            warn!(code = cause.code(), error = %cause, generation = self.generation, "discarding peer channel");
            channel.close();
        }
        self.reopen();
    }

    fn reopen(&mut self) {
        match self.connector.connect() {
            Ok(channel) => {
                self.generation += 1;
                self.channel = Some(channel);
            }
            Err(e) => {
                debug!(code = e.code(), error = %e, "peer connect failed, will retry on next call");
            }
        }
    }
}

/// Send one request and wait for the reply carrying the same sequence.
fn exchange<P: PeerChannel>(
    channel: &mut P,
    seq: u64,
    request: &[u8],
    deadline: Instant,
) -> crate::errors::Result<Vec<u8>> {
    channel.send(seq, request)?;
    loop {
        match channel.recv(deadline)? {
            (reply_seq, payload) if reply_seq == seq => return Ok(payload),
            (reply_seq, _) if reply_seq < seq => debug!(reply_seq, seq, "stale reply discarded"),
            (reply_seq, _) => {
                return Err(VigilError::ChannelDesync {
                    channel: "peer",
                    details: format!("reply for seq {reply_seq} while waiting for {seq}"),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Replies scripted per channel; an empty script means the peer is silent.
    #[derive(Clone, Default)]
    struct Script {
        channels: Arc<Mutex<VecDeque<VecDeque<(u64, Vec<u8>)>>>>,
        opened: Arc<Mutex<u32>>,
        closed: Arc<Mutex<u32>>,
    }

    struct FakeChannel {
        replies: VecDeque<(u64, Vec<u8>)>,
        closed: Arc<Mutex<u32>>,
        fail_send: bool,
    }

    impl PeerChannel for FakeChannel {
        fn send(&mut self, _seq: u64, _payload: &[u8]) -> crate::errors::Result<()> {
            if self.fail_send {
                return Err(VigilError::Transport {
                    context: "fake send",
                    source: std::io::Error::from(std::io::ErrorKind::BrokenPipe),
                });
            }
            Ok(())
        }

        fn recv(&mut self, _deadline: Instant) -> crate::errors::Result<(u64, Vec<u8>)> {
            self.replies.pop_front().ok_or(VigilError::Timeout {
                operation: "fake recv",
                timeout_ms: 0,
            })
        }

        fn close(&mut self) {
            *self.closed.lock().unwrap() += 1;
        }
    }

    struct FakeConnector {
        script: Script,
        fail_send: bool,
    }

    impl Connector for FakeConnector {
        type Channel = FakeChannel;

        fn connect(&mut self) -> crate::errors::Result<FakeChannel> {
            *self.script.opened.lock().unwrap() += 1;
            let replies = self
                .script
                .channels
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();
            Ok(FakeChannel {
                replies,
                closed: Arc::clone(&self.script.closed),
                fail_send: self.fail_send,
            })
        }
    }

    fn gateway(channels: Vec<Vec<(u64, &str)>>) -> (PeerCallGateway<FakeConnector>, Script) {
        let script = Script::default();
        {
            let mut queue = script.channels.lock().unwrap();
            for replies in channels {
                queue.push_back(replies.into_iter().map(|(s, p)| (s, p.as_bytes().to_vec())).collect());
            }
        }
        let connector = FakeConnector {
            script: script.clone(),
            fail_send: false,
        };
        (PeerCallGateway::new(connector), script)
    }

    #[test]
    fn test_reply_reuses_channel() {
        let (mut gw, script) = gateway(vec![vec![(1, "one"), (2, "two")]]);
        let id = gw.channel_id();

        assert_eq!(gw.call(b"a", Duration::from_millis(100)).unwrap(), b"one");
        assert_eq!(gw.call(b"b", Duration::from_millis(100)).unwrap(), b"two");
        assert_eq!(gw.channel_id(), id);
        assert_eq!(*script.opened.lock().unwrap(), 1);
    }

    #[test]
    fn test_timeout_replaces_channel() {
        let (mut gw, script) = gateway(vec![vec![], vec![(2, "fresh")]]);
        let first = gw.channel_id();

        let err = gw.call(b"a", Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, CallError::Timeout { timeout_ms: 100 }));
        assert_ne!(gw.channel_id(), first);
        assert_eq!(*script.closed.lock().unwrap(), 1);

        assert_eq!(gw.call(b"b", Duration::from_millis(100)).unwrap(), b"fresh");
    }

    #[test]
    fn test_stale_reply_is_skipped() {
        let (mut gw, _) = gateway(vec![vec![(1, "late"), (2, "current")]]);
        gw.next_seq = 1;

        assert_eq!(gw.call(b"x", Duration::from_millis(100)).unwrap(), b"current");
    }

    #[test]
    fn test_future_sequence_is_desync() {
        let (mut gw, _) = gateway(vec![vec![(7, "??")]]);
        let first = gw.channel_id();

        match gw.call(b"x", Duration::from_millis(100)).unwrap_err() {
            CallError::Channel(e) => assert_eq!(e.code(), "VGL-2003"),
            other => panic!("Expected channel error, got {other:?}"),
        }
        assert_ne!(gw.channel_id(), first);
    }

    #[test]
    fn test_send_failure_is_channel_error() {
        let script = Script::default();
        let mut gw = PeerCallGateway::new(FakeConnector {
            script: script.clone(),
            fail_send: true,
        });

        let err = gw.call(b"x", Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, CallError::Channel(_)));
        assert_eq!(*script.opened.lock().unwrap(), 2);
    }
}
