//! Admin connection handling.

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::debug;

use super::super::protocol::{Request, Response};
use super::fleet::Fleet;
use crate::process::Launcher;
use crate::wire::{read_message, write_message};

/// Serve one admin client until it disconnects or asks the daemon to stop.
pub fn handle_client_connection<L: Launcher>(
    mut stream: UnixStream,
    shutdown_flag: Arc<AtomicBool>,
    fleet: Arc<Mutex<Fleet<L>>>,
) -> Result<()> {
    loop {
        let request: Request = match read_message(&mut stream) {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, "admin client disconnected");
                break;
            }
        };

        match request {
            Request::Ping => {
                write_message(&mut stream, &Response::Pong)?;
            }
            Request::Status => {
                let response = match fleet.lock() {
                    Ok(mut fleet) => Response::Status {
                        services: fleet.status(),
                    },
                    Err(_) => Response::Error {
                        message: "Failed to acquire fleet lock".to_string(),
                    },
                };
                write_message(&mut stream, &response)?;
            }
            Request::Stop => {
                write_message(&mut stream, &Response::Ok)?;
                shutdown_flag.store(true, Ordering::Relaxed);
                break;
            }
        }
    }

    Ok(())
}
