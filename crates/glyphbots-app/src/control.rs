//! JSON-lines control surface over TCP.
//!
//! One request per connection: the client sends a single
//! `{"command": ...}` object terminated by a newline and receives a single
//! `{"status": "ok" | "error", ...}` object back. The `stop` command shuts
//! down the engine and ends the accept loop.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use glyphbots_core::{BytecodeVm, EvolutionEngine};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

fn default_top_count() -> usize {
    5
}

/// Wire commands accepted by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    Status,
    Stats,
    Pause,
    Resume,
    Stop,
    Save {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    Load {
        path: PathBuf,
    },
    Top {
        #[serde(default = "default_top_count")]
        count: usize,
    },
    History,
    Export {
        path: PathBuf,
    },
    Disasm {
        id: u64,
    },
}

/// Serves engine control requests over a blocking accept loop.
pub struct ControlServer {
    engine: Arc<EvolutionEngine>,
    output_directory: PathBuf,
}

impl ControlServer {
    #[must_use]
    pub fn new(engine: Arc<EvolutionEngine>, output_directory: PathBuf) -> Self {
        Self {
            engine,
            output_directory,
        }
    }

    /// Accepts connections until a `stop` command arrives or the listener
    /// fails.
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr().context("listener address")?;
        info!(%addr, "control server listening");
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(%err, "accept failed");
                    continue;
                }
            };
            match self.handle_client(stream) {
                Ok(shutdown) => {
                    if shutdown {
                        info!("stop command received, leaving accept loop");
                        break;
                    }
                }
                Err(err) => warn!(%err, "client connection failed"),
            }
        }
        Ok(())
    }

    fn handle_client(&self, stream: TcpStream) -> Result<bool> {
        let peer = stream.peer_addr().context("peer address")?;
        debug!(%peer, "client connected");
        let mut reader = BufReader::new(stream.try_clone().context("clone stream")?);
        let mut line = String::new();
        reader.read_line(&mut line).context("read request")?;
        if line.trim().is_empty() {
            return Ok(false);
        }

        let (response, shutdown) = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                info!(?request, "handling command");
                self.dispatch(request)
            }
            Err(err) => (
                json!({"status": "error", "message": format!("bad request: {err}")}),
                false,
            ),
        };

        let mut stream = stream;
        let mut payload = serde_json::to_string(&response).context("encode response")?;
        payload.push('\n');
        stream
            .write_all(payload.as_bytes())
            .context("write response")?;
        Ok(shutdown)
    }

    fn dispatch(&self, request: Request) -> (Value, bool) {
        match request {
            Request::Status | Request::Stats => {
                let stats = self.engine.get_stats();
                match serde_json::to_value(&stats) {
                    Ok(data) => (json!({"status": "ok", "data": data}), false),
                    Err(err) => (
                        json!({"status": "error", "message": err.to_string()}),
                        false,
                    ),
                }
            }
            Request::Pause => {
                let paused = self.engine.pause();
                (
                    status_response(
                        paused,
                        "Engine paused.",
                        "Failed to pause engine (not running or already paused).",
                    ),
                    false,
                )
            }
            Request::Resume => {
                let resumed = self.engine.resume();
                (
                    status_response(
                        resumed,
                        "Engine resumed.",
                        "Failed to resume engine (not running or not paused).",
                    ),
                    false,
                )
            }
            Request::Stop => {
                self.engine.stop();
                (json!({"status": "ok", "message": "Engine stopping."}), true)
            }
            Request::Save { path } => {
                let saved = self.engine.save_state(path.as_deref());
                (
                    status_response(saved, "State saved.", "Failed to save state."),
                    false,
                )
            }
            Request::Load { path } => {
                let loaded = self.engine.load_state(&path);
                (
                    status_response(
                        loaded,
                        "State loaded.",
                        "Failed to load state. Is the engine stopped?",
                    ),
                    false,
                )
            }
            Request::Top { count } => self.save_top_phenotypes(count),
            Request::History => {
                let events = self.engine.get_history();
                match serde_json::to_value(&events) {
                    Ok(events) => (json!({"status": "ok", "events": events}), false),
                    Err(err) => (
                        json!({"status": "error", "message": err.to_string()}),
                        false,
                    ),
                }
            }
            Request::Export { path } => {
                let exported = self.engine.export_data(&path);
                (
                    status_response(exported, "Data exported.", "Failed to export data."),
                    false,
                )
            }
            Request::Disasm { id } => self.disassemble_organism(id),
        }
    }

    fn save_top_phenotypes(&self, count: usize) -> (Value, bool) {
        let environment = self.engine.get_environment();
        let fittest = environment.get_top_fittest(count);
        if fittest.is_empty() {
            return (
                json!({"status": "error", "message": "Population is empty."}),
                false,
            );
        }
        let mut files = Vec::new();
        for organism in &fittest {
            match crate::snapshot::save_phenotype_png(&self.output_directory, organism) {
                Ok(path) => files.push(path.display().to_string()),
                Err(err) => {
                    return (
                        json!({"status": "error", "message": format!("snapshot failed: {err}")}),
                        false,
                    );
                }
            }
        }
        (json!({"status": "ok", "files": files}), false)
    }

    fn disassemble_organism(&self, id: u64) -> (Value, bool) {
        let environment = self.engine.get_environment();
        let Some(organism) = environment.get_organism(id) else {
            return (
                json!({"status": "error", "message": format!("no organism with id {id}")}),
                false,
            );
        };
        let vm = BytecodeVm::new(environment.get_full_config().vm);
        let listing = vm.disassemble(&organism.bytecode());
        (
            json!({"status": "ok", "id": id, "listing": listing}),
            false,
        )
    }
}

fn status_response(success: bool, ok_message: &str, error_message: &str) -> Value {
    if success {
        json!({"status": "ok", "message": ok_message})
    } else {
        json!({"status": "error", "message": error_message})
    }
}
