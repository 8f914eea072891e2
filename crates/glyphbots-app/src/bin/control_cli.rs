//! `glyphbots-control`: talk to a running glyphbots daemon.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use glyphbots_app::Request;
use owo_colors::OwoColorize;
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(
    name = "glyphbots-control",
    version,
    about = "Interact with a running glyphbots daemon"
)]
struct Cli {
    /// Daemon control address.
    #[arg(long, env = "GLYPHBOTS_CONTROL_ADDR", default_value = "127.0.0.1:7878")]
    addr: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Engine statistics snapshot.
    Status,
    /// Pause the engine after the in-flight generation.
    Pause,
    /// Resume a paused engine.
    Resume,
    /// Stop the engine and shut the daemon down.
    Stop,
    /// Write a checkpoint (defaults to the daemon's checkpoint file).
    Save {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Load a checkpoint; the engine must be stopped.
    Load { path: PathBuf },
    /// Save PNG snapshots of the fittest organisms.
    Top {
        #[arg(default_value_t = 5)]
        count: usize,
    },
    /// Print the recent engine event history.
    History {
        /// Show at most this many events, newest last.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Export summary statistics as JSON.
    Export { path: PathBuf },
    /// Disassemble an organism's bytecode.
    Disasm { id: u64 },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let limit = match &cli.command {
        Command::History { limit } => *limit,
        _ => 0,
    };
    let request = to_request(cli.command);
    let response = send_request(&cli.addr, &request)?;

    let status = response["status"].as_str().unwrap_or("error");
    if status != "ok" {
        let message = response["message"].as_str().unwrap_or("unknown error");
        bail!("{} {}", "daemon error:".red().bold(), message);
    }

    match request {
        Request::Status | Request::Stats => print_stats(&response["data"]),
        Request::History => print_history(&response["events"], limit),
        Request::Top { .. } => print_files(&response["files"]),
        Request::Disasm { .. } => {
            println!("{}", response["listing"].as_str().unwrap_or(""));
        }
        _ => {
            if let Some(message) = response["message"].as_str() {
                println!("{}", message.green());
            }
        }
    }
    Ok(())
}

fn to_request(command: Command) -> Request {
    match command {
        Command::Status => Request::Status,
        Command::Pause => Request::Pause,
        Command::Resume => Request::Resume,
        Command::Stop => Request::Stop,
        Command::Save { path } => Request::Save { path },
        Command::Load { path } => Request::Load { path },
        Command::Top { count } => Request::Top { count },
        Command::History { .. } => Request::History,
        Command::Export { path } => Request::Export { path },
        Command::Disasm { id } => Request::Disasm { id },
    }
}

fn send_request(addr: &str, request: &Request) -> Result<Value> {
    let mut stream =
        TcpStream::connect(addr).with_context(|| format!("connecting to daemon at {addr}"))?;
    let mut payload = serde_json::to_string(request).context("encode request")?;
    payload.push('\n');
    stream
        .write_all(payload.as_bytes())
        .context("send request")?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).context("read response")?;
    serde_json::from_str(&line).context("parse response")
}

fn print_stats(data: &Value) {
    println!("{}", "Engine status".bold().cyan());
    let rows = [
        ("generations", &data["total_generations"]),
        ("runtime (ms)", &data["total_runtime_ms"]),
        ("gens/sec", &data["generations_per_second"]),
        ("running", &data["is_running"]),
        ("paused", &data["is_paused"]),
        ("population", &data["current_population"]),
        ("best fitness", &data["current_best_fitness"]),
        ("avg fitness", &data["current_avg_fitness"]),
    ];
    for (label, value) in rows {
        println!("  {:<14} {}", label.dimmed(), value);
    }
}

fn print_history(events: &Value, limit: usize) {
    let Some(events) = events.as_array() else {
        println!("{}", "no events".yellow());
        return;
    };
    let skip = events.len().saturating_sub(limit.max(1));
    for event in events.iter().skip(skip) {
        let kind = event["kind"].as_str().unwrap_or("?");
        let generation = event["generation"].as_u64().unwrap_or(0);
        let message = event["message"].as_str().unwrap_or("");
        match event["fitness"].as_f64() {
            Some(fitness) => println!(
                "{:>6}  {:<22} {} (fitness {:.3})",
                generation,
                kind.cyan(),
                message,
                fitness
            ),
            None => println!("{:>6}  {:<22} {}", generation, kind.cyan(), message),
        }
    }
}

fn print_files(files: &Value) {
    let Some(files) = files.as_array() else {
        return;
    };
    println!("{}", "Snapshots written:".bold().green());
    for file in files {
        println!("  {}", file.as_str().unwrap_or("?"));
    }
}
