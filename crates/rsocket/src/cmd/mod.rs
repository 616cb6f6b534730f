use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use rsocket_transport::Endpoint;

use crate::exit::{transport_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod request;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an echo responder.
    Serve(ServeArgs),
    /// Send one request and print what comes back.
    Request(RequestArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Request(args) => request::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Endpoint to bind (socket path, unix:PATH, tcp://HOST:PORT or HOST:PORT).
    pub endpoint: String,
    /// Accept resumable sessions and RESUME.
    #[arg(long)]
    pub resumable: bool,
    /// Items emitted for each request-stream.
    #[arg(long, default_value = "3")]
    pub stream_count: u32,
    /// Exit once this many sessions have ended.
    #[arg(long)]
    pub max_sessions: Option<usize>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Interaction {
    Response,
    Fnf,
    Stream,
}

#[derive(Args, Debug)]
pub struct RequestArgs {
    /// Endpoint to connect to.
    pub endpoint: String,
    #[arg(long, short = 'i', value_enum, default_value = "response")]
    pub interaction: Interaction,
    /// Raw string payload.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read payload data from file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Metadata string sent with the payload.
    #[arg(long)]
    pub metadata: Option<String>,
    /// Items requested for a request-stream.
    #[arg(long, default_value = "16")]
    pub request_n: u32,
    /// Maximum time to wait for the response (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_endpoint(input: &str) -> CliResult<Endpoint> {
    input
        .parse()
        .map_err(|err| transport_error("invalid endpoint", err))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        _ => Duration::from_secs(value),
    })
}
