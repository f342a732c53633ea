//! Marlinfeed: reads G-code files in order and feeds them to a printer
//! speaking Marlin's serial protocol, optionally serving an
//! Octoprint-compatible API so slicers can upload and control jobs.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use marlinfeed_core::constants::{DEFAULT_HTTP_PORT, MIN_HTTP_PORT};
use marlinfeed_core::IoErrorPolicy;
use marlinfeed_engine::{
    injection_channel, DirScanner, JobController, JobRequest, PauseSwitch, ProtocolEngine,
    StateHandle,
};
use marlinfeed_server::{create_numbered_dir, listen_addr, ApiContext, HttpServer, PrinterPort};

/// Feeds G-code to Marlin-compatible printers.
///
/// Reads all input files in order and sends the contained G-code to the
/// printer device, which can be a TTY, a Unix domain socket or a
/// host:port address. Pass '-' as an input to read from stdin. An input
/// that is a directory is watched for new G-code files, which print
/// automatically.
#[derive(Debug, Parser)]
#[command(name = "marlinfeed", version)]
struct Cli {
    /// Serve an Octoprint-compatible API that clients access as
    /// <BASE_URL>/api. A port in the URL selects the listen port.
    #[arg(long, value_name = "BASE_URL")]
    api: Option<String>,

    /// Port to listen on for API connections.
    #[arg(short, long)]
    port: Option<u16>,

    /// Only accept API connections from this machine. Combine with a
    /// reverse proxy to add access control or TLS.
    #[arg(long)]
    localhost: bool,

    /// On an input or printer error: 'next' resyncs and takes the next
    /// input, 'quit' terminates. Defaults to 'next' when serving the
    /// API, 'quit' otherwise.
    #[arg(short = 'e', long, value_name = "next|quit")]
    ioerror: Option<String>,

    /// Increase verbosity; may be given multiple times.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Input files or watch directories, followed by the printer device.
    #[arg(value_name = "PATH", required = true)]
    paths: Vec<String>,
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 | 1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let directives = format!(
        "warn,marlinfeed={level},marlinfeed_core={level},marlinfeed_protocol={level},\
         marlinfeed_engine={level},marlinfeed_server={level}"
    );
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Port embedded in a base URL like `http://host:8080/`, if any.
fn port_from_url(url: &str) -> Option<u16> {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let authority = rest.split('/').next()?;
    let (_, port) = authority.rsplit_once(':')?;
    port.parse().ok()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let (inputs, device) = match cli.paths.split_last() {
        Some((device, inputs)) => (inputs, device.as_str()),
        None => bail!("you must provide a path to your printer device"),
    };

    let mut scanner = DirScanner::new();
    let mut requests: Vec<JobRequest> = Vec::new();
    let mut upload_dir: Option<PathBuf> = None;
    for input in inputs {
        if input == "-" {
            requests.push(JobRequest::Stdin);
            continue;
        }
        let meta = std::fs::metadata(input)
            .map_err(|_| marlinfeed_core::Error::BadSource(input.clone()))?;
        if meta.is_dir() {
            scanner.add_dir(input);
            if upload_dir.is_none() {
                upload_dir = Some(PathBuf::from(input));
            }
        } else {
            requests.push(JobRequest::Path(PathBuf::from(input)));
        }
    }

    let serving = cli.api.is_some();
    if !serving && (cli.localhost || cli.port.is_some()) {
        bail!("--localhost and --port don't work without --api");
    }
    // with nothing to print and no API, assume stdin
    if !serving && requests.is_empty() && scanner.is_empty() {
        requests.push(JobRequest::Stdin);
    }

    let policy = match cli.ioerror.as_deref() {
        Some(s) => s.parse::<IoErrorPolicy>()?,
        None if serving => IoErrorPolicy::Next,
        None => IoErrorPolicy::Quit,
    };

    let state = StateHandle::new();
    let pause = PauseSwitch::new();
    let abort = CancellationToken::new();
    let (injector, inject_rx) = injection_channel();

    let http = if let Some(base_url) = &cli.api {
        let mut port = port_from_url(base_url).unwrap_or(DEFAULT_HTTP_PORT);
        if let Some(p) = cli.port {
            port = p;
        }
        if port < MIN_HTTP_PORT {
            return Err(marlinfeed_core::Error::IllegalPort(port as i64).into());
        }
        let upload_dir = match upload_dir {
            Some(dir) => dir,
            None => {
                let dir = create_numbered_dir("/tmp/marlinfeed-")
                    .context("creating upload directory")?;
                scanner.add_dir(&dir);
                dir
            }
        };
        let ctx = ApiContext {
            state: state.clone(),
            injector: injector.clone(),
            pause: pause.clone(),
            upload_dir: upload_dir.clone(),
            base_url: base_url.clone(),
        };
        let server = HttpServer::bind(listen_addr(port, cli.localhost), ctx).await?;
        info!(
            port,
            upload_dir = %upload_dir.display(),
            base_url = %base_url,
            "serving Octoprint API"
        );
        Some(server)
    } else {
        None
    };

    let engine = ProtocolEngine::new(
        PrinterPort::new(device),
        state.clone(),
        pause.clone(),
        abort.clone(),
        inject_rx,
    );
    let mut controller = JobController::new(engine, scanner, policy, serving, abort.clone());
    for request in requests {
        match request {
            JobRequest::Path(path) => controller.queue_path(path),
            JobRequest::Stdin => controller.queue_stdin(),
        }
    }

    if let Some(server) = http {
        tokio::spawn(server.run());
    }

    spawn_signal_handlers(pause, abort);

    controller.run().await?;
    Ok(())
}

/// SIGUSR1 toggles pause; SIGINT/SIGTERM abort the active print (with
/// cooldown) and shut down.
fn spawn_signal_handlers(pause: PauseSwitch, abort: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let Ok(mut usr1) = signal(SignalKind::user_defined1()) else {
            return;
        };
        while usr1.recv().await.is_some() {
            let paused = pause.toggle();
            info!(paused, "pause toggled by SIGUSR1");
        }
    });

    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        info!("shutdown requested, aborting current print");
        abort.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_from_url() {
        assert_eq!(port_from_url("http://my-printer:80"), Some(80));
        assert_eq!(port_from_url("https://my-printer:443/"), Some(443));
        assert_eq!(port_from_url("http://my-printer/"), None);
        assert_eq!(port_from_url("my-printer:6000"), Some(6000));
        assert_eq!(port_from_url("Debug"), None);
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::parse_from([
            "marlinfeed",
            "--ioerror=next",
            "-vv",
            "--api=http://printer:80",
            "upload",
            "/dev/ttyUSB0",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.api.as_deref(), Some("http://printer:80"));
        assert_eq!(cli.paths, vec!["upload", "/dev/ttyUSB0"]);
    }
}
