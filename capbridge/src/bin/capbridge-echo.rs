//! Reference capability worker.
//!
//! Usage: capbridge-echo <port> [service] [--unsupported]
//!
//! `ping` and `deferred-result` commands come back as `pong` with every
//! field of the request and `echoed` naming the request action. `crash`
//! exits the process. With `--unsupported` the worker reports a broadcast
//! failure instead of serving.

use anyhow::Context;
use capbridge::bridge::protocol::{Action, Command, SessionId};
use capbridge::worker::{ServiceHandler, Worker, report_failure};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

struct Echo;

impl ServiceHandler for Echo {
    fn on_start(&mut self, _session: SessionId, _cmd: &Command) -> Command {
        Command::new(Action::StartedService)
            .with_field("extension", "echo")
    }

    fn handle(&mut self, session: SessionId, cmd: Command) -> Vec<Command> {
        let action = cmd.action.to_string();
        match action.as_str() {
            "ping" | "deferred-result" => {
                let echoed = action.clone();
                let mut reply = cmd;
                reply.action = "pong".into();
                vec![reply.with_field("echoed", echoed)]
            }
            "crash" => {
                tracing::warn!(session_id = %session, "Crash requested");
                std::process::exit(3);
            }
            _ => vec![Command::new("error").with_description("Unknown action.")],
        }
    }
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("CAPBRIDGE_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("capbridge={level},capbridge_echo={level}"))
    };

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let port: u16 = args
        .next()
        .context("missing port argument")?
        .parse()
        .context("port must be a number")?;
    let mut service = "echo".to_string();
    let mut unsupported = false;
    for arg in args {
        match arg.as_str() {
            "--unsupported" => unsupported = true,
            _ => service = arg,
        }
    }

    if unsupported {
        report_failure(port, "service not supported on this platform")
            .await
            .context("failed to report unsupported service")?;
        return Ok(());
    }

    Worker::new(service, Echo)
        .run(port)
        .await
        .with_context(|| format!("worker on port {port} failed"))?;
    Ok(())
}
