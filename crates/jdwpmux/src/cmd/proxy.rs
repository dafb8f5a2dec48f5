use jdwpmux_session::{JdwpSessionProxy, ProxyConfig, ProxyStatus};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cmd::{cancel_on_ctrl_c, ProxyArgs};
use crate::exit::{session_error, CliResult, INTERRUPTED, SUCCESS};
use crate::output::{print_json, OutputFormat};

pub async fn run(args: ProxyArgs, format: OutputFormat) -> CliResult<i32> {
    let shared = args
        .connect
        .connect_shared(args.connect.shared_config())
        .await?;
    let config = ProxyConfig {
        bind_addr: args.listen,
        ..ProxyConfig::default()
    };
    let proxy = JdwpSessionProxy::start(shared.clone(), config)
        .await
        .map_err(|err| session_error("proxy start failed", &err))?;
    info!(listen = %proxy.local_addr(), vm = %args.connect.addr, "proxy listening");

    let stop = CancellationToken::new();
    cancel_on_ctrl_c(stop.clone());

    let mut status = proxy.subscribe_status();
    let mut interrupted = false;
    loop {
        let current = status.borrow_and_update().clone();
        print_status(&current, format);
        tokio::select! {
            _ = stop.cancelled() => {
                interrupted = true;
                break;
            }
            _ = shared.terminated() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    proxy.close();
    shared.close();

    if interrupted {
        return Ok(INTERRUPTED);
    }
    match shared.terminal_error() {
        Some(err) if !err.is_end_of_stream() => Err(session_error("session failed", &err)),
        _ => Ok(SUCCESS),
    }
}

fn print_status(status: &ProxyStatus, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(status),
        OutputFormat::Table | OutputFormat::Pretty => match status.external_debugger {
            Some(debugger) => println!(
                "listening on {}: debugger {} attached",
                status.listen_addr, debugger
            ),
            None => println!("listening on {}: no debugger", status.listen_addr),
        },
        OutputFormat::Raw => println!("{}", status.listen_addr),
    }
}
