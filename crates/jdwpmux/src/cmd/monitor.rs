use std::ops::ControlFlow;

use jdwpmux_session::protocol::helo_packet;
use jdwpmux_session::SessionError;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cmd::{cancel_on_ctrl_c, MonitorArgs};
use crate::exit::{session_error, CliResult, INTERRUPTED, SUCCESS};
use crate::output::{print_packet, OutputFormat};

pub async fn run(args: MonitorArgs, format: OutputFormat) -> CliResult<i32> {
    let shared = args
        .connect
        .connect_shared(args.connect.shared_config())
        .await?;

    let stop = CancellationToken::new();
    cancel_on_ctrl_c(stop.clone());

    let mut receiver = shared
        .new_packet_receiver()
        .map_err(|err| session_error("monitor failed", &err))?
        .with_name("monitor")
        .with_cancellation(stop);
    if args.send_helo {
        let sender = shared.clone();
        receiver = receiver.on_activation(move || async move {
            let packet = helo_packet(sender.next_packet_id()?);
            sender.send_packet(&packet).await
        });
    }

    let count = args.count;
    let mut printed = 0usize;
    let result = receiver
        .receive(|packet| {
            print_packet(&packet, format);
            printed = printed.saturating_add(1);
            let flow = match count {
                Some(count) if printed >= count => ControlFlow::Break(()),
                _ => ControlFlow::Continue(()),
            };
            std::future::ready(Ok::<_, SessionError>(flow))
        })
        .await;
    shared.close();

    match result {
        Ok(Some(())) => Ok(SUCCESS),
        Ok(None) => {
            info!(packets = printed, "connection closed");
            Ok(SUCCESS)
        }
        Err(SessionError::Cancelled) => Ok(INTERRUPTED),
        Err(err) => Err(session_error("monitor failed", &err)),
    }
}
