use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use jdwpmux_process::{
    CollectorConfig, Device, DeviceConnector, ProcessNameResolver, ProcessProperties,
    ProcessRegistry, RegistryConfig, TcpConnector,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::cmd::{parse_duration, InfoArgs};
use crate::exit::{process_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT};
use crate::output::{or_unknown, print_fields, print_json, OutputFormat};

const NAME_RETRIES: u32 = 3;
const NAME_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Serialize)]
struct InfoOutput {
    addr: String,
    name: Option<String>,
    #[serde(flatten)]
    properties: ProcessProperties,
}

pub async fn run(args: InfoArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let collect_timeout = parse_duration(&args.collect_timeout)?;
    let connect_timeout = args.connect.timeout()?;
    let addr = args.connect.addr;
    let pid = args.pid;

    let connector: Arc<dyn DeviceConnector> =
        Arc::new(TcpConnector::new(addr).with_connect_timeout(connect_timeout));
    let (_feed, pids) = watch::channel(BTreeSet::from([pid]));
    let device = Device::new(addr.to_string(), connector.clone(), pids);
    let config = RegistryConfig {
        shared: args.connect.shared_config(),
        collector: CollectorConfig {
            start_delay: Duration::ZERO,
            properties_timeout: collect_timeout,
            ..CollectorConfig::default()
        },
        ..RegistryConfig::default()
    };
    let registry = ProcessRegistry::builder(device)
        .with_config(config)
        .build()
        .map_err(|err| process_error("registry setup failed", err))?;

    let result = collect(&registry, connector, pid, timeout).await;
    registry.close();
    let (properties, name) = result?;

    let out = InfoOutput {
        addr: addr.to_string(),
        name,
        properties,
    };
    print_info(&out, format);
    Ok(SUCCESS)
}

async fn collect(
    registry: &ProcessRegistry,
    connector: Arc<dyn DeviceConnector>,
    pid: u32,
    timeout: Duration,
) -> CliResult<(ProcessProperties, Option<String>)> {
    let handle = registry
        .add_processes([pid])
        .map_err(|err| process_error("registry closed", err))?
        .remove(&pid)
        .ok_or_else(|| CliError::new(FAILURE, format!("process {pid} not registered")))?;

    // Surface connection failures now rather than as a collection timeout.
    handle
        .shared_session()
        .await
        .map_err(|err| process_error("connect failed", err))?;

    let mut updates = handle.subscribe_properties();
    let properties = match tokio::time::timeout(timeout, updates.wait_for(|p| p.completed)).await
    {
        Ok(Ok(properties)) => properties.clone(),
        Ok(Err(_)) => return Err(CliError::new(FAILURE, "property collection stopped")),
        Err(_) => {
            return Err(CliError::new(
                TIMEOUT,
                format!("properties not collected after {timeout:?}"),
            ))
        }
    };

    let name = match ProcessNameResolver::new(handle, connector)
        .with_timeout(timeout)
        .retrieve(NAME_RETRIES, NAME_RETRY_DELAY)
        .await
    {
        Ok(name) => Some(name),
        Err(err) => {
            debug!(pid, error = %err, "process name unresolved");
            None
        }
    };
    Ok((properties, name))
}

fn print_info(out: &InfoOutput, format: OutputFormat) {
    let props = &out.properties;
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table | OutputFormat::Pretty => {
            let rows = [
                ("Address", out.addr.clone()),
                ("Name", or_unknown(out.name.as_deref())),
                ("PID", props.pid.to_string()),
                ("Package", or_unknown(props.package_name.as_deref())),
                ("User", or_unknown(props.user_id)),
                ("VM", or_unknown(props.vm_identifier.as_deref())),
                ("ABI", or_unknown(props.abi.as_deref())),
                ("JVM flags", or_unknown(props.jvm_flags.as_deref())),
                ("Native debuggable", props.is_native_debuggable.to_string()),
                ("Waiting for debugger", props.is_waiting_for_debugger.to_string()),
                ("Features", props.features.join(", ")),
            ];
            print_fields("Process Info", &rows, format);
        }
        OutputFormat::Raw => {
            println!("{}", or_unknown(out.name.as_deref()));
        }
    }
}
