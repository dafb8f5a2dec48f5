use serde::Serialize;

use crate::cmd::{parse_duration, GcArgs};
use crate::exit::{session_error, CliResult, SUCCESS};
use crate::output::{print_json, OutputFormat};

#[derive(Serialize)]
struct GcOutput {
    addr: String,
    requested: bool,
}

pub async fn run(args: GcArgs, format: OutputFormat) -> CliResult<i32> {
    let mut config = args.connect.shared_config();
    config.ddms_reply_timeout = parse_duration(&args.reply_timeout)?;
    let shared = args.connect.connect_shared(config).await?;

    let result = shared.ddms_hpgc().await;
    shared.close();
    result.map_err(|err| session_error("gc failed", &err))?;

    let out = GcOutput {
        addr: args.connect.addr.to_string(),
        requested: true,
    };
    match format {
        OutputFormat::Json => print_json(&out),
        _ => println!("garbage collection requested on {}", out.addr),
    }
    Ok(SUCCESS)
}
