// src/bin/frame_shell.rs
//! Line based shell for a Frame. Each line is run on the device and the
//! first print is shown. Lines starting with ':' are shell commands.
//!
//! Usage: frame_shell [SHORT_ID | ADDRESS] [CONFIG.json]

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use framelink::ble::platform::PlatformCentral;
use framelink::{DeviceFilter, Frame, Handlers, SessionConfig};

const HELP: &str = "\
:battery            battery level
:put LOCAL REMOTE   upload a local file
:cat REMOTE         print a remote file
:rm REMOTE          delete a remote file
:break              interrupt the running script
:reset              reset the scripting VM
:quit               disconnect and exit";

async fn shell_command(frame: &Frame, line: &str) -> Result<()> {
    let mut words = line.split_whitespace();
    match (words.next(), words.next(), words.next()) {
        (Some(":battery"), None, None) => {
            println!("{}%", frame.battery_level().await?);
        }
        (Some(":put"), Some(local), Some(remote)) => {
            let data = tokio::fs::read(local)
                .await
                .with_context(|| format!("reading {}", local))?;
            frame.files().write_file(remote, &data, true).await?;
            println!("wrote {} bytes", data.len());
        }
        (Some(":cat"), Some(remote), None) => {
            let data = frame.files().read_file(remote).await?;
            println!("{}", String::from_utf8_lossy(&data));
        }
        (Some(":rm"), Some(remote), None) => {
            if !frame.files().delete_file(remote).await? {
                println!("not removed");
            }
        }
        (Some(":break"), None, None) => frame.session().send_break_signal().await?,
        (Some(":reset"), None, None) => frame.session().send_reset_signal().await?,
        _ => bail!("unknown command\n{}", HELP),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let filter = DeviceFilter::parse(&args.next().unwrap_or_default());
    let config = match args.next() {
        Some(path) => {
            let json = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path))?;
            SessionConfig::from_json(&json).with_context(|| format!("parsing {}", path))?
        }
        None => SessionConfig::default(),
    };

    let central = PlatformCentral::new(config.fallback_mtu).await?;
    let handlers = Handlers::default()
        .on_data(|data| println!("<data {} bytes: {}>", data.len(), hex::encode(data)))
        .on_disconnect(|| eprintln!("<disconnected>"));
    let frame = Frame::new(Arc::new(central), config)
        .with_filter(filter)
        .with_handlers(handlers);

    if let Some(address) = frame.ensure_connected().await? {
        println!("Connected to {}. Type :help for commands.", address);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == ":quit" {
            break;
        }
        if line == ":help" {
            println!("{}", HELP);
            continue;
        }
        let result = if line.starts_with(':') {
            shell_command(&frame, line).await
        } else {
            match frame.run_lua(line, true).await {
                Ok(Some(output)) => {
                    println!("{}", output);
                    Ok(())
                }
                Ok(None) => Ok(()),
                Err(e) => Err(e.into()),
            }
        };
        if let Err(e) = result {
            eprintln!("error: {:#}", e);
        }
    }

    frame.disconnect().await?;
    Ok(())
}
