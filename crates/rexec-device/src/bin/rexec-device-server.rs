//! Standalone device server.
//!
//! ```text
//! rexec-device-server --listen 127.0.0.1:9190 --arch v68
//! ```

use std::process;

use clap::Parser;

use rexec_device::{DeviceConfig, DeviceServer};
use rexec_tracing::{init_global_tracing, TracingConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve a simulated accelerator over TCP", long_about = None)]
struct Cli {
    /// Address to listen on.
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:9190")]
    listen: String,
    /// Accelerator architecture revision.
    #[arg(long, value_name = "ARCH", default_value = "v68", conflicts_with = "host_cpu")]
    arch: String,
    /// Serve a host CPU device instead of an accelerator.
    #[arg(long)]
    host_cpu: bool,
    /// Global memory capacity in bytes.
    #[arg(long, value_name = "BYTES")]
    default_capacity: Option<usize>,
    /// Scratch memory capacity in bytes.
    #[arg(long, value_name = "BYTES")]
    scratch_capacity: Option<usize>,
}

fn main() {
    let cli = Cli::parse();

    if let Err(err) = init_global_tracing(&TracingConfig::from_env()) {
        eprintln!("error[tracing]: {err}");
        process::exit(1);
    }

    let mut config = if cli.host_cpu {
        DeviceConfig::host_cpu()
    } else {
        DeviceConfig::accelerator(cli.arch)
    };
    if let Some(bytes) = cli.default_capacity {
        config = config.with_default_capacity(bytes);
    }
    if let Some(bytes) = cli.scratch_capacity {
        config = config.with_scratch_capacity(bytes);
    }

    let server = match DeviceServer::bind(&cli.listen, config) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("error[bind]: {err}");
            process::exit(1);
        }
    };
    if let Err(err) = server.serve() {
        eprintln!("error[serve]: {err}");
        process::exit(1);
    }
}
