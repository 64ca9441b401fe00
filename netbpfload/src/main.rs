use clap::Parser;
use log::{error, info};
use netbpfload::env::RuntimeContext;
use netbpfload::{loader, properties};

/// Loads network eBPF objects into the kernel and pins the resulting maps
/// and programs under /sys/fs/bpf/. Runs once per boot.
#[derive(Parser)]
#[command(name = "netbpfload")]
struct Cli {
    /// Finalization leg: record that programs are loaded, then exit.
    #[arg(value_parser = ["done"])]
    command: Option<String>,
}

fn main() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    if cli.command.as_deref() == Some("done") {
        // we're being re-exec'ed by the platform loader to finalize things
        if !properties::set_property("bpf.progs_loaded", "1") {
            error!("Failed to set bpf.progs_loaded property to 1.");
            std::process::exit(125);
        }
        info!("success.");
        return;
    }

    let ctx = RuntimeContext::detect();
    std::process::exit(loader::run(&ctx) as i32);
}
