use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use proxup::cli::{Cli, Command, OutputFormat};
use proxup::config;
use proxup::declare::{self, Stack};
use proxup::error::ProvisionError;
use proxup::export::{self, IpSlots};
use proxup::provider::{self, Provider};
use proxup::settings::ProviderSettings;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("proxup=debug")
    } else {
        EnvFilter::from_default_env()
            .add_directive("proxup=info".parse().expect("valid log directive"))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .init();

    match cli.command {
        Command::Up { ip_first, ip_second } => {
            let slots = IpSlots {
                first: ip_first,
                second: ip_second,
            };
            run_up(&cli, slots).await?;
        }
        Command::Plan => run_plan(&cli)?,
        Command::Validate => run_validate(&cli)?,
    }

    Ok(())
}

async fn run_up(cli: &Cli, slots: IpSlots) -> Result<(), ProvisionError> {
    // Fail on missing credentials before touching the config tree.
    let settings = ProviderSettings::from_env()?;

    let docs = config::load_dir(&cli.config_dir);
    if docs.is_empty() {
        tracing::warn!(path = %cli.config_dir.display(), "no config files found, nothing to do");
        return Ok(());
    }

    let stack = declare::build_stack(&docs)?;
    let provider = provider::create_provider(&settings)?;

    // Downloads first: every VM's optical drive references one of them.
    let mut boot_volumes = Vec::with_capacity(stack.downloads.len());
    for download in &stack.downloads {
        boot_volumes.push(provider.realize_download(download).await?);
    }

    let mut realized = Vec::with_capacity(stack.vms.len());
    for vm in &stack.vms {
        let boot_volume = &boot_volumes[vm.cdrom.file.0];
        realized.push(provider.realize_vm(vm, boot_volume).await?);
    }

    let outputs = export::build_exports(&realized, slots)?;
    match cli.output {
        OutputFormat::Text => print!("{}", export::render_text(&outputs)),
        OutputFormat::Json => println!("{}", export::render_json(&outputs)),
    }

    Ok(())
}

/// Build and print the declaration stack without contacting the cluster.
fn run_plan(cli: &Cli) -> Result<(), ProvisionError> {
    let docs = config::load_dir(&cli.config_dir);
    let stack = declare::build_stack(&docs)?;

    match cli.output {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&stack)
                .map_err(|e| ProvisionError::ConfigParse {
                    path: cli.config_dir.display().to_string(),
                    message: e.to_string(),
                })?;
            println!("{json}");
        }
        OutputFormat::Text => print_plan(&stack),
    }

    Ok(())
}

fn print_plan(stack: &Stack) {
    for download in &stack.downloads {
        println!(
            "download {} ({})",
            download.resource_name,
            download.url.as_deref().unwrap_or("no url"),
        );
    }
    for vm in &stack.vms {
        println!(
            "vm {} (name {}, id {}, {} disks, {} network devices)",
            vm.resource_name,
            vm.name,
            vm.vm_id,
            vm.disks.len(),
            vm.network_devices.len(),
        );
    }
}

/// Validate each config file independently so every broken file is
/// reported, not just the first.
fn run_validate(cli: &Cli) -> Result<(), ProvisionError> {
    let docs = config::load_dir(&cli.config_dir);
    let mut failures = 0usize;

    for doc in &docs {
        match declare::build_stack(std::slice::from_ref(doc)) {
            Ok(stack) => {
                println!(
                    "ok: {} ({} VMs)",
                    doc.path.display(),
                    stack.vms.len()
                );
            }
            Err(e) => {
                failures += 1;
                eprintln!("error: {e}");
            }
        }
    }

    if failures > 0 {
        eprintln!("{failures} of {} config files failed validation", docs.len());
        std::process::exit(1);
    }

    Ok(())
}
