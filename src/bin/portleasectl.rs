use std::{path::PathBuf, time::Duration};

use portlease::{
    client::RegistryClient,
    logging::init_logging,
    provision::{
        ConfiguratorKind, DEFAULT_EXPORT_PREFIX, NoOpConfigurator, PortConfigurator,
        PortShiftConfigurator, ProvisionRequest, ReservationConfigurator, provision, teardown,
    },
    server::DEFAULT_BIND,
    settings::RegistrySettings,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.is_empty() {
        usage();
        std::process::exit(2);
    }

    init_logging("warn");

    match args[0].as_str() {
        "reserve" => reserve_command(&args[1..]),
        "release" => release_command(&args[1..]),
        "ban" => ban_command(&args[1..]),
        "status" => status_command(&args[1..]),
        "provision" => provision_command(&args[1..]),
        "teardown" => teardown_command(&args[1..]),
        "config" => config_command(&args[1..]),
        _ => {
            usage();
            std::process::exit(2);
        }
    }
}

fn reserve_command(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let client = registry_client(args);
    let client_key = required_arg(args, "--client")?;
    let ttl = parse_ttl(args)?;

    let configuration = block_on(client.reserve(&client_key, ttl))??;
    println!("{}", serde_json::to_string(&configuration)?);
    Ok(())
}

fn release_command(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let client = registry_client(args);
    let client_key = required_arg(args, "--client")?;

    let message = block_on(client.release(&client_key))??;
    println!("{message}");
    Ok(())
}

fn ban_command(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let client = registry_client(args);
    let key = required_arg(args, "--key")?.parse::<u32>()?;

    let message = block_on(client.ban(key))??;
    println!("{message}");
    Ok(())
}

fn status_command(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let client = registry_client(args);
    let snapshot = block_on(client.status())??;
    println!("{}", serde_json::to_string(&snapshot)?);
    Ok(())
}

fn provision_command(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let configurator = configurator(args)?;
    let request = ProvisionRequest {
        template: PathBuf::from(required_arg(args, "--template")?),
        output: PathBuf::from(required_arg(args, "--output")?),
        exports: PathBuf::from(required_arg(args, "--exports")?),
        export_prefix: optional_arg(args, "--prefix")
            .unwrap_or_else(|| DEFAULT_EXPORT_PREFIX.to_string()),
    };

    let summary = provision(configurator.as_ref(), &request)?;
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

fn teardown_command(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let configurator = configurator(args)?;
    teardown(configurator.as_ref());
    println!("teardown complete");
    Ok(())
}

fn config_command(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    if args.is_empty() {
        usage();
        std::process::exit(2);
    }

    let file = PathBuf::from(required_arg(&args[1..], "--file")?);
    match args[0].as_str() {
        "init" => {
            let settings = RegistrySettings::default();
            settings.save(&file)?;
            println!("{}", serde_json::to_string(&settings)?);
        }
        "show" => {
            let settings = RegistrySettings::load_or_default(&file)?;
            println!("{}", serde_json::to_string(&settings)?);
        }
        _ => {
            usage();
            std::process::exit(2);
        }
    }
    Ok(())
}

fn configurator(args: &[String]) -> Result<Box<dyn PortConfigurator>, Box<dyn std::error::Error>> {
    let kind = required_arg(args, "--mode")?.parse::<ConfiguratorKind>()?;
    let configurator: Box<dyn PortConfigurator> = match kind {
        ConfiguratorKind::Shift => Box::new(PortShiftConfigurator {
            shift: required_arg(args, "--shift")?.parse::<u32>()?,
        }),
        ConfiguratorKind::Reservation => Box::new(ReservationConfigurator {
            client: registry_client(args),
            client_key: required_arg(args, "--client")?,
            ttl: parse_ttl(args)?,
        }),
        ConfiguratorKind::None => Box::new(NoOpConfigurator),
    };
    Ok(configurator)
}

fn registry_client(args: &[String]) -> RegistryClient {
    RegistryClient::new(optional_arg(args, "--registry").unwrap_or_else(|| DEFAULT_BIND.to_string()))
}

fn parse_ttl(args: &[String]) -> Result<Option<Duration>, Box<dyn std::error::Error>> {
    match optional_arg(args, "--ttl") {
        Some(value) => Ok(Some(Duration::from_millis(value.parse::<u64>()?))),
        None => Ok(None),
    }
}

fn block_on<F: std::future::Future>(future: F) -> Result<F::Output, Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()?;
    Ok(runtime.block_on(future))
}

fn required_arg(args: &[String], key: &str) -> Result<String, Box<dyn std::error::Error>> {
    let pos = args
        .iter()
        .position(|arg| arg == key)
        .ok_or_else(|| format!("missing arg {key}"))?;
    let value = args
        .get(pos + 1)
        .ok_or_else(|| format!("missing value for {key}"))?;
    if value.starts_with('-') {
        return Err(format!("missing value for {key}").into());
    }
    Ok(value.to_string())
}

fn optional_arg(args: &[String], key: &str) -> Option<String> {
    args.iter()
        .position(|arg| arg == key)
        .and_then(|pos| args.get(pos + 1))
        .map(ToString::to_string)
}

fn usage() {
    eprintln!("portleasectl reserve [--registry <host:port>] --client <key> [--ttl <ms>]");
    eprintln!("portleasectl release [--registry <host:port>] --client <key>");
    eprintln!("portleasectl ban [--registry <host:port>] --key <n>");
    eprintln!("portleasectl status [--registry <host:port>]");
    eprintln!(
        "portleasectl provision --mode <shift|reservation|none> --template <path> --output <path> --exports <path> [--shift <n>] [--registry <host:port>] [--client <key>] [--ttl <ms>] [--prefix <p>]"
    );
    eprintln!(
        "portleasectl teardown --mode <shift|reservation|none> [--registry <host:port>] [--client <key>]"
    );
    eprintln!("portleasectl config (init|show) --file <path>");
}
