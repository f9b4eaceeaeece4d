use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use deckr_engine::normalizer::{decode_data_url, normalize_bytes};
use deckr_engine::{parse_plan, EngineConfig, EngineError, ImageNormalizer, ImageRef, ImageRefKind};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("deckr")
        .version(deckr_engine::VERSION)
        .about("Deck edit engine operator tools")
        .subcommand_required(true)
        .subcommand(
            Command::new("validate-plan")
                .about("Validate an execution plan JSON file")
                .arg(
                    Arg::new("file")
                        .required(true)
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("Plan file"),
                ),
        )
        .subcommand(
            Command::new("normalize")
                .about("Normalize an image into canonical PNG form")
                .arg(
                    Arg::new("input")
                        .required(true)
                        .help("Image file path, data: URL or http(s) URL"),
                )
                .arg(
                    Arg::new("output")
                        .long("output")
                        .short('o')
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("Write PNG bytes here instead of printing a data URL"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("Engine config file"),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Print the effective configuration")
                .arg(
                    Arg::new("file")
                        .long("file")
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("Config file to load"),
                ),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();
    match matches.subcommand() {
        Some(("validate-plan", args)) => validate_plan(args),
        Some(("normalize", args)) => normalize(args).await,
        Some(("config", args)) => print_config(args),
        _ => unreachable!("subcommand required"),
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn validate_plan(args: &ArgMatches) -> anyhow::Result<()> {
    let path = args
        .get_one::<PathBuf>("file")
        .context("missing plan file")?;
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading plan {}", path.display()))?;

    match parse_plan(&text) {
        Ok(plan) => {
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
        Err(error) => {
            let kind = EngineError::from(error.clone()).kind();
            eprintln!("{kind:?}: {error}");
            eprintln!("{}", error.user_message());
            std::process::exit(2);
        }
    }
}

async fn normalize(args: &ArgMatches) -> anyhow::Result<()> {
    let config = load_config(args.get_one::<PathBuf>("config"))?;
    let input = args
        .get_one::<String>("input")
        .context("missing input")?;

    let reference = ImageRef::new(input.as_str());
    let image = if reference.kind() == ImageRefKind::Unknown {
        let bytes =
            std::fs::read(input).with_context(|| format!("reading image {input}"))?;
        normalize_bytes(&bytes, config.max_image_pixels)?
    } else {
        ImageNormalizer::new(&config).normalize(&reference).await?
    };

    match args.get_one::<PathBuf>("output") {
        Some(output) => {
            let bytes = decode_data_url(image.as_data_url())?;
            std::fs::write(output, &bytes)
                .with_context(|| format!("writing {}", output.display()))?;
            tracing::info!(bytes = bytes.len(), path = %output.display(), "normalized image written");
        }
        None => println!("{}", image.as_data_url()),
    }
    Ok(())
}

fn print_config(args: &ArgMatches) -> anyhow::Result<()> {
    let config = load_config(args.get_one::<PathBuf>("file"))?;
    print!("{}", config.to_toml_string()?);
    Ok(())
}
