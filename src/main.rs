use clap::Parser;
use lungseg::config::Config;
use lungseg::error::LungsegError;
use lungseg::models::{HttpFetcher, Mode, ModelRegistry, Provisioner, Structure};
use lungseg::pipeline::normalize::input_format;
use lungseg::pipeline::{NnUnetCli, Pipeline, RunRequest, DEFAULT_RESULT_NAME};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lungseg")]
#[command(version, about = "Lung segmentation with pre-trained nnUNetv2 models", long_about = None)]
struct Cli {
    /// Acquisition context of the scan
    #[arg(long, value_enum, ignore_case = true, required_unless_present = "list_models")]
    mode: Option<Mode>,

    /// Structure to segment
    #[arg(long, value_enum, ignore_case = true, required_unless_present = "list_models")]
    structure: Option<Structure>,

    /// Input scan (.nii, .nii.gz, .mha, .nrrd)
    #[arg(long, required_unless_present = "list_models")]
    input: Option<PathBuf>,

    /// Output directory
    #[arg(long, default_value = DEFAULT_RESULT_NAME)]
    output: PathBuf,

    /// Where model bundles are cached
    #[arg(long = "models_dir")]
    models_dir: Option<PathBuf>,

    /// Result file name, without extension
    #[arg(long, default_value = DEFAULT_RESULT_NAME)]
    name: String,

    /// Config file (default: ~/.config/lungseg/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Device passed to nnUNet (cuda, cpu, mps)
    #[arg(long)]
    device: Option<String>,

    /// Model fold to predict with
    #[arg(long)]
    fold: Option<u32>,

    /// List known models and whether they are installed
    #[arg(long = "list_models")]
    list_models: bool,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        let code = e
            .downcast_ref::<LungsegError>()
            .map_or(1, LungsegError::exit_code);
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(dir) = cli.models_dir {
        config.models.dir = Some(dir);
    }
    if let Some(device) = cli.device {
        config.prediction.device = device;
    }

    let registry = match &config.models.registry {
        Some(path) => ModelRegistry::from_json_file(path)?,
        None => ModelRegistry::builtin(&config.models.base_url),
    };
    let fetcher = HttpFetcher::new(config.download.timeout_secs, config.download.progress)?;
    let provisioner = Provisioner::new(registry, config.models_dir()?, fetcher)?
        .with_checksum_verification(config.models.verify_checksums);

    if cli.list_models {
        list_models(&provisioner);
        return Ok(());
    }

    // clap enforces these unless --list_models was given
    let (Some(mode), Some(structure), Some(input)) = (cli.mode, cli.structure, cli.input) else {
        anyhow::bail!("--mode, --structure and --input are required");
    };

    // Reject unreadable inputs before looking for nnUNet or downloading anything
    input_format(&input)?;
    let predictor = NnUnetCli::new(&config.prediction)?;
    let pipeline = Pipeline::new(provisioner, predictor)
        .with_staging_root(config.staging.root.clone())
        .keep_temp(config.staging.keep_temp);

    let request = RunRequest {
        output_dir: cli.output,
        name: cli.name,
        fold: cli.fold.map(|f| f.to_string()),
        ..RunRequest::new(mode, structure, input)
    };
    tracing::info!("Segmenting {} ({mode} {structure})", request.input.display());

    let outcome = pipeline.run(&request)?;

    if outcome.downloaded {
        tracing::info!("Model installed in {}", outcome.model_folder.display());
    }
    if !outcome.labels.is_empty() {
        let labels: Vec<String> = outcome
            .labels
            .iter()
            .map(|(index, name)| format!("{index}={name}"))
            .collect();
        tracing::info!("Labels: {}", labels.join(", "));
    }
    println!("✓ Segmentation saved to {}", outcome.result_path.display());
    Ok(())
}

fn list_models<F: lungseg::models::ArchiveFetcher>(provisioner: &Provisioner<F>) {
    println!("Models in {}:", provisioner.models_dir().display());
    for (info, installed) in provisioner.installed() {
        println!(
            "  {:<8} {:<18} {:<34} {:<36} {}",
            info.mode.as_str(),
            info.structure.as_str(),
            info.model_name,
            info.nnunet_label(),
            if installed { "installed" } else { "-" }
        );
    }
}
