//! `field_map`: run a field map sweep from a settings file.
use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use field_mapper::analysis::{fit_peak, Component};
use field_mapper::config::{Settings, DEFAULT_CONFIG_PATH};
use field_mapper::error::AppResult;
use field_mapper::export::{CsvExporter, SweepMetadata, SweepSink};
use field_mapper::hardware::adlink::AdlinkLibrary;
use field_mapper::hardware::encoder::{initialize_card, EncoderAxis, EncoderDriver};
use field_mapper::hardware::mclennan::McLennanAxis;
use field_mapper::hardware::metrolab::MetrolabProbe;
use field_mapper::hardware::sim::SimRig;
use field_mapper::hardware::transport::{shared, SerialTransport, VisaTransport};
use field_mapper::hardware::DeviceRegistry;
use field_mapper::scan::{GridCell, GridSweep, LineScanResult, StdinPrompt};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "field_map", version, about = "Map a magnet's field with a Hall probe")]
struct Cli {
    /// Settings file (TOML); FIELDMAP_* environment variables override it
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Run against the simulated bench
    #[arg(long)]
    simulate: bool,

    /// Output CSV file, overriding sweep.output
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Fit the Bz peak of a single-line sweep
    #[arg(long)]
    fit_peak: bool,
}

/// Passes lines through to the CSV file and keeps the most recent one.
struct KeepLast<S> {
    inner: S,
    last: Option<LineScanResult>,
}

#[async_trait]
impl<S: SweepSink> SweepSink for KeepLast<S> {
    async fn write_line(&mut self, cell: &GridCell, line: &LineScanResult) -> AppResult<()> {
        self.inner.write_line(cell, line).await?;
        self.last = Some(line.clone());
        Ok(())
    }

    async fn finish(&mut self) -> AppResult<()> {
        self.inner.finish().await
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect_bench(settings: &Settings) -> Result<(DeviceRegistry, Arc<MetrolabProbe>)> {
    let serial = SerialTransport::open(&settings.controller)?;
    let mut registry = DeviceRegistry::new();
    McLennanAxis::register_all(&mut registry, settings, shared(serial))?;

    if !settings.encoder.channels.is_empty() {
        let driver: Arc<dyn EncoderDriver> =
            Arc::new(AdlinkLibrary::open(&settings.encoder.library)?);
        initialize_card(driver.as_ref(), settings.encoder.manual_id)
            .context("Failed to bring up the encoder card")?;
        EncoderAxis::register_all(&mut registry, settings, driver)?;
    }

    let visa = VisaTransport::open(
        &settings.probe.resource,
        Duration::from_millis(settings.probe.timeout_ms),
    )?;
    let probe = MetrolabProbe::connect(Box::new(visa))
        .await
        .context("Failed to connect to the field probe")?;
    probe.apply_settings(&settings.probe).await?;
    let probe = Arc::new(probe);
    registry.set_instrument(probe.clone());
    Ok((registry, probe))
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load settings from '{}'", cli.config.display()))?;
    init_tracing(&settings.application.log_level);
    info!("Starting {}", settings.application.name);

    let (registry, probe) = if cli.simulate {
        let rig = SimRig::build(&settings)
            .await
            .context("Failed to build the simulated bench")?;
        (rig.registry, rig.instrument)
    } else {
        connect_bench(&settings).await?
    };

    let grid = GridSweep::from_settings(registry, &settings)?;
    let output = cli.output.unwrap_or_else(|| settings.sweep.output.clone());
    let mut metadata = SweepMetadata::from_settings(&settings);
    metadata.describe_probe(&probe).await;
    let exporter = CsvExporter::create(&output, &metadata)
        .with_context(|| format!("Failed to create '{}'", output.display()))?;
    let mut sink = KeepLast {
        inner: exporter,
        last: None,
    };

    let summary = grid.run(&mut sink, &StdinPrompt).await?;
    info!(
        lines = summary.lines,
        samples = summary.samples,
        "Field map written to '{}'",
        output.display()
    );

    if cli.fit_peak {
        match (summary.lines, sink.last) {
            (1, Some(line)) => {
                let fit = fit_peak(&line, Component::Z)?;
                info!(
                    "Bz peak {:.3} {} at {} = {:.3} {}",
                    fit.value, line.field_units, line.axis, fit.position, line.units
                );
                sink.inner.append_notes(&fit.notes(&line.units))?;
            }
            (lines, _) => warn!(lines, "--fit-peak applies to single-line sweeps only"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}
