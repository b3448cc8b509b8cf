use super::CliError;
use super::helpers::*;
use super::uhpc::read_uhpc_record;
use amidr_core::common::config::AnalysisConfig;
use amidr_core::domain::{AmidrError, AmidrErrorCategory, Protocol};
use amidr_core::modules::binning::{BinAverager, BinSelection, CellFits, MaterialBins, render_bin_table};
use amidr_core::modules::compare::{compare_materials, render_comparison};
use amidr_core::modules::fit::{DiffusivityFitter, render_fit_table, render_model_curves};
use amidr_core::modules::pipeline::{CellAnalysis, analyze_cell};
use std::path::{Path, PathBuf};

const MODEL_CURVE_POINTS: usize = 200;

#[derive(Clone, Copy, clap::ValueEnum)]
pub(super) enum ProtocolArg {
    /// One pulse per interval followed by a relaxation (AMIDR)
    SingleRate,
    /// Groups of pulses at decreasing rates per interval (AMID)
    MultiRate,
}

impl From<ProtocolArg> for Protocol {
    fn from(value: ProtocolArg) -> Self {
        match value {
            ProtocolArg::SingleRate => Protocol::SingleRate,
            ProtocolArg::MultiRate => Protocol::MultiRate,
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum)]
pub(super) enum SelectionArg {
    All,
    Charge,
    Discharge,
}

impl From<SelectionArg> for BinSelection {
    fn from(value: SelectionArg) -> Self {
        match value {
            SelectionArg::All => BinSelection::All,
            SelectionArg::Charge => BinSelection::Charge,
            SelectionArg::Discharge => BinSelection::Discharge,
        }
    }
}

#[derive(clap::Args)]
pub(super) struct FitArgs {
    /// UHPC files or directories containing them
    #[arg(required = true, value_name = "INPUT")]
    inputs: Vec<PathBuf>,

    /// File-name pattern applied inside input directories
    #[arg(long, default_value = "*.csv")]
    pattern: String,

    /// JSON analysis configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Particle radius in cm, overriding the configuration
    #[arg(long)]
    radius: Option<f64>,

    /// Pulse protocol, overriding the configuration
    #[arg(long, value_enum)]
    protocol: Option<ProtocolArg>,

    /// Directory receiving the per-cell outputs
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Also export model (Q, tau) curves for every fit
    #[arg(long)]
    curves: bool,

    /// Bin the fits of all inputs under this material name
    #[arg(long)]
    material: Option<String>,
}

#[derive(clap::Args)]
pub(super) struct BinArgs {
    /// Cell analysis JSON files written by `fit`
    #[arg(required = true, value_name = "ANALYSIS")]
    inputs: Vec<PathBuf>,

    /// Material name used for the output files
    #[arg(long)]
    material: String,

    /// JSON analysis configuration supplying the binning options
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory receiving the bin tables
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
}

#[derive(clap::Args)]
pub(super) struct CompareArgs {
    /// Material bin JSON files written by `bin`
    #[arg(required = true, value_name = "BINS")]
    inputs: Vec<PathBuf>,

    /// Which half-cycle's bins to compare
    #[arg(long, value_enum, default_value = "all")]
    selection: SelectionArg,

    /// Directory receiving the comparison table
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Base name of the output files
    #[arg(long, default_value = "comparison")]
    name: String,
}

pub(super) fn run_fit_command(args: FitArgs) -> Result<i32, CliError> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(radius) = args.radius {
        config.fit.particle_radius = radius;
    }
    if let Some(protocol) = args.protocol {
        config.segmentation.protocol = protocol.into();
    }
    config.validate().map_err(CliError::Analysis)?;

    let files = collect_inputs(&args.inputs, &args.pattern)?;
    ensure_directory(&args.output_dir)?;

    let mut analyses = Vec::new();
    let mut first_failure: Option<AmidrError> = None;
    for file in &files {
        match fit_file(file, &config, &args) {
            Ok(analysis) => analyses.push(analysis),
            // a bad file only costs its own dataset
            Err(CliError::Analysis(error))
                if error.category().aborts_dataset()
                    || error.category() == AmidrErrorCategory::IoSystemError =>
            {
                eprintln!("{}: {}", file.display(), error.diagnostic_line());
                first_failure.get_or_insert(error);
            }
            Err(error) => return Err(error),
        }
    }

    if let Some(material) = &args.material {
        let fits: Vec<CellFits> = analyses.iter().map(CellAnalysis::cell_fits).collect();
        let bins = BinAverager::new(&config.binning)
            .map_err(CliError::Analysis)?
            .average(material, &fits);
        write_material_bins(&bins, &args.output_dir)?;
    }

    match first_failure {
        Some(error) => Err(CliError::Analysis(error)),
        None => Ok(0),
    }
}

fn fit_file(file: &Path, config: &AnalysisConfig, args: &FitArgs) -> Result<CellAnalysis, CliError> {
    let record = read_uhpc_record(file, config.segmentation.zero_current_threshold)
        .map_err(CliError::Analysis)?;
    let analysis = analyze_cell(&record, config).map_err(CliError::Analysis)?;

    let stem = file_stem(file);
    let json_path = args.output_dir.join(format!("{stem}.analysis.json"));
    write_json(&json_path, &analysis)?;
    write_text(
        &args.output_dir.join(format!("{stem}.fits.dat")),
        &render_fit_table(&analysis.report.fits),
    )?;

    if args.curves {
        let fitter = DiffusivityFitter::new(&config.fit, config.segmentation.protocol, record.mass)
            .map_err(CliError::Analysis)?;
        let curves: Vec<_> = analysis
            .report
            .fits
            .iter()
            .map(|fit| (fit.label.clone(), fitter.model_curve(fit, MODEL_CURVE_POINTS)))
            .collect();
        write_text(
            &args.output_dir.join(format!("{stem}.curves.dat")),
            &render_model_curves(&curves),
        )?;
    }

    println!(
        "{}: {} {} fits, {} discarded -> {}",
        analysis.cell,
        analysis.report.fits.len(),
        analysis.protocol,
        analysis.report.discarded.len(),
        json_path.display()
    );
    Ok(analysis)
}

pub(super) fn run_bin_command(args: BinArgs) -> Result<i32, CliError> {
    let config = load_config(args.config.as_deref())?;
    let averager = BinAverager::new(&config.binning).map_err(CliError::Analysis)?;

    let mut fits = Vec::with_capacity(args.inputs.len());
    for input in &args.inputs {
        let analysis: CellAnalysis = read_json(input)?;
        fits.push(analysis.cell_fits());
    }

    ensure_directory(&args.output_dir)?;
    let bins = averager.average(&args.material, &fits);
    write_material_bins(&bins, &args.output_dir)?;
    Ok(0)
}

fn write_material_bins(bins: &MaterialBins, output_dir: &Path) -> Result<(), CliError> {
    let material = &bins.material;
    write_json(&output_dir.join(format!("{material}.bins.json")), bins)?;
    for (suffix, selection) in [
        ("", BinSelection::All),
        (".charge", BinSelection::Charge),
        (".discharge", BinSelection::Discharge),
    ] {
        write_text(
            &output_dir.join(format!("{material}{suffix}.bins.dat")),
            &render_bin_table(bins.table.select(selection)),
        )?;
    }
    println!(
        "{}: {} of {} fits accepted into {} bins",
        material,
        bins.accepted().count(),
        bins.screened.len(),
        bins.table.all.len()
    );
    Ok(())
}

pub(super) fn run_compare_command(args: CompareArgs) -> Result<i32, CliError> {
    let mut materials: Vec<MaterialBins> = Vec::with_capacity(args.inputs.len());
    for input in &args.inputs {
        materials.push(read_json(input)?);
    }
    let comparison =
        compare_materials(&materials, args.selection.into()).map_err(CliError::Analysis)?;

    ensure_directory(&args.output_dir)?;
    write_json(&args.output_dir.join(format!("{}.json", args.name)), &comparison)?;
    write_text(
        &args.output_dir.join(format!("{}.dat", args.name)),
        &render_comparison(&comparison),
    )?;
    println!(
        "compared {} materials over {} bins",
        comparison.materials.len(),
        comparison.rows.len()
    );
    Ok(0)
}
