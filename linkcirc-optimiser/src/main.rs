mod tracing;

use crate::tracing::Tracer;

use std::fs::File;
use std::io::BufWriter;
use std::num::NonZeroUsize;
use std::path::PathBuf;

use clap::Parser;
use linkcirc::ingest::{ingest_into_store, IngestOptions, DEFAULT_WINDOW_SIZE};
use linkcirc::optimiser::{Directive, ProcedureCall, RunLogger, Sampling};
use linkcirc::passes::{widgetize_label, WidgetizeOptions};
use linkcirc::reconstruct::{reconstruct_label, ReconstructOptions};
use linkcirc::rewrite::{CancelInversePairs, ProcedureRegistry};
use linkcirc::serialize::{load_json_file, save_json_file, SerialCircuit};
use linkcirc::{GateCode, OptimisationOrchestrator, OrchestratorOptions, StoreConfig};

/// Optimise circuits by rewriting them concurrently in a linked gate store.
#[derive(Parser, Debug)]
#[clap(version = "1.0", long_about = None)]
#[clap(about = "Optimise circuits by concurrent in-place rewriting of a linked gate store.")]
struct CmdLineArgs {
    /// Input circuit file as JSON.
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Input. A quantum circuit in linkcirc JSON format."
    )]
    input: PathBuf,
    /// Output circuit file
    #[arg(
        short,
        long,
        default_value = "out.json",
        value_name = "FILE",
        help = "Output. A quantum circuit in linkcirc JSON format."
    )]
    output: PathBuf,
    /// Database file
    #[arg(
        short,
        long,
        default_value = "linkcirc.db",
        value_name = "DB_FILE",
        help = "The SQLite database holding the linked circuit."
    )]
    db: PathBuf,
    /// Circuit label
    #[arg(
        long,
        default_value = "0",
        help = "Label of the circuit in the database. Existing rows with this label are replaced."
    )]
    label: i64,
    /// Log output file
    #[arg(
        short,
        long,
        default_value = "linkcirc-optimisation.log",
        value_name = "LOGFILE",
        help = "Logfile to to output the progress of the optimisation."
    )]
    logfile: Option<PathBuf>,
    /// Per-worker CSV log
    #[arg(
        long = "worker-log",
        value_name = "CSV_FILE",
        help = "Write one CSV row per finished worker to this file."
    )]
    worker_log: Option<PathBuf>,
    /// Record function spans in the logfile
    #[arg(long, help = "Also record timing spans in the logfile.")]
    metrics: bool,
    /// Timeout in seconds
    #[arg(
        short,
        long,
        default_value = "60",
        value_name = "TIMEOUT",
        help = "Timeout in seconds (default=60)."
    )]
    timeout: f64,
    /// Number of workers (default=1)
    #[arg(
        short = 'j',
        long,
        value_name = "N_WORKERS",
        help = "The number of concurrent rewrite workers. By default, use a single worker."
    )]
    n_workers: Option<NonZeroUsize>,
    /// Pin workers to cores
    #[arg(long, help = "Pin each worker to its own physical core, where supported.")]
    pin_cores: bool,
    /// Gate codes to cancel
    #[arg(
        short,
        long,
        value_delimiter = ',',
        value_name = "GATES",
        help = "Comma-separated gate names to cancel, e.g. `H,CX`. Defaults to all."
    )]
    gates: Vec<GateCode>,
    /// Bernoulli sampling percentage
    #[arg(
        long,
        value_name = "PERCENT",
        conflicts_with = "block_size",
        help = "Sample nodes with this probability, in percent."
    )]
    bernoulli: Option<f64>,
    /// Block sampling size
    #[arg(
        long = "block-size",
        value_name = "SIZE",
        help = "Scan blocks of this many nodes. Without this or `--bernoulli`, the sampling is picked from the graph size."
    )]
    block_size: Option<usize>,
    /// Rewrites per worker
    #[arg(
        long = "run-count",
        value_name = "N",
        help = "Stop each worker after this many rewrites (default=until timeout)."
    )]
    run_count: Option<usize>,
    /// Ingestion window
    #[arg(
        long = "window-size",
        default_value_t = DEFAULT_WINDOW_SIZE,
        help = "Operations per ingestion window."
    )]
    window_size: usize,
    /// Report widgets
    #[arg(long, help = "Cluster the optimised circuit into widgets and report them.")]
    widgets: bool,
    /// Widget T-count ceiling
    #[arg(long = "max-t", default_value = "10", help = "Maximum T-count of a widget.")]
    max_t: usize,
    /// Widget depth ceiling
    #[arg(long = "max-d", default_value = "100", help = "Maximum depth of a widget.")]
    max_d: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts = CmdLineArgs::parse();

    let n_workers = opts.n_workers.map_or(1, NonZeroUsize::get);

    // Setup tracing subscribers for stdout and file logging.
    //
    // We need to keep the object around to keep the logging active.
    let _tracer = Tracer::setup_tracing(opts.logfile, n_workers > 1, opts.metrics)?;

    let mut logger = match &opts.worker_log {
        Some(path) => RunLogger::new(BufWriter::new(File::create(path)?)),
        None => RunLogger::default(),
    };

    let circ = load_json_file(&opts.input)?;
    let translator = circ.translator();
    let config = StoreConfig::new(&opts.db);
    let mut store = config.open()?;

    println!("Ingesting circuit...");
    store.delete_label(opts.label)?;
    let ingest_options = IngestOptions {
        label: opts.label,
        window_size: opts.window_size,
        ..Default::default()
    };
    let summary = ingest_into_store(&mut store, &translator, &circ.commands, &ingest_options)?;
    let num_nodes = store.count_nodes(opts.label)?;

    let sampling = match (opts.bernoulli, opts.block_size) {
        (Some(percent), _) => Sampling::Bernoulli { percent },
        (None, Some(size)) => Sampling::Block { size },
        (None, None) => Sampling::for_graph_size(num_nodes),
    };
    let call = ProcedureCall::new(CancelInversePairs::BASE_NAME, opts.label)
        .with_gate_codes(opts.gates)
        .with_sampling(sampling)
        .with_run_count(opts.run_count);
    println!(
        "Optimising {} operations with {n_workers} workers ({}).",
        summary.operations,
        call.name()
    );

    let orchestrator = OptimisationOrchestrator::new(config, ProcedureRegistry::with_builtins());
    let report = orchestrator.run_with_log(
        &[Directive::new(n_workers, call)],
        &OrchestratorOptions {
            timeout: opts.timeout,
            pin_cores: opts.pin_cores,
            id_watermark: Some(summary.next_id.index()),
        },
        &mut logger,
    )?;
    if report.failures() > 0 {
        eprintln!("{} of {n_workers} workers failed.", report.failures());
    }

    if opts.widgets {
        let widgets = widgetize_label(
            &mut store,
            opts.label,
            &WidgetizeOptions {
                max_t: opts.max_t,
                max_d: opts.max_d,
                ..Default::default()
            },
        )?;
        let largest = widgets.iter().map(|w| w.members.len()).max().unwrap_or(0);
        println!(
            "Found {} widgets, the largest has {largest} operations.",
            widgets.len()
        );
    }

    println!("Saving result");
    let rebuilt = reconstruct_label(
        &store,
        opts.label,
        &translator,
        &ReconstructOptions {
            wire_order: Some(summary.wire_order()),
            ..Default::default()
        },
    )?;
    let opt_circ = SerialCircuit {
        qubits: circ.qubits.clone(),
        commands: rebuilt.into_gates(),
    };
    save_json_file(&opt_circ, &opts.output)?;

    println!(
        "Done. {} operations remain after {} rewrites.",
        opt_circ.commands.len(),
        report.applied()
    );
    Ok(())
}
