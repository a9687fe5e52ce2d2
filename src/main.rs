//! Training and decoding driver.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use loglat::errors::{LoglatError, Result};
use loglat::{decode, dump_spaces, gradient, Dataset, Generator, Model, Rprop, StringPool};

#[derive(Parser, Debug)]
#[command(
    name = "loglat",
    version,
    about = "Discriminative training and decoding for weighted FSTs"
)]
struct Args {
    /// Display more information
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Number of compute threads
    #[arg(long, default_value_t = 1)]
    nthreads: usize,

    /// Model file(s) to load
    #[arg(long = "mdl-load")]
    mdl_load: Vec<PathBuf>,

    /// File to store the model
    #[arg(long = "mdl-save")]
    mdl_save: Option<PathBuf>,

    /// File to store the model after each iteration (%d expands to the
    /// iteration number)
    #[arg(long = "mdl-save-otf")]
    mdl_save_otf: Option<String>,

    /// Compact the model before saving
    #[arg(long = "mdl-compact")]
    mdl_compact: bool,

    /// File to dump the feature hash list (forces a single thread)
    #[arg(long = "ftr-dump")]
    ftr_dump: Option<PathBuf>,

    /// Training search-space lattice file(s)
    #[arg(long = "train-spc")]
    train_spc: Vec<PathBuf>,

    /// Training reference lattice file(s)
    #[arg(long = "train-ref")]
    train_ref: Vec<PathBuf>,

    /// Development lattice file, decoded after each iteration
    #[arg(long = "devel-spc")]
    devel_spc: Option<PathBuf>,

    /// Development output file (%d expands to the iteration number)
    #[arg(long = "devel-out")]
    devel_out: Option<String>,

    /// Test lattice file
    #[arg(long = "test-spc")]
    test_spc: Option<PathBuf>,

    /// Test decoding output file
    #[arg(long = "test-out")]
    test_out: Option<PathBuf>,

    /// Test search-space dump file
    #[arg(long = "test-fst")]
    test_fst: Option<PathBuf>,

    /// Feature extraction pattern, repeatable ([tag:][name:]item[,item]*)
    #[arg(long)]
    pattern: Vec<String>,

    /// Introduce a tag at iteration N (TAG:N)
    #[arg(long = "tag-start")]
    tag_start: Vec<String>,

    /// Remove a tag from iteration N (TAG:N)
    #[arg(long = "tag-remove")]
    tag_remove: Vec<String>,

    /// L1 regularization for a tag (TAG:F, or F for all tags)
    #[arg(long = "tag-rho1")]
    tag_rho1: Vec<String>,

    /// L2 regularization for a tag (TAG:F, or F for all tags)
    #[arg(long = "tag-rho2")]
    tag_rho2: Vec<String>,

    /// Frequency-weighted L1 regularization for a tag (TAG:F, or F)
    #[arg(long = "tag-rho3")]
    tag_rho3: Vec<String>,

    /// Count feature frequencies on references instead of search spaces
    #[arg(long = "ref-freq")]
    ref_freq: bool,

    /// Minimum occurrence frequency for a feature to survive a sweep
    #[arg(long = "min-freq", default_value_t = 0)]
    min_freq: u32,

    /// Amount of per-lattice data to keep in memory between passes (0-4)
    #[arg(long = "cache-lvl", default_value_t = 0)]
    cache_lvl: u8,

    /// Number of optimization steps
    #[arg(long, default_value_t = 15)]
    iterations: u32,

    /// RPROP step increment factor
    #[arg(long = "rbp-stpinc", default_value_t = 1.2)]
    rbp_stpinc: f64,

    /// RPROP step decrement factor
    #[arg(long = "rbp-stpdec", default_value_t = 0.5)]
    rbp_stpdec: f64,

    /// RPROP minimum step value
    #[arg(long = "rbp-stpmin", default_value_t = 1e-8)]
    rbp_stpmin: f64,

    /// RPROP maximum step value
    #[arg(long = "rbp-stpmax", default_value_t = 50.0)]
    rbp_stpmax: f64,

    /// String pool file(s) to preload
    #[arg(long = "str-load")]
    str_load: Vec<PathBuf>,

    /// File to dump the string pool to
    #[arg(long = "str-save")]
    str_save: Option<PathBuf>,

    /// Store all strings in the pool, not only the mandatory ones
    #[arg(long = "str-all")]
    str_all: bool,
}

/// Parses a `TAG:VALUE` switch argument.
fn parse_tagged<T: std::str::FromStr>(arg: &str) -> Result<(usize, T)> {
    let invalid = || LoglatError::invalid_argument(format!("bad tag:value item '{arg}'"));
    let (tag, value) = arg.split_once(':').ok_or_else(invalid)?;
    let tag: usize = tag.parse().map_err(|_| invalid())?;
    if tag > 127 {
        return Err(invalid());
    }
    let value = value.parse().map_err(|_| invalid())?;
    Ok((tag, value))
}

/// Parses a rho switch argument: `TAG:VALUE`, or a bare value for tag 0.
fn parse_rho(arg: &str) -> Result<(usize, f64)> {
    if let Ok(parsed) = parse_tagged(arg) {
        return Ok(parsed);
    }
    let value: f64 = arg
        .parse()
        .map_err(|_| LoglatError::invalid_argument(format!("bad rho item '{arg}'")))?;
    Ok((0, value))
}

/// Resolves per-tag rho overrides: unset tags inherit the tag-0 value.
fn resolve_rhos(items: &[String]) -> Result<[f64; 128]> {
    let mut overrides = Vec::new();
    let mut base = 0.0;
    for item in items {
        let (tag, value) = parse_rho(item)?;
        if tag == 0 {
            base = value;
        }
        overrides.push((tag, value));
    }
    let mut rhos = [base; 128];
    for (tag, value) in overrides {
        rhos[tag] = value;
    }
    Ok(rhos)
}

/// Expands the `%d` placeholder of an output file template.
fn expand_template(template: &str, iteration: u32) -> PathBuf {
    PathBuf::from(template.replacen("%d", &iteration.to_string(), 1))
}

fn create_output(path: &Path) -> Result<BufWriter<File>> {
    Ok(BufWriter::new(
        File::create(path).map_err(|e| LoglatError::io(path, e))?,
    ))
}

fn run(args: &Args) -> Result<()> {
    // The string pool and the model come first: everything else interns
    // through them.
    let pool = Arc::new(StringPool::new(args.str_all));
    for path in &args.str_load {
        log::info!("loading strings from {}", path.display());
        pool.load(path)?;
    }
    let mut model = Model::new(Arc::clone(&pool));
    model.set_min_freq(args.min_freq);
    for item in &args.tag_start {
        let (tag, itr) = parse_tagged(item)?;
        model.set_tag_start(tag, itr);
    }
    for item in &args.tag_remove {
        let (tag, itr) = parse_tagged(item)?;
        model.set_tag_remove(tag, itr);
    }
    let mut nthreads = args.nthreads.max(1);
    if let Some(path) = &args.ftr_dump {
        let file = File::create(path).map_err(|e| LoglatError::io(path, e))?;
        model.set_dump(file);
        // Dump emission order must be stable.
        nthreads = 1;
    }

    if args.pattern.is_empty() {
        return Err(LoglatError::invalid_argument("no pattern specified"));
    }
    let mut gen = Generator::new(Arc::clone(&pool), args.ref_freq);
    for pattern in &args.pattern {
        gen.add_pattern(pattern)?;
    }

    for path in &args.mdl_load {
        log::info!("loading model from {}", path.display());
        model.load(path)?;
    }

    let mut train = Dataset::new();
    for path in &args.train_spc {
        log::info!("loading train spaces from {}", path.display());
        train.load(path, &model, 1.0, args.cache_lvl)?;
    }
    for path in &args.train_ref {
        log::info!("loading train references from {}", path.display());
        train.load(path, &model, -1.0, args.cache_lvl)?;
    }
    let mut devel = Dataset::new();
    if let Some(path) = &args.devel_spc {
        if args.devel_out.is_none() {
            return Err(LoglatError::invalid_argument(
                "--devel-spc requires --devel-out",
            ));
        }
        log::info!("loading devel spaces from {}", path.display());
        devel.load(path, &model, 0.0, args.cache_lvl)?;
    }
    let mut test = Dataset::new();
    if let Some(path) = &args.test_spc {
        log::info!("loading test spaces from {}", path.display());
        test.load(path, &model, 0.0, args.cache_lvl)?;
    }
    if train.is_empty() && test.is_empty() {
        return Err(LoglatError::invalid_argument(
            "no training and no test data",
        ));
    }
    log::info!(
        "{} train, {} devel, {} test FSTs",
        train.len(),
        devel.len(),
        test.len()
    );

    let rprop = Rprop {
        rho1: resolve_rhos(&args.tag_rho1)?,
        rho2: resolve_rhos(&args.tag_rho2)?,
        rho3: resolve_rhos(&args.tag_rho3)?,
        stpinc: args.rbp_stpinc,
        stpdec: args.rbp_stpdec,
        stpmin: args.rbp_stpmin,
        stpmax: args.rbp_stpmax,
    };

    if !train.is_empty() {
        for itr in 1..=args.iterations {
            log::info!("iteration {itr}");
            model.set_iteration(itr);
            let fx = gradient::compute(&model, &gen, &mut train, nthreads, args.cache_lvl)?;
            rprop.step(&mut model, fx);
            model.log_stats();
            if !devel.is_empty() {
                let path = expand_template(args.devel_out.as_ref().unwrap(), itr);
                let mut out = create_output(&path)?;
                decode(&model, &gen, &mut devel, &mut out)?;
            }
            if let Some(template) = &args.mdl_save_otf {
                model.save(&expand_template(template, itr))?;
            }
        }
    }

    if !test.is_empty() {
        if let Some(path) = &args.test_out {
            log::info!("decoding the test set");
            let mut out = create_output(path)?;
            decode(&model, &gen, &mut test, &mut out)?;
        }
        if let Some(path) = &args.test_fst {
            log::info!("dumping the test search spaces");
            let mut out = create_output(path)?;
            dump_spaces(&model, &gen, &mut test, &mut out)?;
        }
    }

    if let Some(path) = &args.mdl_save {
        if args.mdl_compact {
            model.shrink();
        }
        log::info!("saving the model to {}", path.display());
        model.save(path)?;
    }
    if let Some(path) = &args.str_save {
        log::info!("saving the string pool to {}", path.display());
        pool.save(path)?;
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(if args.verbose > 0 {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .format_timestamp(None)
        .init();
    if let Err(e) = run(&args) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
