//! Subcommand bodies: wiring config, links and stores into the core crate.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use aqua_config::Config;
use aqua_core::dataset::{self, DatasetKind, DatasetStore, FileDatasetStore};
use aqua_core::error::AquaError;
use aqua_core::gateway::{DeviceGateway, GatewayStats, GatewayTiming};
use aqua_core::prediction::OrchestratorConfig;
use aqua_core::predictor::{
    LabeledWindow, LinearPredictor, PredictorWorker, TrainOptions, labeled_windows, train_linear,
};
use aqua_core::protocol::TelemetryFrame;
use aqua_core::runtime::{RuntimeSnapshot, build_runtime};
use aqua_hardware::{SimulatedDevice, SimulatorCfg};
use aqua_traits::{Clock, DeviceLink, MonotonicClock, SmallRandom};
use eyre::{Result, WrapErr};
use serde_json::json;

use crate::cli::DumpFormat;

/// Load and validate the configuration. Without a file the defaults apply,
/// still subject to environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let cfg = match path {
        Some(p) => aqua_config::load_file(p).map_err(|e| AquaError::Config(format!("{e:#}")))?,
        None => {
            let mut c = Config::default();
            c.apply_env(|k| std::env::var(k).ok());
            c
        }
    };
    cfg.validate()
        .map_err(|e| AquaError::Config(e.to_string()))?;
    Ok(cfg)
}

fn clock() -> Arc<dyn Clock + Send + Sync> {
    Arc::new(MonotonicClock::new())
}

#[allow(unreachable_code)]
fn open_link(
    cfg: &Config,
    simulate: bool,
    clock: Arc<dyn Clock + Send + Sync>,
) -> Result<Box<dyn DeviceLink>> {
    if simulate {
        let sim = SimulatorCfg {
            ph: (&cfg.ph).into(),
            ..SimulatorCfg::default()
        };
        return Ok(Box::new(SimulatedDevice::new(sim, clock)));
    }
    #[cfg(all(feature = "hardware", target_os = "linux"))]
    {
        let _ = clock;
        return Ok(Box::new(aqua_hardware::SerialLink::new(
            cfg.device.port.clone(),
            cfg.device.baud,
        )));
    }
    Err(AquaError::Device(format!(
        "{}: built without the `hardware` feature; rerun with --simulate",
        cfg.device.port
    ))
    .into())
}

fn open_store(cfg: &Config) -> Result<FileDatasetStore> {
    let path = cfg.dataset.path();
    Ok(FileDatasetStore::open(path)?)
}

fn load_worker(cfg: &Config) -> Result<Option<PredictorWorker>> {
    let Some(path) = cfg.prediction.model.as_deref() else {
        tracing::info!("no predictor model configured; predictions disabled");
        return Ok(None);
    };
    let model = LinearPredictor::load(path)
        .map_err(|e| AquaError::Predictor(format!("{e:#}")))?;
    tracing::info!(model = %path.display(), "predictor loaded");
    Ok(Some(PredictorWorker::spawn(model)))
}

fn print_json(value: &serde_json::Value) {
    println!("{value}");
}

// ── run ──────────────────────────────────────────────────────────────────

pub fn run(cfg: &Config, simulate: bool, duration_s: Option<u64>, json_out: bool) -> Result<()> {
    let clock = clock();
    let link = open_link(cfg, simulate, Arc::clone(&clock))?;
    let store = open_store(cfg)?;
    let worker = load_worker(cfg)?;
    let mut rt = build_runtime(cfg, Arc::clone(&clock), link, store, worker)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&shutdown);
        ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))
            .wrap_err("installing Ctrl-C handler")?;
    }
    if let Some(secs) = duration_s {
        let flag = Arc::clone(&shutdown);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(secs));
            flag.store(true, Ordering::Relaxed);
        });
    }

    rt.run(&shutdown);
    let snap = rt.snapshot(clock.now());
    let stats = rt.orchestrator().dataset_stats()?;
    if json_out {
        print_json(&json!({ "snapshot": snap, "dataset": stats }));
    } else {
        print_snapshot(&snap);
        println!(
            "dataset: {} rows ({} training, {} validation)",
            stats.total, stats.training, stats.validation
        );
    }
    Ok(())
}

fn fmt_opt(v: Option<f64>, decimals: usize) -> String {
    v.map_or_else(|| "-".to_string(), |v| format!("{v:.decimals$}"))
}

fn print_snapshot(s: &RuntimeSnapshot) {
    println!(
        "ph600={} ph60={} temp={} co2={}ppm",
        fmt_opt(s.ph.and_then(|r| r.ph600), 3),
        fmt_opt(s.ph.and_then(|r| r.ph60), 3),
        fmt_opt(s.aquarium_temperature, 2),
        fmt_opt(s.co2_ppm, 0),
    );
    match s.decision {
        Some(d) => println!("co2 required={} ({})", d.required, d.reason),
        None => println!("co2 required=-"),
    }
    if let Some(r) = s.control_range {
        println!("target: off<={:.3} on>={:.3}", r.ph_to_turn_off, r.ph_to_turn_on);
    }
    if let Some(p) = s.prediction {
        println!("predicted trough: {:.3}", p.predicted_min_ph);
    }
    print_gateway(&s.gateway);
}

fn print_gateway(g: &GatewayStats) {
    println!(
        "frames={} crc_errors={} version_mismatches={} debug={} commands={} port_errors={}",
        g.frames_received,
        g.crc_errors,
        g.version_mismatches,
        g.debug_messages,
        g.commands_written,
        g.serial_port_errors
    );
}

// ── self-check ───────────────────────────────────────────────────────────

pub fn self_check(cfg: &Config, simulate: bool, timeout_ms: u64, json_out: bool) -> Result<()> {
    let clock = clock();
    let link = open_link(cfg, simulate, Arc::clone(&clock))?;
    let mut gw = DeviceGateway::new(link, GatewayTiming::from(&cfg.device));
    let deadline = clock.now() + Duration::from_millis(timeout_ms);
    let frame: TelemetryFrame = loop {
        if let Some(f) = gw.poll(clock.now()).into_iter().next() {
            break f;
        }
        if clock.now() >= deadline {
            let stats = gw.stats();
            let name = gw.link().describe();
            gw.close();
            if !stats.is_open {
                return Err(AquaError::Device(format!("could not open {name}")).into());
            }
            return Err(AquaError::Timeout("a valid telemetry frame").into());
        }
        clock.sleep(Duration::from_millis(10));
    };
    let stats = gw.stats();
    let name = gw.link().describe();
    gw.close();

    if json_out {
        print_json(&json!({
            "link": name,
            "version_matches": frame.version_matches(),
            "uptime_ds": frame.diagnostics.uptime_ds,
            "gateway": stats,
        }));
    } else {
        println!("self-check ok: {name}");
        println!(
            "device uptime {:.1}s, protocol {}",
            f64::from(frame.diagnostics.uptime_ds) / 10.0,
            if frame.version_matches() { "matches" } else { "MISMATCH" }
        );
        print_gateway(&stats);
    }
    Ok(())
}

// ── dataset ──────────────────────────────────────────────────────────────

pub fn dataset_stats(cfg: &Config, json_out: bool) -> Result<()> {
    let store = open_store(cfg)?;
    let total = store.count(DatasetKind::Any)?;
    let training = store.count(DatasetKind::Training)?;
    let validation = store.count(DatasetKind::Validation)?;
    let expected = dataset::expected_validation(total, cfg.prediction.training_fraction);
    if json_out {
        print_json(&json!({
            "path": cfg.dataset.path(),
            "schema_version": store.schema_version(),
            "total": total,
            "training": training,
            "validation": validation,
            "expected_validation": expected,
        }));
    } else {
        println!("{}", cfg.dataset.path().display());
        println!("schema version {}", store.schema_version());
        println!("{total} rows: {training} training, {validation} validation (expected {expected})");
    }
    Ok(())
}

fn write_csv(out: impl Write, pairs: &[LabeledWindow]) -> Result<()> {
    let mut w = csv::Writer::from_writer(out);
    let width = pairs.first().map_or(0, |p| p.xs.len());
    let mut header = vec!["close_time".to_string(), "validation".into(), "y".into()];
    header.extend((0..width).map(|i| format!("x{i}")));
    w.write_record(&header)?;
    for p in pairs {
        let mut rec = vec![p.close_time.to_string(), p.validation.to_string(), p.y.to_string()];
        rec.extend(p.xs.iter().map(f64::to_string));
        w.write_record(&rec)?;
    }
    w.flush()?;
    Ok(())
}

pub fn dataset_dump(cfg: &Config, out: Option<&Path>, format: DumpFormat) -> Result<()> {
    let store = open_store(cfg)?;
    let rows = store.rows(DatasetKind::Any)?;
    let (pairs, skipped) = labeled_windows(&rows);
    tracing::info!(rows = pairs.len(), skipped, "dumping dataset");
    let sink: Box<dyn Write> = match out {
        Some(p) => Box::new(std::io::BufWriter::new(
            std::fs::File::create(p).wrap_err_with(|| format!("creating {}", p.display()))?,
        )),
        None => Box::new(std::io::stdout().lock()),
    };
    match format {
        DumpFormat::Json => {
            let mut sink = sink;
            serde_json::to_writer_pretty(&mut sink, &pairs)?;
            writeln!(sink)?;
            sink.flush()?;
        }
        DumpFormat::Csv => write_csv(sink, &pairs)?,
    }
    Ok(())
}

pub fn dataset_train(
    cfg: &Config,
    out: Option<PathBuf>,
    opts: TrainOptions,
    json_out: bool,
) -> Result<()> {
    let out = out.or_else(|| cfg.prediction.model.clone()).ok_or_else(|| {
        AquaError::Config("no model path: pass --out or set prediction.model".into())
    })?;
    let store = open_store(cfg)?;
    let training = store.find(DatasetKind::Training)?;
    let validation = store.find(DatasetKind::Validation)?;
    let report = train_linear(&training, &validation, opts)
        .map_err(|e| AquaError::Predictor(format!("{e:#}")))?;
    report.model.save(&out)?;
    if json_out {
        print_json(&json!({
            "model": out,
            "training_rows": report.training_rows,
            "skipped_rows": report.skipped_rows,
            "training_mse": report.training_mse,
            "validation_mse": report.validation_mse,
        }));
    } else {
        println!(
            "trained on {} rows ({} skipped), mse {:.6}",
            report.training_rows, report.skipped_rows, report.training_mse
        );
        if let Some(v) = report.validation_mse {
            println!("validation mse {v:.6}");
        }
        println!("model written to {}", out.display());
    }
    Ok(())
}

pub fn dataset_import(cfg: &Config, file: &Path, json_out: bool) -> Result<()> {
    let rows = dataset::read_rows(file)?;
    let mut store = open_store(cfg)?;
    let (imported, skipped) = dataset::import_rows(&mut store, &rows)?;
    let policy = OrchestratorConfig::from(&cfg.prediction).split;
    let mut rng = SmallRandom::from_seed_opt(cfg.random.seed);
    let promoted = dataset::rebalance(&mut store, policy, &mut rng)?;
    if json_out {
        print_json(&json!({
            "imported": imported,
            "skipped": skipped,
            "promoted": promoted,
        }));
    } else {
        println!("imported {imported} rows, skipped {skipped} duplicates, promoted {promoted}");
    }
    Ok(())
}
