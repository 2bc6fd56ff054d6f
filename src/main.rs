use anyhow::{Context, Result};
use clap::Parser;
use lab_daq::{
    run_session, AcquisitionState, Conf, LiveMonitor, Progress, SessionOutcome, SessionRecorder,
    SimulatedDevice, StreamingAcquisitionController, Tick,
};
use log::{error, info, LevelFilter};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};
use std::{fs::File, path::PathBuf};

/// Single fixed-duration analog acquisition with live plot and HDF5 persistence.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, default_value = "daq.toml")]
    config: PathBuf,

    /// Override the session name from the configuration
    #[arg(short, long)]
    session: Option<String>,

    /// Override the HDF5 store path
    #[arg(long)]
    store: Option<String>,

    /// Log progress instead of drawing the live chart
    #[arg(long)]
    headless: bool,

    /// Log file
    #[arg(long, default_value = "lab_daq.log")]
    log: PathBuf,
}

fn init_logging(args: &Args) -> Result<()> {
    let config = ConfigBuilder::new().set_time_format_rfc3339().build();
    let file = File::create(&args.log)
        .with_context(|| format!("cannot create log file {}", args.log.display()))?;
    let mut loggers: Vec<Box<dyn SharedLogger>> =
        vec![WriteLogger::new(LevelFilter::Debug, config.clone(), file)];
    // The live chart owns the terminal, so only log there when headless.
    if args.headless {
        loggers.push(TermLogger::new(
            LevelFilter::Info,
            config,
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ));
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}

fn load_config(args: &Args) -> Result<Conf> {
    let mut conf = Conf::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(session) = &args.session {
        conf.run_settings.session_name = session.clone();
    }
    if let Some(store) = &args.store {
        conf.run_settings.store_name = Some(store.clone());
    }
    conf.validate()?;
    Ok(conf)
}

/// Device name of the first channel, e.g. `Dev1` for `Dev1/ai0`.
fn device_name(conf: &Conf) -> String {
    conf.channels
        .first()
        .and_then(|ch| ch.device_channel_id.split('/').next())
        .unwrap_or("Dev1")
        .to_string()
}

fn run_headless(
    controller: &mut StreamingAcquisitionController<SimulatedDevice>,
    recorder: &SessionRecorder,
) -> Result<SessionOutcome> {
    let mut progress = Progress::new(controller.conf().total_samples());
    let outcome = run_session(controller, recorder, |session| {
        progress.update(session.next_offset());
        info!(
            "{}/{} samples ({:.0}%), {:.0} S/s",
            progress.acquired,
            progress.total_samples,
            100.0 * progress.fraction(),
            progress.rate()
        );
        Tick::Continue
    })?;
    Ok(outcome)
}

fn run_with_monitor(
    controller: &mut StreamingAcquisitionController<SimulatedDevice>,
    recorder: &SessionRecorder,
) -> Result<SessionOutcome> {
    let mut monitor = LiveMonitor::new(controller.conf());
    let mut terminal = ratatui::init();
    let res = run_session(controller, recorder, |session| {
        monitor.on_tick(&mut terminal, session)
    });
    let shown = match controller.session() {
        Some(session) if res.is_ok() => monitor.linger(&mut terminal, session),
        _ => Ok(()),
    };
    ratatui::restore();

    if let Some(e) = monitor.take_failure() {
        error!("live monitor stopped the session: {e}");
    }
    let outcome = res?;
    shown?;
    Ok(outcome)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let conf = load_config(&args)?;
    let session_name = conf.run_settings.session_name.clone();
    let recorder = SessionRecorder::new(conf.store_name());

    // Refuse a duplicate before the device or the terminal is touched.
    recorder.ensure_new_session(&session_name)?;
    println!("\n{session_name}\n");
    info!("Ready to start!");

    let device = SimulatedDevice::new(&device_name(&conf));
    let mut controller = StreamingAcquisitionController::new(device, conf);
    let outcome = if args.headless {
        run_headless(&mut controller, &recorder)?
    } else {
        run_with_monitor(&mut controller, &recorder)?
    };

    println!(
        "Session '{}' {}: {} samples per channel saved to {}",
        session_name,
        outcome.state,
        outcome.samples_acquired,
        recorder.path().display()
    );
    match outcome.fault {
        Some(fault) => {
            error!("session ended with a fault: {fault}");
            if fault.is_mid_run() {
                println!("Partial data up to sample {} was kept.", outcome.samples_acquired);
            }
            Err(fault.into())
        }
        None if outcome.state == AcquisitionState::Completed => {
            println!("END of case: {session_name}");
            Ok(())
        }
        None => {
            println!("Stopped early; the trailing part of every series is zero.");
            Ok(())
        }
    }
}
