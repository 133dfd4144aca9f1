use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use pvdb::{
    DatabaseBuilder, Record,
    alarm::{Alarm, AlarmStatus, Severity},
    dbr::DbrBasicType,
    events::{RecordChannel, RecordEvent},
    persist::FileStore,
    processor::{
        CommandValueProcessor, DefaultAlarmProcessor, LinkedValueProcessor,
        MemoryValueProcessor, Processor, Transform,
    },
};
use tokio::select;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Options {
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Keep persistent values in this file
    #[clap(long)]
    store: Option<PathBuf>,
    /// Seconds between setpoint steps
    #[clap(long, default_value_t = 2)]
    period: u64,
    /// Alarm suppression window, in milliseconds
    #[clap(long, default_value_t = 3000)]
    suppress_ms: u64,
}

fn log_changes(record: &Arc<Record>) {
    for channel in [RecordChannel::Value, RecordChannel::Alarm] {
        record.add_listener(
            channel,
            Arc::new(move |event: &RecordEvent| {
                let value = event
                    .holder
                    .value
                    .as_ref()
                    .map(|v| v.to_display_string(Some(3), &[]))
                    .unwrap_or_default();
                info!(
                    "{} {:?}: {value} {}",
                    event.holder.name,
                    event.channel,
                    event.holder.alarm()
                );
            }),
        );
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Make sure panics from threads cause the whole process to terminate
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));
    let opts = Options::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(
                    match opts.verbose {
                        0 => LevelFilter::INFO,
                        1 => LevelFilter::DEBUG,
                        2.. => LevelFilter::TRACE,
                    }
                    .into(),
                )
                .from_env_lossy(),
        )
        .init();

    let mut builder = DatabaseBuilder::new("demo");
    if let Some(path) = &opts.store {
        match FileStore::open(path) {
            Ok(store) => builder = builder.store(Arc::new(store)),
            Err(e) => warn!("Could not open store {}: {e}", path.display()),
        }
    }
    let db = builder.build();

    let setpoint = Record::builder("DEMO:SETPOINT")
        .units("mA")
        .precision(2)
        .persistent(true)
        .build();
    let readback = Record::builder("DEMO:READBACK")
        .units("uA")
        .processor(Processor::Linked(
            LinkedValueProcessor::new(
                MemoryValueProcessor::new(DbrBasicType::Double, 1),
                vec!["DEMO:SETPOINT".into()],
            )
            .transform(Transform::linear(0.0, 1000.0)),
        ))
        .build();
    let enable = Record::builder("DEMO:ENABLE")
        .processor(Processor::Memory(MemoryValueProcessor::with_initial(
            true.into(),
        )))
        .build();
    let over = Record::builder("DEMO:OVER")
        .processor(Processor::Alarm(
            DefaultAlarmProcessor::new(Duration::from_millis(opts.suppress_ms))
                .gate(vec!["DEMO:ENABLE".into()], 1),
        ))
        .build();
    let reset = Record::builder("DEMO:RESET")
        .processor(Processor::Command(
            CommandValueProcessor::new(Duration::from_millis(500))
                .forward(vec!["DEMO:SETPOINT".into()]),
        ))
        .build();

    for record in [&setpoint, &readback, &over, &reset] {
        log_changes(record);
    }
    db.add_all([
        setpoint.clone(),
        readback.clone(),
        enable,
        over.clone(),
        reset.clone(),
    ]);
    db.activate();
    if setpoint.is_undefined() {
        setpoint.set_value(0.0f64);
    }

    let mut step = 0u64;
    loop {
        select! {
            _ = tokio::time::sleep(Duration::from_secs(opts.period)) => (),
            _ = tokio::signal::ctrl_c() => {
                println!("Ctrl-C: Shutting down");
                break;
            },
        };
        step += 1;
        let next = setpoint.get_value().as_f64().unwrap_or_default() + 0.25;
        setpoint.set_value(next);

        let current = readback.get_value().as_f64().unwrap_or_default();
        let raw = if current > 1000.0 {
            Alarm::new(Severity::Major, AlarmStatus::HiHi)
        } else {
            Alarm::NONE
        };
        if let Processor::Alarm(alarm) = &*over.processor() {
            alarm.set_raw_alarm(&over, raw);
        }
        if step % 10 == 0 {
            // The command is forwarded to the setpoint, which takes the pulse as 1.0
            info!("Pulsing reset");
            reset.set_value(true);
            setpoint.set_value(0.0f64);
        }
    }
    db.shutdown();
}
