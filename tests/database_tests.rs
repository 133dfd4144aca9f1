use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use pvdb::{
    Database, DatabaseBuilder, Record,
    alarm::{Alarm, AlarmStatus, Severity},
    dbr::{DbrBasicType, DbrValue},
    persist::{FileStore, PersistenceStore},
    processor::{
        LinkedValueProcessor, MemoryValueProcessor, Processor, ProcessorConfig,
        ProcessorRegistry,
    },
    remote::PeerConnector,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::TestWriter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_writer(TestWriter::new())
        .try_init();
}

/// Poll until `condition` holds, for at most a few seconds
fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn memory(name: &str, initial: f64) -> Arc<Record> {
    Record::builder(name)
        .processor(Processor::Memory(MemoryValueProcessor::with_initial(
            initial.into(),
        )))
        .build()
}

fn linked(name: &str, targets: &[&str], writable: bool) -> Arc<Record> {
    Record::builder(name)
        .processor(Processor::Linked(
            LinkedValueProcessor::new(
                MemoryValueProcessor::new(DbrBasicType::Double, 1),
                targets.iter().map(|t| t.to_string()).collect(),
            )
            .writable(writable),
        ))
        .build()
}

fn fast_database(name: &str) -> Database {
    DatabaseBuilder::new(name)
        .link_update_interval(Duration::from_millis(5))
        .link_retry_period(Duration::from_millis(50))
        .build()
}

#[test]
fn linked_record_follows_memory_record() {
    init_logging();
    let db = fast_database("scenario");
    let a = memory("A", 1.0);
    let b = linked("B", &["A"], false);
    db.add_all([a.clone(), b.clone()]);
    db.activate();

    a.set_value(2.0f64);
    assert!(wait_for(|| b.get_value() == DbrValue::Double(vec![2.0])));
    assert_eq!(b.alarm(), Alarm::NONE);
    db.shutdown();
}

#[test]
fn duplicate_registration_is_rejected() {
    init_logging();
    let db = fast_database("scenario");
    assert!(db.add_record(memory("DUP", 1.0)));
    assert!(!db.add_record(memory("DUP", 2.0)));
    assert_eq!(db.count(), 1);
    assert_eq!(
        db.get_record("DUP").unwrap().get_value(),
        DbrValue::Double(vec![1.0])
    );
}

#[test]
fn unresolved_link_keeps_record_invalid() {
    init_logging();
    let db = fast_database("scenario");
    let a = memory("A", 1.0);
    let b = linked("B", &["A", "MISSING"], false);
    db.add_all([a, b.clone()]);
    db.activate();

    let processor = b.processor();
    let Processor::Linked(processor) = processor.as_ref() else {
        panic!("B is not linked");
    };
    let links = processor.links().unwrap();
    assert!(links.is_invalid());
    assert_eq!(links.get_not_connected(), vec!["MISSING".to_string()]);
    assert!(wait_for(|| b.alarm() == Alarm::LINK_INVALID));
    thread::sleep(Duration::from_millis(200));
    assert!(!links.is_ready());
    assert_eq!(b.alarm(), Alarm::LINK_INVALID);
    db.shutdown();
}

#[test]
fn late_registration_resolves_pending_links() {
    init_logging();
    let db = fast_database("scenario");
    let b = linked("B", &["LATE"], false);
    db.add_record(b.clone());
    db.activate();
    assert!(wait_for(|| b.alarm() == Alarm::LINK_INVALID));

    let late = memory("LATE", 0.0);
    late.set_value(6.5f64);
    db.add_record(late.clone());
    assert!(late.is_activated());
    assert!(wait_for(|| b.get_value() == DbrValue::Double(vec![6.5])));
    assert!(wait_for(|| b.alarm() == Alarm::NONE));
    db.shutdown();
}

#[test]
fn persistent_values_survive_a_restart() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pvdb.values");

    let build = |store: Arc<FileStore>| {
        let db = DatabaseBuilder::new("persist").store(store).build();
        let record = Record::builder("SETPOINT").persistent(true).build();
        let scratch = Record::builder("SCRATCH").build();
        db.add_all([record.clone(), scratch.clone()]);
        (db, record, scratch)
    };

    {
        let store = Arc::new(FileStore::open(&path).unwrap());
        let (db, record, scratch) = build(store);
        db.activate();
        assert!(record.is_undefined());
        record.set_value(42.25f64);
        scratch.set_value(1.0f64);
        db.shutdown();
    }

    let store = Arc::new(FileStore::open(&path).unwrap());
    assert_eq!(store.load("SETPOINT::value").as_deref(), Some("42.25"));
    assert_eq!(store.load("SCRATCH::value"), None);
    let (db, record, scratch) = build(store);
    assert_eq!(record.get_value(), DbrValue::Double(vec![42.25]));
    assert_eq!(record.alarm(), Alarm::NONE);
    assert!(scratch.is_undefined());
    db.shutdown();
}

#[test]
fn links_reach_peer_databases() {
    init_logging();
    let peer = fast_database("peer");
    let remote = memory("REMOTE:A", 1.0);
    let readonly = Record::builder("REMOTE:RO")
        .writable(false)
        .processor(Processor::Memory(MemoryValueProcessor::with_initial(
            0.0f64.into(),
        )))
        .build();
    peer.add_all([remote.clone(), readonly]);
    peer.activate();

    let connector = Arc::new(PeerConnector::new());
    connector.add_peer(&peer);
    let local = DatabaseBuilder::new("local")
        .link_update_interval(Duration::from_millis(5))
        .connector(connector)
        .build();
    let mirror = linked("MIRROR", &["REMOTE:A"], true);
    let out = linked("OUT", &["REMOTE:RO"], true);
    local.add_all([mirror.clone(), out.clone()]);
    local.activate();

    assert!(wait_for(|| mirror.get_value() == DbrValue::Double(vec![1.0])));
    remote.set_value(3.0f64);
    assert!(wait_for(|| mirror.get_value() == DbrValue::Double(vec![3.0])));

    // Writes go through to the peer
    mirror.set_value(5.0f64);
    assert_eq!(remote.get_value(), DbrValue::Double(vec![5.0]));
    out.set_value(1.0f64);
    assert_eq!(out.alarm(), Alarm::new(Severity::Major, AlarmStatus::Link));

    let processor = mirror.processor();
    let Processor::Linked(link_processor) = processor.as_ref() else {
        panic!("MIRROR is not linked");
    };
    let links = link_processor.links().unwrap();
    assert!(links.is_ready());

    // The peer going away looks like a dropped connection
    peer.deactivate();
    assert!(wait_for(|| mirror.alarm() == Alarm::LINK_INVALID));
    assert!(links.is_invalid());
    // Readiness is latched for the life of the links
    assert!(links.is_ready());
    peer.activate();
    assert!(wait_for(|| mirror.alarm() == Alarm::NONE));

    local.shutdown();
    peer.shutdown();
}

#[test]
fn reconnect_moves_a_live_link() {
    init_logging();
    let db = fast_database("scenario");
    let a = memory("A", 0.0);
    let b = memory("B", 0.0);
    let l = linked("L", &["A"], false);
    db.add_all([a.clone(), b.clone(), l.clone()]);
    db.activate();
    a.set_value(1.0f64);
    b.set_value(2.0f64);
    assert!(wait_for(|| l.get_value() == DbrValue::Double(vec![1.0])));

    let processor = l.processor();
    let Processor::Linked(link_processor) = processor.as_ref() else {
        panic!("L is not linked");
    };
    let old_links = link_processor.links().unwrap();
    link_processor.reconnect(&l, vec!["B".into()]);
    assert_eq!(link_processor.link_names(), vec!["B".to_string()]);
    assert!(!old_links.is_active());
    assert!(wait_for(|| l.get_value() == DbrValue::Double(vec![2.0])));

    // The old source no longer drives the value
    a.set_value(10.0f64);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(l.get_value(), DbrValue::Double(vec![2.0]));
    b.set_value(3.0f64);
    assert!(wait_for(|| l.get_value() == DbrValue::Double(vec![3.0])));
    db.shutdown();
}

#[test]
fn metadata_is_copied_from_the_first_link_once() {
    init_logging();
    let db = fast_database("scenario");
    let source = Record::builder("SRC").units("mA").precision(2).build();
    let mirror = linked("MIRROR", &["SRC"], false);
    db.add_all([source.clone(), mirror.clone()]);
    db.activate();
    source.set_value(1.0f64);
    assert!(wait_for(|| mirror.get_value() == DbrValue::Double(vec![1.0])));
    assert_eq!(mirror.metadata().units, "mA");
    assert_eq!(mirror.metadata().precision, Some(2));

    let mut changed = source.metadata();
    changed.units = "A".into();
    source.set_metadata(changed);
    source.set_value(2.0f64);
    assert!(wait_for(|| mirror.get_value() == DbrValue::Double(vec![2.0])));
    assert_eq!(mirror.metadata().units, "mA");
    db.shutdown();
}

#[test]
fn live_record_takes_a_new_processor() {
    init_logging();
    let db = fast_database("scenario");
    let a = memory("A", 0.0);
    let x = memory("X", 0.0);
    db.add_all([a.clone(), x.clone()]);
    db.activate();
    a.set_value(7.0f64);
    x.set_value(1.5f64);
    assert_eq!(x.basic_type(), DbrBasicType::Double);

    x.set_processor(Processor::Linked(LinkedValueProcessor::new(
        MemoryValueProcessor::new(DbrBasicType::Long, 1),
        vec!["A".into()],
    )));
    assert_eq!(x.basic_type(), DbrBasicType::Long);
    assert!(wait_for(|| x.get_value() == DbrValue::Long(vec![7])));
    a.set_value(8.0f64);
    assert!(wait_for(|| x.get_value() == DbrValue::Long(vec![8])));
    db.shutdown();
}

#[test]
fn records_built_from_configuration() {
    init_logging();
    let registry = ProcessorRegistry::new();
    let db = fast_database("configured");
    let entries = [
        (
            "RAW",
            ProcessorConfig::new()
                .with("processor", "memory")
                .with("type", "LONG")
                .with("initial", "10"),
        ),
        (
            "SCALED",
            ProcessorConfig::new()
                .with("processor", "linked")
                .with("links", "RAW")
                .with("transform", "1,0.5"),
        ),
        (
            "ENABLE",
            ProcessorConfig::new()
                .with("processor", "enum")
                .with("labels", "OFF,ON")
                .with("initial", "ON"),
        ),
        (
            "FAULT",
            ProcessorConfig::new()
                .with("processor", "alarm")
                .with("gate", "ENABLE"),
        ),
        (
            "PULSE",
            ProcessorConfig::new()
                .with("processor", "command")
                .with("timeout_ms", "100"),
        ),
    ];
    for (name, config) in &entries {
        assert!(db.add_record(registry.build_record(name, config).unwrap()));
    }
    db.activate();
    // Records start undefined until their first write
    db.get_record("ENABLE")
        .unwrap()
        .set_value_as_string("ON")
        .unwrap();

    let scaled = db.get_record("SCALED").unwrap();
    assert!(wait_for(|| scaled.get_value() == DbrValue::Double(vec![6.0])));

    let fault = db.get_record("FAULT").unwrap();
    let processor = fault.processor();
    let Processor::Alarm(alarm) = processor.as_ref() else {
        panic!("FAULT is not an alarm");
    };
    assert!(wait_for(|| alarm.is_gate_open() && fault.alarm() == Alarm::NONE));
    assert!(!fault.get_value().as_bool());
    alarm.set_raw_alarm(&fault, Alarm::new(Severity::Minor, AlarmStatus::State));
    assert!(fault.get_value().as_bool());
    assert_eq!(fault.alarm(), Alarm::new(Severity::Minor, AlarmStatus::State));

    let pulse = db.get_record("PULSE").unwrap();
    pulse.set_value(true);
    assert!(pulse.get_value().as_bool());
    assert!(wait_for(|| !pulse.get_value().as_bool()));
    db.shutdown();
}
