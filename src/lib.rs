// #![warn(missing_docs)]

//! A reactive, in-process database of named process variables.
//!
//! A [`Database`] holds [`Record`]s. Each record carries a typed value (see [dbr]),
//! a timestamp, an [alarm](alarm::Alarm) and its metadata, and owns exactly one
//! [`Processor`](processor::Processor) that decides how the value is produced:
//!
//! - [`processor::MemoryValueProcessor`]: a plain stored value, optionally fixed.
//! - [`processor::LinkedValueProcessor`]: mirrors one or more other records through
//!   [`links::ValueLinks`], with an optional transform, and can write through.
//! - [`processor::DefaultAlarmProcessor`]: a boolean alarm flag with gating and a
//!   suppression window that filters out short blips.
//! - [`processor::CommandValueProcessor`]: a momentary flag that drops back after a
//!   timeout, optionally forwarded to other records.
//! - [`processor::EnumValueProcessor`] and [`processor::OnDemandValueProcessor`].
//!
//! Links resolve names against the local database first and then through a
//! [`RemoteConnector`](remote::RemoteConnector). Unresolved names are retried in the
//! background, and bursts of updates are coalesced before they reach the owner.
//! Records flagged persistent are saved to a [`PersistenceStore`](persist::PersistenceStore)
//! on every change and restored when they are added.
//!
//! All timers and background work run on one [`Scheduler`](scheduler::Scheduler) per
//! database; the public API is synchronous and can be called from any thread.
//!
//! ## Example
//!
//! ```
//! use pvdb::{DatabaseBuilder, Record, dbr::DbrValue};
//! use pvdb::processor::{LinkedValueProcessor, MemoryValueProcessor, Processor, Transform};
//! use pvdb::dbr::DbrBasicType;
//!
//! let db = DatabaseBuilder::new("example").build();
//! let raw = Record::builder("RAW").build();
//! let scaled = Record::builder("SCALED")
//!     .processor(Processor::Linked(
//!         LinkedValueProcessor::new(
//!             MemoryValueProcessor::new(DbrBasicType::Double, 1),
//!             vec!["RAW".into()],
//!         )
//!         .transform(Transform::linear(0.0, 2.0)),
//!     ))
//!     .build();
//! db.add_all([raw.clone(), scaled.clone()]);
//! db.activate();
//! raw.set_value(21.0f64);
//! # for _ in 0..200 {
//! #     if scaled.get_value() == DbrValue::Double(vec![42.0]) { break }
//! #     std::thread::sleep(std::time::Duration::from_millis(10));
//! # }
//! assert_eq!(scaled.get_value(), DbrValue::Double(vec![42.0]));
//! db.shutdown();
//! ```

pub mod activation;
pub mod alarm;
pub mod config;
pub mod database;
pub mod dbr;
pub mod events;
pub mod holder;
pub mod links;
pub mod persist;
pub mod processor;
pub mod record;
pub mod remote;
pub mod scheduler;
pub mod utils;

pub use crate::config::{DatabaseBuilder, DatabaseConfig};
pub use crate::database::{Application, Database, DatabaseChannel, DatabaseEvent};
pub use crate::record::{Record, RecordBuilder, RecordError};
