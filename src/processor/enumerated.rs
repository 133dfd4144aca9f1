use tracing::warn;

use crate::{
    alarm::Alarm,
    dbr::{DbrBasicType, DbrValue},
    record::Record,
};

use super::{ConfigError, MemoryValueProcessor, ProcessorConfig};

/// An index into a fixed list of labels
#[derive(Debug)]
pub struct EnumValueProcessor {
    pub(crate) memory: MemoryValueProcessor,
    labels: Vec<String>,
}

impl EnumValueProcessor {
    pub fn new(labels: Vec<String>, initial: u16) -> Self {
        EnumValueProcessor {
            memory: MemoryValueProcessor::with_initial(DbrValue::Enum(initial)),
            labels,
        }
    }

    pub fn configure(config: &ProcessorConfig) -> Result<Self, ConfigError> {
        let labels = config.list("labels");
        if labels.is_empty() {
            return Err(ConfigError::MissingProperty("labels".to_string()));
        }
        let config = config.clone().with("type", "ENUM").with("count", "1");
        let memory = MemoryValueProcessor::configure(&config, DbrBasicType::Enum, &labels)?;
        if let Some(index) = memory.value().as_i64()
            && index >= labels.len() as i64
        {
            return Err(ConfigError::InvalidProperty {
                key: "initial".to_string(),
                value: index.to_string(),
            });
        }
        Ok(EnumValueProcessor { memory, labels })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn label(&self) -> Option<String> {
        let index = self.memory.value().as_i64()?;
        self.labels.get(usize::try_from(index).ok()?).cloned()
    }

    /// Accepts an index or a label. Out-of-range values are dropped.
    pub(crate) fn set_value(
        &self,
        record: &Record,
        value: DbrValue,
        alarm: Option<Alarm>,
        notify: bool,
        force: bool,
    ) -> bool {
        let index = match value.parse_into(DbrBasicType::Enum, &self.labels) {
            Ok(parsed) => parsed.as_i64(),
            Err(e) => {
                warn!("{}: {e}", record.name());
                return false;
            }
        };
        match index {
            Some(i) if (0..self.labels.len() as i64).contains(&i) => {
                self.memory
                    .set_value(record, DbrValue::Enum(i as u16), alarm, notify, force)
            }
            _ => {
                warn!("{}: {value:?} is not one of {:?}", record.name(), self.labels);
                false
            }
        }
    }
}
