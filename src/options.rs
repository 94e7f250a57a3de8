//! Reading the session options.
//!
//! Options are owned by the debugger front end. The engine only reads them, by path, whenever
//! it is told they changed.
use std::collections::BTreeMap;

use serde::Deserialize;

use crate::topology::DeviceNode;
use crate::Error;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(u64),
    Text(String),
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<u64> for OptionValue {
    fn from(value: u64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Text(value.to_owned())
    }
}

pub trait OptionStore {
    fn get_option_value(&self, path: &str) -> Option<OptionValue>;
}

/// Option paths understood by the engine.
pub mod paths {
    pub const TRACE_CAPTURE: &str = "options.trace.traceCapture";

    pub fn cluster_enabled(cluster: &str) -> String {
        format!("options.trace.clusters.{cluster}.enabled")
    }

    /// A per device trace option, such as `enabled` or `bufferSize`.
    pub fn trace(device: &str, leaf: &str) -> String {
        format!("options.trace.{device}.{leaf}")
    }

    pub fn core(core: &str, leaf: &str) -> String {
        format!("options.cores.{core}.{leaf}")
    }
}

pub fn get_bool(store: &dyn OptionStore, path: &str, default: bool) -> Result<bool, Error> {
    match store.get_option_value(path) {
        None => Ok(default),
        Some(OptionValue::Bool(value)) => Ok(value),
        Some(_) => Err(Error::OptionType {
            path: path.to_owned(),
            expected: "a boolean",
        }),
    }
}

/// Integers may also be given as `0x` prefixed text.
pub fn get_int(store: &dyn OptionStore, path: &str) -> Result<Option<u64>, Error> {
    let error = || Error::OptionType {
        path: path.to_owned(),
        expected: "an integer",
    };

    match store.get_option_value(path) {
        None => Ok(None),
        Some(OptionValue::Int(value)) => Ok(Some(value)),
        Some(OptionValue::Text(text)) => {
            let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
                None => text.parse(),
            };
            parsed.map(Some).map_err(|_| error())
        }
        Some(OptionValue::Bool(_)) => Err(error()),
    }
}

pub fn get_text(store: &dyn OptionStore, path: &str) -> Result<Option<String>, Error> {
    match store.get_option_value(path) {
        None => Ok(None),
        Some(OptionValue::Text(text)) => Ok(Some(text)),
        Some(_) => Err(Error::OptionType {
            path: path.to_owned(),
            expected: "text",
        }),
    }
}

/// Options kept in memory, keyed by their full path.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct MemoryOptionStore {
    values: BTreeMap<String, OptionValue>,
}

impl MemoryOptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn set(&mut self, path: &str, value: impl Into<OptionValue>) {
        self.values.insert(path.to_owned(), value.into());
    }
}

impl OptionStore for MemoryOptionStore {
    fn get_option_value(&self, path: &str) -> Option<OptionValue> {
        self.values.get(path).cloned()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ContextIdSize {
    #[default]
    None,
    Bits8,
    Bits16,
    Bits32,
}

impl ContextIdSize {
    fn parse(path: &str, value: Option<OptionValue>) -> Result<Self, Error> {
        let size = match value {
            None => Some(ContextIdSize::None),
            Some(OptionValue::Text(text)) => match text.as_str() {
                "none" | "None" => Some(ContextIdSize::None),
                "8" => Some(ContextIdSize::Bits8),
                "16" => Some(ContextIdSize::Bits16),
                "32" => Some(ContextIdSize::Bits32),
                _ => None,
            },
            Some(OptionValue::Int(0)) => Some(ContextIdSize::None),
            Some(OptionValue::Int(8)) => Some(ContextIdSize::Bits8),
            Some(OptionValue::Int(16)) => Some(ContextIdSize::Bits16),
            Some(OptionValue::Int(32)) => Some(ContextIdSize::Bits32),
            Some(_) => None,
        };

        size.ok_or_else(|| Error::OptionType {
            path: path.to_owned(),
            expected: "one of none, 8, 16 or 32",
        })
    }
}

/// Per source trace options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceSettings {
    pub timestamps: bool,
    pub context_ids: ContextIdSize,
    pub cycle_accurate: bool,
}

impl SourceSettings {
    /// Read the options of `source`, dropping anything the macrocell cannot do.
    pub fn read(store: &dyn OptionStore, source: &DeviceNode) -> Result<Self, Error> {
        let name = source.name.as_str();
        let mut settings = SourceSettings {
            timestamps: get_bool(store, &paths::trace(name, "timestamping"), false)?,
            context_ids: {
                let path = paths::trace(name, "contextIDs");
                ContextIdSize::parse(&path, store.get_option_value(&path))?
            },
            cycle_accurate: get_bool(store, &paths::trace(name, "cycleAccurate"), false)?,
        };

        let capabilities = source.capabilities;
        if settings.timestamps && !capabilities.timestamp {
            log::warn!("{} cannot generate timestamps", name);
            settings.timestamps = false;
        }
        if settings.context_ids != ContextIdSize::None && !capabilities.context_id {
            log::warn!("{} cannot trace context ids", name);
            settings.context_ids = ContextIdSize::None;
        }
        if settings.cycle_accurate && !capabilities.cycle_accurate {
            log::warn!("{} cannot trace cycle accurately", name);
            settings.cycle_accurate = false;
        }

        Ok(settings)
    }
}

/// Cache debug options of a core. Unrelated to trace, applied per core.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheDebug {
    pub debug: bool,
    pub preserve: bool,
}

impl CacheDebug {
    pub fn read(store: &dyn OptionStore, core: &str) -> Result<Self, Error> {
        Ok(CacheDebug {
            debug: get_bool(store, &paths::core(core, "cacheDebug"), false)?,
            preserve: get_bool(store, &paths::core(core, "cachePreserve"), false)?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::topology::{Capabilities, DeviceKind, SourceFamily, TopologyBuilder};

    #[test]
    fn yaml_values_keep_their_type() {
        let store = MemoryOptionStore::from_yaml(
            r#"
options.trace.traceCapture: ETR
options.trace.ETR.bufferBase: "0x8000_0000"
options.trace.ETR.bufferSize: 65536
options.cores.Cortex-A53_0.cacheDebug: true
"#,
        )
        .unwrap();

        assert_eq!(
            get_text(&store, paths::TRACE_CAPTURE).unwrap().as_deref(),
            Some("ETR")
        );
        assert_eq!(
            get_int(&store, &paths::trace("ETR", "bufferBase")).unwrap(),
            Some(0x8000_0000)
        );
        assert_eq!(
            get_int(&store, &paths::trace("ETR", "bufferSize")).unwrap(),
            Some(65536)
        );
        assert_eq!(
            CacheDebug::read(&store, "Cortex-A53_0").unwrap(),
            CacheDebug {
                debug: true,
                preserve: false
            }
        );
    }

    #[test]
    fn wrong_types_are_reported() {
        let mut store = MemoryOptionStore::new();
        store.set("options.trace.ETM_0.enabled", "yes");

        assert!(matches!(
            get_bool(&store, "options.trace.ETM_0.enabled", false),
            Err(Error::OptionType { .. })
        ));
        assert!(get_bool(&store, "options.trace.ETM_1.enabled", true).unwrap());
    }

    #[test]
    fn unsupported_source_features_are_dropped() {
        let mut builder = TopologyBuilder::new();
        let etm = builder
            .register_node(
                "ETM_0",
                DeviceKind::TraceSource(SourceFamily::Etm),
                Capabilities {
                    timestamp: true,
                    ..Capabilities::default()
                },
                None,
            )
            .unwrap();
        let topology = builder.build();

        let mut store = MemoryOptionStore::new();
        store.set(&paths::trace("ETM_0", "timestamping"), true);
        store.set(&paths::trace("ETM_0", "cycleAccurate"), true);
        store.set(&paths::trace("ETM_0", "contextIDs"), "32");

        assert_eq!(
            SourceSettings::read(&store, topology.node(etm)).unwrap(),
            SourceSettings {
                timestamps: true,
                context_ids: ContextIdSize::None,
                cycle_accurate: false,
            }
        );
    }
}
