//! Built-in plugins registered by [`PluginRegistry::with_defaults`].

mod datajets;
mod generators;
mod wrappers;

use serde_json::json;

use crate::config::{config_from_value, parse_config};
use crate::error::Result;
use crate::registry::PluginRegistry;

pub use datajets::{DiscardDatajet, FileDatajet, StdoutDatajet};
pub use generators::{IncrementGenerator, LibraryGenerator, StaticGenerator};
pub use wrappers::{PassthroughWrapper, RepeatWrapper};

pub fn register_defaults(registry: &mut PluginRegistry) -> Result<()> {
    let generators = registry.generators_mut();
    generators.register(
        "increment",
        config_from_value(json!({"batchSize": 10, "batchCount": 1, "key": "value"})),
        |config, _| Ok(Box::new(IncrementGenerator::new(parse_config(config)?)?)),
    )?;
    generators.register(
        "static",
        config_from_value(json!({"records": [], "repeat": 1})),
        |config, _| Ok(Box::new(StaticGenerator::new(parse_config(config)?))),
    )?;
    generators.register("library", config_from_value(json!({})), |config, deps| {
        Ok(Box::new(LibraryGenerator::new(parse_config(config)?, deps)?))
    })?;

    let datajets = registry.datajets_mut();
    datajets.register("stdout", config_from_value(json!({})), |config, _| {
        Ok(Box::new(StdoutDatajet::new(parse_config(config)?)))
    })?;
    datajets.register(
        "file",
        config_from_value(json!({"path": "output.jsonl"})),
        |config, deps| Ok(Box::new(FileDatajet::new(parse_config(config)?, deps)?)),
    )?;
    datajets.register("discard", config_from_value(json!({})), |_, _| {
        Ok(Box::new(DiscardDatajet))
    })?;

    let wrappers = registry.wrappers_mut();
    wrappers.register("passthrough", config_from_value(json!({})), |_, _| {
        Ok(Box::new(PassthroughWrapper))
    })?;
    wrappers.register("repeat", config_from_value(json!({"times": 2})), |config, _| {
        Ok(Box::new(RepeatWrapper::new(parse_config(config)?)?))
    })?;

    Ok(())
}
