//! Builds the runtime dispatch rules from configured producer names.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use lib_common::core::dispatcher::{DispatchRules, Producer};
use lib_common::sinks::LogSink;

/// Resolve `topic → [producer name …]` into live producers, preserving the
/// declared order. One producer instance per name, shared across topics.
///
/// `logger` is the sink shipped with the engine; broker producers register
/// here as they are added to the build.
pub fn build_dispatch_rules(named: &HashMap<String, Vec<String>>) -> Result<DispatchRules> {
    let mut instances: HashMap<String, Arc<dyn Producer>> = HashMap::new();
    let mut rules = DispatchRules::new();

    for (topic, names) in named {
        let mut producers = Vec::with_capacity(names.len());
        for name in names {
            let producer = match instances.get(name) {
                Some(existing) => existing.clone(),
                None => {
                    let created = instantiate(name, topic)?;
                    instances.insert(name.clone(), created.clone());
                    created
                }
            };
            producers.push(producer);
        }
        rules.insert(topic.clone(), producers);
    }

    Ok(rules)
}

fn instantiate(name: &str, topic: &str) -> Result<Arc<dyn Producer>> {
    match name {
        "logger" => Ok(Arc::new(LogSink::new("logger"))),
        other => bail!("unknown producer '{other}' configured for topic '{topic}'"),
    }
}
