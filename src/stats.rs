use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use prometheus::{Encoder, Registry, TextEncoder};

const SEP: &str = ":";

/// Self-telemetry for the relay process, backed by a prometheus registry.
///
/// The collector and everything built from it are cloneable; clones keep
/// referring to the same registry and counters, and building a counter
/// with an existing name returns the previously registered one.
#[derive(Clone, Debug)]
pub struct Collector {
    // Registry is internally shared and freely cloneable.
    registry: Registry,
    counters: Arc<Mutex<HashMap<String, Counter>>>,
}

impl Default for Collector {
    fn default() -> Self {
        Collector {
            registry: Registry::new(),
            counters: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Collector {
    pub fn scope(&self, prefix: &str) -> Scope {
        Scope {
            collector: self.clone(),
            scope: String::from(prefix),
        }
    }

    /// Prometheus text exposition of the current registry contents.
    pub fn prometheus_output(&self) -> Result<Vec<u8>> {
        let output = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buffer = vec![];

        encoder.encode(&output, &mut buffer)?;
        Ok(buffer)
    }

    fn register_counter(&self, c: Counter) -> Result<Counter> {
        let mut counters = self.counters.lock();
        let counter = match counters.get(&c.name) {
            Some(existing) => existing.clone(),
            None => {
                self.registry.register(Box::new(c.counter.clone()))?;
                counters.insert(c.name.clone(), c.clone());
                c
            }
        };

        Ok(counter)
    }
}

/// A name prefix over a collector. Scopes nest.
#[derive(Clone, Debug)]
pub struct Scope {
    collector: Collector,
    scope: String,
}

impl Scope {
    pub fn scope(&self, extend: &str) -> Scope {
        Scope {
            scope: format!("{}{}{}", self.scope, SEP, extend),
            collector: self.collector.clone(),
        }
    }

    /// Create a new counter under this scope, or return the existing
    /// counter with the same name.
    pub fn counter(&self, name: &str) -> Result<Counter> {
        let name = format!("{}{}{}", self.scope, SEP, name);
        let counter = Counter::new(name)?;
        self.collector.register_counter(counter)
    }
}

#[derive(Clone, Debug)]
pub struct Counter {
    name: String,
    counter: prometheus::Counter,
}

impl Counter {
    fn new(name: String) -> Result<Self> {
        let counter = prometheus::Counter::new(name.clone(), "a counter")?;
        Ok(Self { name, counter })
    }

    pub fn inc(&self) {
        self.counter.inc();
    }

    pub fn inc_by(&self, value: f64) {
        self.counter.inc_by(value);
    }

    pub fn get(&self) -> f64 {
        self.counter.get()
    }
}
