use std::collections::HashMap;
use std::sync::Arc;

use log::info;

use crate::analysis::module_trait::AnalysisModule;
use crate::analysis::protocol_stats::ProtocolStats;
use crate::error_handling::types::ConfigError;

/// Lookup table of analysis modules by name.
#[derive(Default, Clone)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn AnalysisModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every module compiled into the crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ProtocolStats::default()));
        registry
    }

    /// Adds `module`, replacing any module registered under the same name.
    pub fn register(&mut self, module: Arc<dyn AnalysisModule>) {
        info!(
            "Registered analysis module {} v{}",
            module.name(),
            module.version()
        );
        self.modules.insert(module.name().to_string(), module);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AnalysisModule>> {
        self.modules.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }

    /// Modules for an `enabled` list; `None` selects all of them.
    pub fn resolve(&self, enabled: Option<&[String]>) -> Result<Vec<Arc<dyn AnalysisModule>>, ConfigError> {
        match enabled {
            None => Ok(self
                .names()
                .iter()
                .filter_map(|n| self.get(n))
                .collect()),
            Some(names) => names
                .iter()
                .map(|n| self.get(n).ok_or_else(|| ConfigError::UnknownModule(n.clone())))
                .collect(),
        }
    }
}
