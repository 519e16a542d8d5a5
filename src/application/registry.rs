use std::collections::HashMap;
use std::sync::Arc;

use crate::application::algo::Algo;
use crate::application::strategies::TwapAlgo;
use crate::domain::params::ParamDefs;

pub type AlgoFactory = Arc<dyn Fn() -> Box<dyn Algo> + Send + Sync>;

/// Strategy implementations by name.
#[derive(Default, Clone)]
pub struct AlgoRegistry {
    factories: HashMap<String, AlgoFactory>,
}

impl AlgoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the strategies shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(TwapAlgo::NAME, || Box::new(TwapAlgo::default()));
        registry
    }

    /// Adds or replaces the factory for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Algo> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn Algo>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Schema of `name`, for rendering and validating input before a spawn.
    pub fn param_defs(&self, name: &str) -> Option<ParamDefs> {
        self.create(name).map(|algo| algo.param_defs())
    }
}

impl std::fmt::Debug for AlgoRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlgoRegistry")
            .field("names", &self.names())
            .finish()
    }
}
