use std::{collections::HashMap, fmt, sync::Arc};

use crate::error::EngineError;

use super::Runner;

type RunnerFactory = Box<dyn Fn() -> Arc<dyn Runner> + Send + Sync>;

#[derive(Default)]
pub struct RunnerRegistry {
    factories: HashMap<String, RunnerFactory>,
}

impl RunnerRegistry {
    pub fn builder() -> RunnerRegistryBuilder {
        RunnerRegistryBuilder::default()
    }

    pub fn resolve(&self, tool_name: &str) -> Result<Arc<dyn Runner>, EngineError> {
        self.factories
            .get(tool_name)
            .map(|factory| factory())
            .ok_or_else(|| EngineError::ToolNotRegistered(tool_name.to_string()))
    }

    pub fn contains(&self, tool_name: &str) -> bool {
        self.factories.contains_key(tool_name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("RunnerRegistry").field("runners", &names).finish()
    }
}

#[derive(Default)]
pub struct RunnerRegistryBuilder {
    factories: HashMap<String, RunnerFactory>,
}

impl RunnerRegistryBuilder {
    pub fn register<R, F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        R: Runner + 'static,
        F: Fn() -> R + Send + Sync + 'static,
    {
        self.factories.insert(
            name.into(),
            Box::new(move || Arc::new(factory()) as Arc<dyn Runner>),
        );
        self
    }

    pub fn build(self) -> RunnerRegistry {
        RunnerRegistry {
            factories: self.factories,
        }
    }
}
