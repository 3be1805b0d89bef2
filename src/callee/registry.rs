//! Function registry for dispatching requests by name.
//!
//! # Example
//!
//! ```ignore
//! use event_invoke::callee::{Function, FunctionRegistry};
//!
//! let mut registry = FunctionRegistry::new();
//!
//! // A single function, named after the fn item
//! registry.register(Function::sync(max))?;
//!
//! // A list, each under its own name
//! registry.register(vec![Function::new(sleep), Function::sync(max)])?;
//!
//! // A map, each under its key
//! registry.register(HashMap::from([("biggest".to_string(), Function::sync(max))]))?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::function::{Callable, Function};
use crate::error::{Result, RpcError};

/// Something that can be passed to `register`.
#[derive(Debug, Clone)]
pub enum Registration {
    /// One function under its own name.
    Function(Function),
    /// Any number of registrations, each resolved on its own.
    List(Vec<Registration>),
    /// Functions under explicit names; the function's own name is ignored.
    Map(Vec<(String, Function)>),
}

impl From<Function> for Registration {
    fn from(function: Function) -> Self {
        Registration::Function(function)
    }
}

impl From<Vec<Function>> for Registration {
    fn from(functions: Vec<Function>) -> Self {
        Registration::List(functions.into_iter().map(Registration::Function).collect())
    }
}

impl From<Vec<Registration>> for Registration {
    fn from(entries: Vec<Registration>) -> Self {
        Registration::List(entries)
    }
}

impl<const N: usize> From<[Function; N]> for Registration {
    fn from(functions: [Function; N]) -> Self {
        Vec::from(functions).into()
    }
}

impl From<HashMap<String, Function>> for Registration {
    fn from(map: HashMap<String, Function>) -> Self {
        Registration::Map(map.into_iter().collect())
    }
}

impl From<BTreeMap<String, Function>> for Registration {
    fn from(map: BTreeMap<String, Function>) -> Self {
        Registration::Map(map.into_iter().collect())
    }
}

/// Registry mapping function names to callables.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn Callable>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one function or a collection of them.
    ///
    /// All-or-nothing: if any entry lacks a usable name, nothing is added.
    /// A name registered twice keeps the later function.
    ///
    /// Returns the number of functions registered.
    pub fn register(&mut self, entry: impl Into<Registration>) -> Result<usize> {
        let mut resolved = Vec::new();
        resolve(entry.into(), &mut resolved)?;

        let count = resolved.len();
        for (name, callable) in resolved {
            if self.functions.insert(name.clone(), callable).is_some() {
                tracing::debug!(name = %name, "replaced registered function");
            }
        }
        Ok(count)
    }

    /// Look up a function by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Callable>> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn clear(&mut self) {
        self.functions.clear();
    }
}

fn resolve(entry: Registration, out: &mut Vec<(String, Arc<dyn Callable>)>) -> Result<()> {
    match entry {
        Registration::Function(function) => {
            let name = function.name().ok_or_else(|| {
                RpcError::InvalidRegistration(
                    "function has no discoverable name, use Function::named".into(),
                )
            })?;
            if name.is_empty() {
                return Err(RpcError::InvalidRegistration("empty function name".into()));
            }
            out.push((name.to_owned(), function.callable().clone()));
        }
        Registration::List(entries) => {
            for entry in entries {
                resolve(entry, out)?;
            }
        }
        Registration::Map(entries) => {
            for (name, function) in entries {
                if name.is_empty() {
                    return Err(RpcError::InvalidRegistration("empty function name".into()));
                }
                out.push((name, function.callable().clone()));
            }
        }
    }
    Ok(())
}
