// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Evaluation of named caveats.
//!
//! The engine does not interpret caveat source text; callers register each
//! caveat as a name, the context fields it requires, and a predicate over
//! the merged context. At evaluation time the tuple's captured context is
//! overlaid on the caller-supplied context (the tuple wins on conflicts).
//! If any required field is absent the outcome is `Missing`, which the
//! evaluator surfaces as a caveated membership listing those fields.

use serde_json::Map;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use warden_types::CaveatReference;
use warden_types::Error;
use warden_types::Result;

type CaveatPredicate =
    Arc<dyn Fn(&Map<String, Value>) -> Result<bool> + Send + Sync>;

/// One registered caveat.
#[derive(Clone)]
pub struct CaveatDefinition {
    pub name: String,
    /// Context fields that must be present (from tuple or caller) before
    /// the predicate can run.
    pub required_fields: Vec<String>,
    predicate: CaveatPredicate,
}

impl CaveatDefinition {
    pub fn new<F>(
        name: impl Into<String>,
        required_fields: Vec<&str>,
        predicate: F,
    ) -> CaveatDefinition
    where
        F: Fn(&Map<String, Value>) -> Result<bool> + Send + Sync + 'static,
    {
        CaveatDefinition {
            name: name.into(),
            required_fields: required_fields
                .into_iter()
                .map(String::from)
                .collect(),
            predicate: Arc::new(predicate),
        }
    }
}

/// The outcome of evaluating one caveat reference.
#[derive(Clone, Debug, PartialEq)]
pub enum CaveatOutcome {
    True,
    False,
    /// The predicate could not run; these context fields were absent.
    Missing(Vec<String>),
}

/// The set of caveats known to this engine instance.
#[derive(Clone, Default)]
pub struct CaveatRegistry {
    definitions: BTreeMap<String, CaveatDefinition>,
}

impl CaveatRegistry {
    pub fn new() -> CaveatRegistry {
        CaveatRegistry::default()
    }

    pub fn register(&mut self, definition: CaveatDefinition) {
        self.definitions.insert(definition.name.clone(), definition);
    }

    /// Evaluates `reference` under `caller_context`. The reference's own
    /// context (captured when the tuple was written) overrides
    /// caller-supplied values.
    pub fn evaluate(
        &self,
        reference: &CaveatReference,
        caller_context: &Map<String, Value>,
    ) -> Result<CaveatOutcome> {
        let definition = self
            .definitions
            .get(&reference.caveat_name)
            .ok_or_else(|| Error::InvalidArgument {
                message: format!(
                    "caveat {:?} is not defined",
                    reference.caveat_name
                ),
            })?;

        let mut merged = caller_context.clone();
        for (key, value) in &reference.context {
            merged.insert(key.clone(), value.clone());
        }

        let missing: Vec<String> = definition
            .required_fields
            .iter()
            .filter(|field| !merged.contains_key(*field))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Ok(CaveatOutcome::Missing(missing));
        }

        if (definition.predicate)(&merged)? {
            Ok(CaveatOutcome::True)
        } else {
            Ok(CaveatOutcome::False)
        }
    }
}

/// A registry preloaded with `ts_after`, the timestamp-comparison caveat
/// used throughout the test suites: true when `now >= min_ts`.
pub fn registry_with_ts_after() -> CaveatRegistry {
    let mut registry = CaveatRegistry::new();
    registry.register(CaveatDefinition::new(
        "ts_after",
        vec!["now", "min_ts"],
        |context| {
            let field = |name: &str| {
                context.get(name).and_then(Value::as_i64).ok_or_else(|| {
                    Error::invalid_argument(format!(
                        "ts_after: field {:?} must be an integer",
                        name
                    ))
                })
            };
            Ok(field("now")? >= field("min_ts")?)
        },
    ));
    registry
}
