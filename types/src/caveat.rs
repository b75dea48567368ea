// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Caveat expressions: boolean ASTs over named, context-gated conditions.
//!
//! A tuple may carry a [`ContextualizedCaveat`] naming a condition that must
//! hold for the edge to count. Combining caveated results through the
//! permission algebra produces a [`CaveatExpression`] tree, which the caller
//! either evaluates (when all context is present) or returns to the client
//! alongside the list of missing context fields.

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

/// A named caveat attached to a stored tuple, with the context captured at
/// write time.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ContextualizedCaveat {
    pub caveat_name: String,
    pub context: Map<String, Value>,
}

impl ContextualizedCaveat {
    pub fn new(caveat_name: impl Into<String>) -> ContextualizedCaveat {
        ContextualizedCaveat {
            caveat_name: caveat_name.into(),
            context: Map::new(),
        }
    }

    pub fn with_context(
        mut self,
        key: impl Into<String>,
        value: Value,
    ) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// A leaf of a [`CaveatExpression`]: one named caveat plus the merged
/// context under which it must be evaluated.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct CaveatReference {
    pub caveat_name: String,
    pub context: Map<String, Value>,
}

impl From<&ContextualizedCaveat> for CaveatReference {
    fn from(caveat: &ContextualizedCaveat) -> CaveatReference {
        CaveatReference {
            caveat_name: caveat.caveat_name.clone(),
            context: caveat.context.clone(),
        }
    }
}

/// A boolean expression over named caveats.
///
/// Produced when the permission algebra combines caveated branches: unions
/// OR their children's expressions, intersections AND them, and exclusions
/// negate the subtracted side.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CaveatExpression {
    Leaf { caveat: CaveatReference },
    And { children: Vec<CaveatExpression> },
    Or { children: Vec<CaveatExpression> },
    Not { child: Box<CaveatExpression> },
}

impl CaveatExpression {
    pub fn leaf(caveat: CaveatReference) -> CaveatExpression {
        CaveatExpression::Leaf { caveat }
    }

    /// AND of `children`, collapsing the single-child case.
    pub fn and(mut children: Vec<CaveatExpression>) -> CaveatExpression {
        if children.len() == 1 {
            children.remove(0)
        } else {
            CaveatExpression::And { children }
        }
    }

    /// OR of `children`, collapsing the single-child case.
    pub fn or(mut children: Vec<CaveatExpression>) -> CaveatExpression {
        if children.len() == 1 {
            children.remove(0)
        } else {
            CaveatExpression::Or { children }
        }
    }

    pub fn not(child: CaveatExpression) -> CaveatExpression {
        CaveatExpression::Not { child: Box::new(child) }
    }

    /// The names of every caveat mentioned anywhere in the expression, in
    /// first-appearance order without duplicates.
    pub fn caveat_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.visit_leaves(&mut |leaf| {
            if !names.contains(&leaf.caveat_name) {
                names.push(leaf.caveat_name.clone());
            }
        });
        names
    }

    fn visit_leaves(&self, visit: &mut impl FnMut(&CaveatReference)) {
        match self {
            CaveatExpression::Leaf { caveat } => visit(caveat),
            CaveatExpression::And { children }
            | CaveatExpression::Or { children } => {
                for child in children {
                    child.visit_leaves(visit);
                }
            }
            CaveatExpression::Not { child } => child.visit_leaves(visit),
        }
    }
}
