use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::models::EvaluationRecord;

/// Filterable dimensions, in cascade order. Changing a facet clears every facet after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Facet {
    Cohort,
    Cycle,
    EvaluationMonth,
    Region,
    District,
    Cluster,
    Village,
}

impl Facet {
    pub const ALL: [Facet; 7] = [
        Facet::Cohort,
        Facet::Cycle,
        Facet::EvaluationMonth,
        Facet::Region,
        Facet::District,
        Facet::Cluster,
        Facet::Village,
    ];

    pub fn position(self) -> usize {
        self as usize
    }

    pub fn param_name(self) -> &'static str {
        match self {
            Facet::Cohort => "cohort",
            Facet::Cycle => "cycle",
            Facet::EvaluationMonth => "evaluation_month",
            Facet::Region => "region",
            Facet::District => "district",
            Facet::Cluster => "cluster",
            Facet::Village => "village",
        }
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.param_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown facet `{0}`")]
pub struct UnknownFacet(pub String);

impl FromStr for Facet {
    type Err = UnknownFacet;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        Facet::ALL
            .into_iter()
            .find(|facet| facet.param_name() == normalized)
            .ok_or_else(|| UnknownFacet(value.to_string()))
    }
}

/// Query parameters sent to the evaluation service, in facet order.
pub type FilterQuery = Vec<(String, String)>;

/// Current selection per facet. An empty slot means "no constraint".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterState {
    slots: [BTreeSet<String>; 7],
}

impl FilterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session start for a restricted caller: the scoped facet is pre-selected.
    pub fn scoped(scope: &ScopeConstraint) -> Self {
        let mut state = Self::default();
        state.set(scope.facet, [scope.value.clone()]);
        state
    }

    /// Replaces the selection at `facet` and clears every facet after it.
    pub fn set<I, S>(&mut self, facet: Facet, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let selected: BTreeSet<String> = values
            .into_iter()
            .map(|value| {
                let value: String = value.into();
                value.trim().to_string()
            })
            .filter(|value| !value.is_empty())
            .collect();
        self.slots[facet.position()] = selected;
        for slot in self.slots.iter_mut().skip(facet.position() + 1) {
            slot.clear();
        }
    }

    pub fn selected(&self, facet: Facet) -> &BTreeSet<String> {
        &self.slots[facet.position()]
    }

    pub fn is_unconstrained(&self) -> bool {
        self.slots.iter().all(BTreeSet::is_empty)
    }

    /// Comma-joined value list per non-empty facet. Empty facets are omitted.
    pub fn to_query(&self) -> FilterQuery {
        Facet::ALL
            .into_iter()
            .filter(|facet| !self.selected(*facet).is_empty())
            .map(|facet| {
                let values: Vec<&str> = self.selected(facet).iter().map(String::as_str).collect();
                (facet.param_name().to_string(), values.join(","))
            })
            .collect()
    }

    pub fn matches(&self, record: &EvaluationRecord) -> bool {
        Facet::ALL.into_iter().all(|facet| {
            let selected = self.selected(facet);
            selected.is_empty() || selected.iter().any(|value| record.matches_facet(facet, value))
        })
    }
}

impl fmt::Display for FilterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unconstrained() {
            return f.write_str("all records");
        }
        let parts: Vec<String> = self
            .to_query()
            .iter()
            .map(|(name, values)| format!("{name}={values}"))
            .collect();
        f.write_str(&parts.join(" "))
    }
}

/// Mandatory equality filter on behalf of a restricted caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeConstraint {
    pub facet: Facet,
    pub value: String,
}

impl ScopeConstraint {
    pub fn new(facet: Facet, value: impl Into<String>) -> Self {
        Self {
            facet,
            value: value.into(),
        }
    }

    pub fn permits(&self, record: &EvaluationRecord) -> bool {
        record.matches_facet(self.facet, &self.value)
    }

    /// Forces the scoped facet to the scope value, overriding any user selection on it.
    pub fn apply(&self, query: &mut FilterQuery) {
        let name = self.facet.param_name();
        query.retain(|(param, _)| param != name);
        query.push((name.to_string(), self.value.clone()));
    }
}
