//! Tangent-linear variables.
//!
//! A tangent-linear model propagates the directional derivative of every
//! computed value with respect to controls `m` in directions `dm`. Each
//! forward variable `x` touched by the model gets a companion variable
//! holding `dx/dm · dm`, created on first use and named after `x`.

use crate::types::{VarId, Variable};
use std::collections::HashMap;

/// Map from forward variables to their tangent-linear variables.
#[derive(Clone, Debug, Default)]
pub struct TangentLinearMap {
    suffix: String,
    map: HashMap<VarId, Variable>,
}

impl TangentLinearMap {
    /// Creates an empty map naming tangents `{name}{suffix}`.
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            map: HashMap::new(),
        }
    }

    /// Map for controls `m` and directions `dm`, with the suffix
    /// `_tlm(m,dm)` or `_tlm((m0,m1),(dm0,dm1))`.
    pub fn for_model(m: &[Variable], dm: &[Variable]) -> Self {
        let names = |vs: &[Variable]| vs.iter().map(Variable::name).collect::<Vec<_>>().join(",");
        let suffix = if m.len() == 1 {
            format!("_tlm({},{})", names(m), names(dm))
        } else {
            format!("_tlm(({}),({}))", names(m), names(dm))
        };
        Self::new(suffix)
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// The tangent of `x`, if one has been created.
    pub fn get(&self, x: &Variable) -> Option<&Variable> {
        self.map.get(&x.id())
    }

    pub fn contains(&self, x: &Variable) -> bool {
        self.map.contains_key(&x.id())
    }

    /// The tangent of `x`, created in the space of `x` if absent.
    pub fn get_or_create(&mut self, x: &Variable) -> Variable {
        let suffix = &self.suffix;
        self.map
            .entry(x.id())
            .or_insert_with(|| Variable::new(x.space(), &format!("{}{}", x.name(), suffix)))
            .clone()
    }

    /// The tangent an equation reads for dependency `x`: the direction when
    /// `x` is a control, the mapped tangent otherwise, `None` when zero.
    pub fn tangent(&self, x: &Variable, m: &[Variable], dm: &[Variable]) -> Option<Variable> {
        match m.iter().position(|mi| mi == x) {
            Some(i) => dm.get(i).cloned(),
            None => self.get(x).cloned(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
