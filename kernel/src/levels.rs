//! Universe level constraints and their solver.
//!
//! Constraints form a graph over level variables plus a base vertex (`None`)
//! fixed at level 0. Solving is a longest-path relaxation bounded by the
//! number of variables; a further improvement after that bound is a positive
//! cycle, and the chain of equations that produced it is returned.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use tracing::{debug, trace};

/// `upper >= lower + constant`, where `None` is the base level 0.
///
/// With a `max_constant`, the inequality only binds once `lower` exceeds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LevelEquation<V> {
    Bound {
        lower: Option<V>,
        upper: Option<V>,
        constant: i64,
        max_constant: Option<i64>,
    },
    Infinity(V),
}

impl<V> LevelEquation<V> {
    pub fn new(lower: Option<V>, upper: Option<V>, constant: i64) -> Self {
        LevelEquation::Bound { lower, upper, constant, max_constant: None }
    }

    pub fn with_max_constant(self, max: i64) -> Self {
        match self {
            LevelEquation::Bound { lower, upper, constant, .. } => {
                LevelEquation::Bound { lower, upper, constant, max_constant: Some(max) }
            }
            infinity => infinity,
        }
    }
}

fn write_vertex<V: fmt::Display>(f: &mut fmt::Formatter<'_>, vertex: &Option<V>) -> fmt::Result {
    match vertex {
        Some(var) => write!(f, "{var}"),
        None => write!(f, "0"),
    }
}

impl<V: fmt::Display> fmt::Display for LevelEquation<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LevelEquation::Bound { lower, upper, constant, max_constant } => {
                write_vertex(f, upper)?;
                write!(f, " >= ")?;
                write_vertex(f, lower)?;
                if *constant != 0 {
                    write!(f, " {} {}", if *constant < 0 { '-' } else { '+' }, constant.abs())?;
                }
                if let Some(max) = max_constant {
                    write!(f, " (above {max})")?;
                }
                Ok(())
            }
            LevelEquation::Infinity(var) => write!(f, "{var} = \\oo"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LevelValue {
    Finite(i64),
    Infinity,
}

/// Least assignment satisfying a set of level equations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelSolution<V: Eq + Hash> {
    values: HashMap<V, LevelValue>,
}

impl<V: Copy + Eq + Hash> LevelSolution<V> {
    /// Value of a variable; variables that took part in no equation are 0.
    pub fn get(&self, var: V) -> LevelValue {
        self.values.get(&var).copied().unwrap_or(LevelValue::Finite(0))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&V, LevelValue)> {
        self.values.iter().map(|(var, value)| (var, *value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct LevelEquations<V> {
    variables: Vec<V>,
    equations: Vec<LevelEquation<V>>,
}

impl<V> Default for LevelEquations<V> {
    fn default() -> Self {
        LevelEquations { variables: Vec::new(), equations: Vec::new() }
    }
}

impl<V: Copy + Eq + Hash + fmt::Debug> LevelEquations<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_variable(&mut self, var: V) {
        if !self.variables.contains(&var) {
            self.variables.push(var);
        }
    }

    pub fn add(&mut self, equation: LevelEquation<V>) {
        match &equation {
            LevelEquation::Bound { lower, upper, .. } => {
                for var in [lower, upper].into_iter().flatten() {
                    self.add_variable(*var);
                }
            }
            LevelEquation::Infinity(var) => self.add_variable(*var),
        }
        self.equations.push(equation);
    }

    pub fn add_infinity(&mut self, var: V) {
        self.add(LevelEquation::Infinity(var));
    }

    pub fn merge(&mut self, other: LevelEquations<V>) {
        for var in other.variables {
            self.add_variable(var);
        }
        self.equations.extend(other.equations);
    }

    pub fn variables(&self) -> &[V] {
        &self.variables
    }

    pub fn equations(&self) -> &[LevelEquation<V>] {
        &self.equations
    }

    pub fn is_empty(&self) -> bool {
        self.equations.is_empty()
    }

    pub fn clear(&mut self) {
        self.variables.clear();
        self.equations.clear();
    }

    /// Computes the least solution, or the chain of equations forcing either
    /// the base level upwards or an unbounded increase around a cycle.
    pub fn solve(&self) -> Result<LevelSolution<V>, Vec<LevelEquation<V>>> {
        let mut solution: HashMap<Option<V>, LevelValue> = HashMap::new();
        solution.insert(None, LevelValue::Finite(0));
        for var in &self.variables {
            solution.insert(Some(*var), LevelValue::Finite(0));
        }
        let mut paths: HashMap<Option<V>, Vec<LevelEquation<V>>> = HashMap::new();
        // Forced infinities are in place before any bound is relaxed, so
        // they reach everything above them within the round limit.
        for equation in &self.equations {
            if let LevelEquation::Infinity(var) = equation {
                if solution.insert(Some(*var), LevelValue::Infinity) != Some(LevelValue::Infinity) {
                    paths.insert(Some(*var), vec![equation.clone()]);
                }
            }
        }

        for round in (0..=self.variables.len()).rev() {
            let mut updated = false;
            for equation in &self.equations {
                let LevelEquation::Bound { lower, upper, constant, max_constant } = equation else {
                    continue;
                };
                let (lower, upper, constant, max_constant) = (*lower, *upper, *constant, *max_constant);
                let a = solution.get(&lower).copied().unwrap_or(LevelValue::Finite(0));
                let b = solution.get(&upper).copied().unwrap_or(LevelValue::Finite(0));
                let raised = match (a, b) {
                    (_, LevelValue::Infinity) => continue,
                    (LevelValue::Infinity, LevelValue::Finite(_)) => LevelValue::Infinity,
                    (LevelValue::Finite(a), LevelValue::Finite(b)) => {
                        let active = max_constant.map_or(true, |max| a > max);
                        if !active || b >= a + constant {
                            continue;
                        }
                        LevelValue::Finite(a + constant)
                    }
                };

                let mut path = paths.get(&lower).cloned().unwrap_or_default();
                path.push(equation.clone());
                paths.insert(upper, path);

                if round == 0 || upper.is_none() {
                    let path = paths.remove(&upper).unwrap_or_default();
                    debug!(length = path.len(), "level constraints are unsatisfiable");
                    return Err(path);
                }
                trace!(var = ?upper, value = ?raised, "raising level");
                solution.insert(upper, raised);
                updated = true;
            }
            if !updated {
                break;
            }
        }

        let values = solution
            .into_iter()
            .filter_map(|(var, value)| var.map(|var| (var, value)))
            .collect();
        Ok(LevelSolution { values })
    }
}
