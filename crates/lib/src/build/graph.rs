//! The derivation graph.
//!
//! Derivations live in a `petgraph` arena indexed by identity. Edges run from
//! an input to the derivation that consumes it, so a topological walk visits
//! inputs first.

use std::collections::{BTreeMap, HashMap, VecDeque};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use crate::derivation::{Derivation, DerivationId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
  #[error("cyclic dependency: {}", format_cycle(.path))]
  Cycle { path: Vec<DerivationId> },

  #[error("derivation {derivation} depends on unknown derivation {input}")]
  MissingInput {
    derivation: DerivationId,
    input: DerivationId,
  },

  #[error("requested derivation {0} is not known")]
  UnknownRoot(DerivationId),
}

fn format_cycle(path: &[DerivationId]) -> String {
  path.iter().map(|id| id.0.as_str()).collect::<Vec<_>>().join(" -> ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Colour {
  White,
  Grey,
  Black,
}

/// Derivations reachable from a set of requested roots.
#[derive(Debug)]
pub struct DerivationGraph {
  graph: DiGraph<DerivationId, ()>,
  nodes: HashMap<DerivationId, NodeIndex>,
  derivations: BTreeMap<DerivationId, Derivation>,
  roots: Vec<DerivationId>,
}

impl DerivationGraph {
  /// Link `roots` and everything they depend on out of `pool`.
  ///
  /// Derivations in `pool` that no root reaches are left out. Fails before
  /// anything is scheduled if an input is missing from `pool` or the inputs
  /// form a cycle.
  pub fn new(pool: &BTreeMap<DerivationId, Derivation>, roots: &[DerivationId]) -> Result<Self, GraphError> {
    let mut derivations = BTreeMap::new();
    let mut queue: VecDeque<DerivationId> = VecDeque::new();

    for root in roots {
      if !pool.contains_key(root) {
        return Err(GraphError::UnknownRoot(root.clone()));
      }
      queue.push_back(root.clone());
    }

    while let Some(id) = queue.pop_front() {
      if derivations.contains_key(&id) {
        continue;
      }
      let Some(drv) = pool.get(&id) else {
        continue;
      };
      for input in &drv.inputs {
        if !pool.contains_key(input) {
          return Err(GraphError::MissingInput {
            derivation: id.clone(),
            input: input.clone(),
          });
        }
        queue.push_back(input.clone());
      }
      derivations.insert(id, drv.clone());
    }

    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();
    for id in derivations.keys() {
      nodes.insert(id.clone(), graph.add_node(id.clone()));
    }
    for (id, drv) in &derivations {
      for input in &drv.inputs {
        graph.add_edge(nodes[input], nodes[id], ());
      }
    }

    let mut unique_roots = roots.to_vec();
    unique_roots.dedup();

    let dag = Self {
      graph,
      nodes,
      derivations,
      roots: unique_roots,
    };
    dag.check_acyclic()?;
    Ok(dag)
  }

  /// Graph over every derivation in `pool`.
  pub fn from_all(pool: &BTreeMap<DerivationId, Derivation>) -> Result<Self, GraphError> {
    let roots: Vec<DerivationId> = pool.keys().cloned().collect();
    Self::new(pool, &roots)
  }

  pub fn len(&self) -> usize {
    self.derivations.len()
  }

  pub fn is_empty(&self) -> bool {
    self.derivations.is_empty()
  }

  pub fn roots(&self) -> &[DerivationId] {
    &self.roots
  }

  pub fn get(&self, id: &DerivationId) -> Option<&Derivation> {
    self.derivations.get(id)
  }

  pub fn derivations(&self) -> impl Iterator<Item = (&DerivationId, &Derivation)> {
    self.derivations.iter()
  }

  /// Direct inputs of `id`.
  pub fn inputs(&self, id: &DerivationId) -> Vec<DerivationId> {
    self.neighbors(id, Direction::Incoming)
  }

  /// Derivations that consume `id` directly.
  pub fn dependents(&self, id: &DerivationId) -> Vec<DerivationId> {
    self.neighbors(id, Direction::Outgoing)
  }

  fn neighbors(&self, id: &DerivationId, direction: Direction) -> Vec<DerivationId> {
    let Some(&idx) = self.nodes.get(id) else {
      return Vec::new();
    };
    let mut ids: Vec<DerivationId> = self
      .graph
      .neighbors_directed(idx, direction)
      .map(|n| self.graph[n].clone())
      .collect();
    ids.sort();
    ids.dedup();
    ids
  }

  /// The shortest chain of identities from a requested root down to `target`.
  pub fn chain_to(&self, target: &DerivationId) -> Vec<DerivationId> {
    let mut parent: HashMap<&DerivationId, &DerivationId> = HashMap::new();
    let mut queue: VecDeque<&DerivationId> = VecDeque::new();
    for root in &self.roots {
      if root == target {
        return vec![target.clone()];
      }
      parent.insert(root, root);
      queue.push_back(root);
    }

    while let Some(id) = queue.pop_front() {
      let Some(&idx) = self.nodes.get(id) else {
        continue;
      };
      for n in self.graph.neighbors_directed(idx, Direction::Incoming) {
        let input = &self.graph[n];
        if parent.contains_key(input) {
          continue;
        }
        parent.insert(input, id);
        if input == target {
          let mut chain = vec![input.clone()];
          let mut cursor = id;
          loop {
            chain.push(cursor.clone());
            let next = parent[cursor];
            if next == cursor {
              break;
            }
            cursor = next;
          }
          chain.reverse();
          return chain;
        }
        queue.push_back(input);
      }
    }

    vec![target.clone()]
  }

  fn check_acyclic(&self) -> Result<(), GraphError> {
    let mut colours = vec![Colour::White; self.graph.node_count()];
    let mut stack: Vec<NodeIndex> = Vec::new();

    for start in self.graph.node_indices() {
      if colours[start.index()] == Colour::White {
        self.visit(start, &mut colours, &mut stack)?;
      }
    }
    Ok(())
  }

  fn visit(&self, node: NodeIndex, colours: &mut [Colour], stack: &mut Vec<NodeIndex>) -> Result<(), GraphError> {
    colours[node.index()] = Colour::Grey;
    stack.push(node);

    for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
      match colours[next.index()] {
        Colour::Grey => {
          let start = stack.iter().position(|&n| n == next).unwrap_or(0);
          let mut path: Vec<DerivationId> = stack[start..].iter().map(|&n| self.graph[n].clone()).collect();
          path.push(self.graph[next].clone());
          return Err(GraphError::Cycle { path });
        }
        Colour::White => self.visit(next, colours, stack)?,
        Colour::Black => {}
      }
    }

    stack.pop();
    colours[node.index()] = Colour::Black;
    Ok(())
  }
}
