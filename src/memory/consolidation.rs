//! Factor-Graph Consolidation
//!
//! Offline smoothing of remembered episodes. Episodes become nodes; factors
//! express constraints between them:
//! - Temporal: consecutive episodes should differ by an expected delta
//! - Similarity: near-duplicates are pulled together past a slack radius
//! - Anchor: each node stays close to what was actually observed
//!
//! States are refined by projected gradient descent on the total squared
//! residual, with closed-form gradients. Nothing here runs on the tick path.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use super::Episode;
use crate::config::ConsolidationConfig;
use crate::errors::TrainingError;
use crate::features::{euclidean_distance, FeatureVector};
use crate::training::CancelToken;

/// Below this distance the similarity gradient direction is undefined.
const DIRECTION_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
struct Node {
    state: Vec<f64>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum Factor {
    /// `w · ‖(x_b − x_a) − δ‖²`
    Temporal {
        a: usize,
        b: usize,
        delta: Option<Vec<f64>>,
        weight: f64,
    },
    /// `w · max(0, ‖x_a − x_b‖ − r)²`
    Similarity {
        a: usize,
        b: usize,
        max_distance: f64,
        weight: f64,
    },
    /// `w · ‖x − target‖²`
    Anchor {
        node: usize,
        target: Vec<f64>,
        weight: f64,
    },
}

#[derive(Debug, Clone, Default)]
pub struct FactorGraph {
    nodes: Vec<Node>,
    factors: Vec<Factor>,
}

/// Outcome of one consolidation window.
#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationReport {
    pub nodes: usize,
    pub factors: usize,
    pub iterations: usize,
    pub energy_before: f64,
    pub energy_after: f64,
    /// Refined states in recording order.
    pub refined: Vec<FeatureVector>,
}

impl FactorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph over `episodes` in recording order: a temporal factor between
    /// neighbours in time, a similarity factor from each episode to its
    /// nearest peer inside `similarity_radius`, and an anchor per episode.
    pub fn from_episodes(episodes: &[Episode], config: &ConsolidationConfig) -> Self {
        let mut ordered: Vec<&Episode> = episodes.iter().collect();
        ordered.sort_by_key(|ep| ep.recorded_at);

        let mut graph = Self::new();
        for ep in &ordered {
            let id = graph.add_node(ep.vector.values().to_vec(), ep.recorded_at);
            graph.add_anchor(id, ep.vector.values().to_vec(), config.anchor_weight);
        }

        if config.temporal_weight > 0.0 {
            for i in 1..ordered.len() {
                graph.add_temporal_constraint(i - 1, i, None, config.temporal_weight);
            }
        }

        if config.similarity_weight > 0.0 {
            for i in 0..ordered.len() {
                let nearest = (0..ordered.len())
                    .filter(|&j| j != i)
                    .map(|j| (j, ordered[i].vector.distance(&ordered[j].vector)))
                    .filter(|(_, d)| *d <= config.similarity_radius)
                    .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
                if let Some((j, _)) = nearest {
                    graph.add_similarity_constraint(i, j, 0.0, config.similarity_weight);
                }
            }
        }

        graph
    }

    pub fn add_node(&mut self, state: Vec<f64>, timestamp: DateTime<Utc>) -> usize {
        self.nodes.push(Node { state, timestamp });
        self.nodes.len() - 1
    }

    pub fn add_temporal_constraint(
        &mut self,
        a: usize,
        b: usize,
        delta: Option<Vec<f64>>,
        weight: f64,
    ) {
        self.factors.push(Factor::Temporal {
            a,
            b,
            delta,
            weight,
        });
    }

    pub fn add_similarity_constraint(&mut self, a: usize, b: usize, max_distance: f64, weight: f64) {
        self.factors.push(Factor::Similarity {
            a,
            b,
            max_distance,
            weight,
        });
    }

    pub fn add_anchor(&mut self, node: usize, target: Vec<f64>, weight: f64) {
        self.factors.push(Factor::Anchor {
            node,
            target,
            weight,
        });
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn factor_count(&self) -> usize {
        self.factors.len()
    }

    pub fn state(&self, node: usize) -> Option<&[f64]> {
        self.nodes.get(node).map(|n| n.state.as_slice())
    }

    /// Total weighted squared residual. Factors naming missing nodes are ignored.
    pub fn energy(&self) -> f64 {
        self.factors.iter().map(|f| self.factor_energy(f)).sum()
    }

    fn factor_energy(&self, factor: &Factor) -> f64 {
        match factor {
            Factor::Temporal {
                a,
                b,
                delta,
                weight,
            } => match (self.nodes.get(*a), self.nodes.get(*b)) {
                (Some(na), Some(nb)) => {
                    let r: f64 = na
                        .state
                        .iter()
                        .zip(&nb.state)
                        .enumerate()
                        .map(|(i, (xa, xb))| {
                            let d = delta_at(delta, i);
                            let e = xb - xa - d;
                            e * e
                        })
                        .sum();
                    weight * r
                }
                _ => 0.0,
            },
            Factor::Similarity {
                a,
                b,
                max_distance,
                weight,
            } => match (self.nodes.get(*a), self.nodes.get(*b)) {
                (Some(na), Some(nb)) => {
                    let u = (euclidean_distance(&na.state, &nb.state) - max_distance).max(0.0);
                    weight * u * u
                }
                _ => 0.0,
            },
            Factor::Anchor {
                node,
                target,
                weight,
            } => match self.nodes.get(*node) {
                Some(n) => {
                    let r: f64 = n
                        .state
                        .iter()
                        .zip(target)
                        .map(|(x, t)| (x - t) * (x - t))
                        .sum();
                    weight * r
                }
                None => 0.0,
            },
        }
    }

    /// Analytical gradient of [`Self::energy`] with respect to every node state.
    pub fn gradients(&self) -> Vec<Vec<f64>> {
        let mut grads: Vec<Vec<f64>> = self
            .nodes
            .iter()
            .map(|n| vec![0.0; n.state.len()])
            .collect();

        for factor in &self.factors {
            match factor {
                Factor::Temporal {
                    a,
                    b,
                    delta,
                    weight,
                } => {
                    if *a >= self.nodes.len() || *b >= self.nodes.len() {
                        continue;
                    }
                    let dim = self.nodes[*a].state.len().min(self.nodes[*b].state.len());
                    for i in 0..dim {
                        let e = self.nodes[*b].state[i] - self.nodes[*a].state[i] - delta_at(delta, i);
                        let g = 2.0 * weight * e;
                        grads[*b][i] += g;
                        grads[*a][i] -= g;
                    }
                }
                Factor::Similarity {
                    a,
                    b,
                    max_distance,
                    weight,
                } => {
                    if *a >= self.nodes.len() || *b >= self.nodes.len() {
                        continue;
                    }
                    let sa = &self.nodes[*a].state;
                    let sb = &self.nodes[*b].state;
                    let dist = euclidean_distance(sa, sb);
                    if dist > *max_distance && dist > DIRECTION_EPSILON {
                        let scale = 2.0 * weight * (dist - max_distance) / dist;
                        for i in 0..sa.len().min(sb.len()) {
                            let g = scale * (sa[i] - sb[i]);
                            grads[*a][i] += g;
                            grads[*b][i] -= g;
                        }
                    }
                }
                Factor::Anchor {
                    node,
                    target,
                    weight,
                } => {
                    if *node >= self.nodes.len() {
                        continue;
                    }
                    for (i, (x, t)) in self.nodes[*node].state.iter().zip(target).enumerate() {
                        grads[*node][i] += 2.0 * weight * (x - t);
                    }
                }
            }
        }
        grads
    }

    /// Projected gradient descent; states stay inside `[0, 1]`.
    /// Returns the final energy.
    pub fn optimize(
        &mut self,
        iterations: usize,
        learning_rate: f64,
        cancel: &CancelToken,
    ) -> Result<f64, TrainingError> {
        for step in 0..iterations {
            if cancel.is_cancelled() {
                return Err(TrainingError::Cancelled);
            }
            let grads = self.gradients();
            for (node, grad) in self.nodes.iter_mut().zip(grads) {
                for (x, g) in node.state.iter_mut().zip(grad) {
                    *x = (*x - learning_rate * g).clamp(0.0, 1.0);
                }
            }
            let energy = self.energy();
            if !energy.is_finite() {
                return Err(TrainingError::Singular { pivot: step });
            }
        }
        Ok(self.energy())
    }

    /// Node states ordered by timestamp.
    pub fn trajectory(&self) -> Vec<(DateTime<Utc>, Vec<f64>)> {
        let mut out: Vec<_> = self
            .nodes
            .iter()
            .map(|n| (n.timestamp, n.state.clone()))
            .collect();
        out.sort_by_key(|(t, _)| *t);
        out
    }
}

/// Build the graph for `episodes`, optimize it and report the refined states.
pub fn consolidate(
    episodes: &[Episode],
    config: &ConsolidationConfig,
    cancel: &CancelToken,
) -> Result<ConsolidationReport, TrainingError> {
    let mut graph = FactorGraph::from_episodes(episodes, config);
    let energy_before = graph.energy();
    let energy_after = graph.optimize(config.iterations, config.learning_rate, cancel)?;

    let refined = graph
        .trajectory()
        .into_iter()
        .map(|(t, state)| FeatureVector::sanitized(state).with_timestamp(t))
        .collect();

    debug!(
        nodes = graph.node_count(),
        energy_before, energy_after, "Consolidation window finished"
    );

    Ok(ConsolidationReport {
        nodes: graph.node_count(),
        factors: graph.factor_count(),
        iterations: config.iterations,
        energy_before,
        energy_after,
        refined,
    })
}

fn delta_at(delta: &Option<Vec<f64>>, i: usize) -> f64 {
    delta
        .as_ref()
        .and_then(|d| d.get(i).copied())
        .unwrap_or(0.0)
}
