//! Force-directed layout biased toward community clusters.
//!
//! Fruchterman-Reingold: every pair of nodes repels, edges attract in
//! proportion to their weight, and each node is also pulled toward the
//! centroid of its community. Movement per iteration is capped by a
//! temperature that cools linearly to zero.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use tracing::debug;

use crate::cancel::CancelFlag;
use crate::community::Partition;
use crate::config::LayoutConfig;
use crate::graph::SocialGraph;

/// Iterations between cancellation checks
const CHECK_EVERY: usize = 10;
const MIN_DISTANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    fn distance(&self, other: &Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

#[derive(Debug, Clone)]
pub struct ForceLayout {
    pub iterations: usize,
    pub width: f64,
    pub height: f64,
    pub community_gravity: f64,
    pub seed: u64,
}

impl From<&LayoutConfig> for ForceLayout {
    fn from(config: &LayoutConfig) -> Self {
        Self {
            iterations: config.iterations,
            width: config.width,
            height: config.height,
            community_gravity: config.community_gravity,
            seed: config.seed,
        }
    }
}

impl Default for ForceLayout {
    fn default() -> Self {
        Self::from(&LayoutConfig::default())
    }
}

impl ForceLayout {
    /// Position per node index, or `None` when cancelled
    pub fn compute(
        &self,
        graph: &SocialGraph,
        partition: &Partition,
        cancel: &CancelFlag,
    ) -> Option<Vec<Point>> {
        let n = graph.node_count();
        let center = Point {
            x: self.width / 2.0,
            y: self.height / 2.0,
        };
        if n <= 1 {
            return Some(vec![center; n]);
        }

        let communities = partition.assignment();
        let community_count = partition.community_count().max(1);
        let k = (self.width * self.height / n as f64).sqrt();
        let edges: Vec<(usize, usize, f64)> = graph
            .edges()
            .map(|(a, b, w)| (a.index(), b.index(), f64::from(w)))
            .collect();

        let mut positions = self.initial_positions(communities, community_count, center, k);
        let mut temperature = self.width.min(self.height) / 10.0;
        let cooling = temperature / (self.iterations.max(1) as f64 + 1.0);

        for iteration in 0..self.iterations {
            if iteration % CHECK_EVERY == 0 && cancel.is_cancelled() {
                return None;
            }

            let centroids = centroids(&positions, communities, community_count);
            let gravity = self.community_gravity;

            let mut displacement: Vec<Point> = positions
                .par_iter()
                .enumerate()
                .map(|(i, p)| {
                    let mut d = Point::default();
                    for (j, q) in positions.iter().enumerate() {
                        if i == j {
                            continue;
                        }
                        let dist = p.distance(q).max(MIN_DISTANCE);
                        let force = k * k / dist;
                        d.x += (p.x - q.x) / dist * force;
                        d.y += (p.y - q.y) / dist * force;
                    }
                    let c = centroids[communities[i]];
                    d.x += (c.x - p.x) * gravity * k / 10.0;
                    d.y += (c.y - p.y) * gravity * k / 10.0;
                    d
                })
                .collect();

            for &(a, b, weight) in &edges {
                let (p, q) = (positions[a], positions[b]);
                let dist = p.distance(&q).max(MIN_DISTANCE);
                let force = dist * dist / k * weight.sqrt();
                let (fx, fy) = ((p.x - q.x) / dist * force, (p.y - q.y) / dist * force);
                displacement[a].x -= fx;
                displacement[a].y -= fy;
                displacement[b].x += fx;
                displacement[b].y += fy;
            }

            for (p, d) in positions.iter_mut().zip(&displacement) {
                let len = d.x.hypot(d.y);
                if len > 0.0 {
                    let step = len.min(temperature);
                    p.x += d.x / len * step;
                    p.y += d.y / len * step;
                }
                p.x = p.x.clamp(0.0, self.width);
                p.y = p.y.clamp(0.0, self.height);
            }
            temperature -= cooling;
        }

        debug!(nodes = n, iterations = self.iterations, "Layout finished");
        Some(positions)
    }

    /// Communities start around a circle, members jittered around their anchor
    fn initial_positions(
        &self,
        communities: &[usize],
        community_count: usize,
        center: Point,
        k: f64,
    ) -> Vec<Point> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let radius = self.width.min(self.height) / 3.0;

        communities
            .iter()
            .map(|&community| {
                let angle = TAU * community as f64 / community_count as f64;
                let jitter_x: f64 = rng.gen_range(-1.0..1.0);
                let jitter_y: f64 = rng.gen_range(-1.0..1.0);
                Point {
                    x: (center.x + radius * angle.cos() + jitter_x * k).clamp(0.0, self.width),
                    y: (center.y + radius * angle.sin() + jitter_y * k).clamp(0.0, self.height),
                }
            })
            .collect()
    }
}

fn centroids(positions: &[Point], communities: &[usize], count: usize) -> Vec<Point> {
    let mut sums = vec![(0.0, 0.0, 0usize); count];
    for (p, &c) in positions.iter().zip(communities) {
        sums[c].0 += p.x;
        sums[c].1 += p.y;
        sums[c].2 += 1;
    }
    sums.into_iter()
        .map(|(x, y, members)| {
            if members == 0 {
                Point::default()
            } else {
                Point {
                    x: x / members as f64,
                    y: y / members as f64,
                }
            }
        })
        .collect()
}
