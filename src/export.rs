//! Output artifacts: the self-contained interactive HTML page, the JSON data
//! file, and a Graphviz rendering.

use chrono::{DateTime, Utc};
use petgraph::dot::{Config as DotConfig, Dot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::info;

use crate::community::{Community, Partition};
use crate::config::ExportConfig;
use crate::error::{NetworkError, Result};
use crate::graph::{GraphStats, SocialGraph};
use crate::layout::Point;

const HTML_TEMPLATE: &str = include_str!("viewer.html");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportNode {
    pub id: String,
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub community: usize,
    pub degree: usize,
    pub mutual_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportEdge {
    pub source: String,
    pub target: String,
    pub weight: u32,
}

/// Everything the viewer needs, embedded into the page as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDocument {
    pub title: String,
    pub generated_at: DateTime<Utc>,
    pub dark_mode: bool,
    pub modularity: f64,
    pub stats: GraphStats,
    pub nodes: Vec<ExportNode>,
    pub edges: Vec<ExportEdge>,
    pub communities: Vec<Community>,
}

/// Flat data file, keyed by user id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FriendDataFile {
    pub friends: BTreeMap<String, String>,
    /// `"a|b"` with `a < b`
    pub edges: BTreeMap<String, u32>,
    pub mutual_counts: BTreeMap<String, usize>,
    pub communities: BTreeMap<String, usize>,
    pub modularity: f64,
    pub stats: GraphStats,
}

impl NetworkDocument {
    /// `graph` should already carry the partition's community ids
    pub fn assemble(
        graph: &SocialGraph,
        partition: &Partition,
        positions: &[Point],
        options: &ExportConfig,
    ) -> Result<Self> {
        if positions.len() != graph.node_count() {
            return Err(NetworkError::Internal(format!(
                "layout has {} positions for {} nodes",
                positions.len(),
                graph.node_count()
            )));
        }

        let nodes = graph
            .nodes()
            .map(|(index, node)| {
                let at = positions[index.index()];
                ExportNode {
                    id: node.user_id.clone(),
                    name: node.display_name.clone(),
                    x: round2(at.x),
                    y: round2(at.y),
                    community: partition.community_of(index),
                    degree: node.degree,
                    mutual_count: node.mutual_count,
                }
            })
            .collect();

        let edges = graph
            .edges()
            .map(|(a, b, weight)| ExportEdge {
                source: graph.node(a).user_id.clone(),
                target: graph.node(b).user_id.clone(),
                weight,
            })
            .collect();

        let mut stats = graph.stats();
        stats.community_count = partition.community_count();

        Ok(Self {
            title: options.title.clone(),
            generated_at: Utc::now(),
            dark_mode: options.dark_mode,
            modularity: partition.modularity(),
            stats,
            nodes,
            edges,
            communities: partition.communities(graph),
        })
    }

    pub fn data_file(&self) -> FriendDataFile {
        let mut communities = BTreeMap::new();
        let mut friends = BTreeMap::new();
        let mut mutual_counts = BTreeMap::new();
        for node in &self.nodes {
            friends.insert(node.id.clone(), node.name.clone());
            mutual_counts.insert(node.id.clone(), node.mutual_count);
            communities.insert(node.id.clone(), node.community);
        }

        let edges = self
            .edges
            .iter()
            .map(|edge| {
                let (a, b) = if edge.source <= edge.target {
                    (&edge.source, &edge.target)
                } else {
                    (&edge.target, &edge.source)
                };
                (format!("{}|{}", a, b), edge.weight)
            })
            .collect();

        FriendDataFile {
            friends,
            edges,
            mutual_counts,
            communities,
            modularity: self.modularity,
            stats: self.stats.clone(),
        }
    }

    pub fn to_html(&self) -> Result<String> {
        let payload = script_safe_json(&serde_json::to_string(self)?);
        let theme = if self.dark_mode { "dark" } else { "light" };

        Ok(HTML_TEMPLATE
            .replace("__TITLE__", &escape_html(&self.title))
            .replace("__THEME__", theme)
            .replace("__NETWORK_DATA__", &payload))
    }

    pub fn write_html(&self, path: &Path) -> Result<()> {
        write_file(path, self.to_html()?.as_bytes())?;
        info!(path = %path.display(), nodes = self.nodes.len(), "Wrote network visualization");
        Ok(())
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        write_file(path, &serde_json::to_vec_pretty(&self.data_file())?)?;
        info!(path = %path.display(), "Wrote network data");
        Ok(())
    }
}

/// Graphviz rendering, nodes filled by community hue
pub fn to_dot(graph: &SocialGraph) -> String {
    let node_attrs = |_, (_, friend): (_, &crate::graph::FriendNode)| {
        let community = friend.community.unwrap_or(0);
        let hue = (community * 60) % 360;
        format!(
            "label=\"{}\", style=filled, fillcolor=\"{:.3} 0.5 0.9\"",
            escape_dot(&friend.display_name),
            hue as f32 / 360.0
        )
    };
    let dot = Dot::with_attr_getters(
        graph.inner(),
        &[DotConfig::EdgeNoLabel, DotConfig::NodeNoLabel],
        &|_, edge| format!("label=\"{}\"", edge.weight()),
        &node_attrs,
    );
    format!("{:?}", dot)
}

/// Launch the platform opener on a generated artifact
pub fn open_in_browser(path: &Path) -> Result<()> {
    let status = if cfg!(target_os = "windows") {
        Command::new("cmd").arg("/C").arg("start").arg("").arg(path).status()?
    } else if cfg!(target_os = "macos") {
        Command::new("open").arg(path).status()?
    } else {
        Command::new("xdg-open").arg(path).status()?
    };

    if !status.success() {
        return Err(NetworkError::Internal(format!(
            "opener exited with {} for {}",
            status,
            path.display()
        )));
    }
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)
        .map_err(|e| NetworkError::Storage(format!("{}: {}", path.display(), e)))
}

/// Markup characters only ever appear inside JSON strings, where the
/// `\u` escapes are equivalent, so no tokenizer state can start in the payload
fn script_safe_json(json: &str) -> String {
    json.replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('&', "\\u0026")
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn escape_dot(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}
