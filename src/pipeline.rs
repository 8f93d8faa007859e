//! One generation run: fetch, build, detect, lay out, export.
//!
//! The pipeline stops at the first fatal error. Cancellation is checked by the
//! fetch loop before every request and again at coarse checkpoints inside
//! detection and layout; a cancelled run still reports what it got so far.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::api::MutualsApi;
use crate::cache::MutualCache;
use crate::cancel::CancelFlag;
use crate::community::{Community, Louvain};
use crate::config::{Config, DataLayout};
use crate::error::{NetworkError, Result};
use crate::export::{NetworkDocument, to_dot};
use crate::fetcher::{FetchOutcome, FetchSummary, MutualFetcher, RetryPolicy};
use crate::graph::{GraphStats, SocialGraph};
use crate::identity::{FriendRecord, IdentityStore};
use crate::layout::ForceLayout;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetching,
    BuildingGraph,
    DetectingCommunities,
    Layout,
    Exporting,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Fetching => "Fetching mutual connections",
            Stage::BuildingGraph => "Building graph",
            Stage::DetectingCommunities => "Detecting communities",
            Stage::Layout => "Computing layout",
            Stage::Exporting => "Writing visualization",
        };
        f.write_str(label)
    }
}

/// Reported to the caller while a run is in progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Stage(Stage),
    Fetched { completed: usize, total: usize },
}

impl Progress {
    /// Whole-number percentage of the fetch loop, when this is a fetch update
    pub fn percent(&self) -> Option<u8> {
        match *self {
            Progress::Fetched { completed, total } if total > 0 => {
                Some((completed * 100 / total).min(100) as u8)
            }
            Progress::Fetched { .. } => Some(100),
            Progress::Stage(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub fetch: FetchSummary,
    pub stats: GraphStats,
    /// Present once detection has finished
    pub modularity: Option<f64>,
    pub communities: Vec<Community>,
    pub html_path: Option<PathBuf>,
    pub json_path: Option<PathBuf>,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}; {} friends, {} connections",
            self.fetch, self.stats.node_count, self.stats.edge_count
        )?;
        if let Some(modularity) = self.modularity {
            write!(
                f,
                ", {} communities (modularity {:.3})",
                self.stats.community_count, modularity
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(RunReport),
    /// Stopped on request; the cache keeps everything fetched so far
    Cancelled(RunReport),
}

impl RunOutcome {
    pub fn report(&self) -> &RunReport {
        match self {
            RunOutcome::Completed(report) | RunOutcome::Cancelled(report) => report,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunOutcome::Cancelled(_))
    }
}

pub struct Pipeline {
    config: Config,
    layout: DataLayout,
    api: Arc<dyn MutualsApi>,
    session: Arc<dyn Session>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        layout: DataLayout,
        api: Arc<dyn MutualsApi>,
        session: Arc<dyn Session>,
    ) -> Self {
        Self {
            config,
            layout,
            api,
            session,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn data_layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Run every stage for `friends`.
    ///
    /// Fails fast, before any network activity, on an empty friend list or
    /// an unauthenticated session.
    pub fn run(
        &self,
        friends: Vec<FriendRecord>,
        cancel: &CancelFlag,
        on_progress: &mut dyn FnMut(Progress),
    ) -> Result<RunOutcome> {
        let mut identities = IdentityStore::from_records(friends)?;
        if !self.session.authenticated() {
            return Err(NetworkError::AuthenticationRequired);
        }

        self.layout.ensure_exists()?;
        let cache = MutualCache::open(self.layout.cache_file(), Some(self.layout.session_file()))?;
        let user_ids: Vec<String> = identities.ids().map(str::to_string).collect();

        on_progress(Progress::Stage(Stage::Fetching));
        let policy = RetryPolicy::from(&self.config.fetch);
        let mut fetcher = MutualFetcher::new(self.api.as_ref(), self.session.as_ref(), &cache, policy);
        let fetched = fetcher.run(&user_ids, cancel, &mut |completed, total| {
            on_progress(Progress::Fetched { completed, total })
        })?;

        on_progress(Progress::Stage(Stage::BuildingGraph));
        let results = cache.entries();
        let refreshed = refresh_display_names(&mut identities, &results);
        debug!(refreshed, "Refreshed display names from fetched data");
        let mut graph = SocialGraph::build(&identities, &results);

        let fetch = match fetched {
            FetchOutcome::Completed(summary) => summary,
            FetchOutcome::Cancelled(summary) => {
                return Ok(cancelled(summary, &graph));
            }
        };

        on_progress(Progress::Stage(Stage::DetectingCommunities));
        let Some(partition) = Louvain::from(&self.config.community).detect(&graph, cancel) else {
            return Ok(cancelled(fetch, &graph));
        };
        graph.assign_communities(partition.assignment());

        on_progress(Progress::Stage(Stage::Layout));
        let Some(positions) = ForceLayout::from(&self.config.layout).compute(&graph, &partition, cancel)
        else {
            return Ok(cancelled(fetch, &graph));
        };

        on_progress(Progress::Stage(Stage::Exporting));
        let document = NetworkDocument::assemble(&graph, &partition, &positions, &self.config.export)?;
        let html_path = self.layout.html_file();
        let json_path = self.layout.json_file();
        document.write_html(&html_path)?;
        document.write_json(&json_path)?;
        if self.config.export.dot {
            let dot_path = self.layout.dot_file();
            std::fs::write(&dot_path, to_dot(&graph))
                .map_err(|e| NetworkError::Storage(format!("{}: {}", dot_path.display(), e)))?;
            debug!(path = %dot_path.display(), "Wrote Graphviz rendering");
        }

        let report = RunReport {
            fetch,
            stats: document.stats.clone(),
            modularity: Some(partition.modularity()),
            communities: document.communities,
            html_path: Some(html_path),
            json_path: Some(json_path),
        };
        info!(%report, "Generation finished");
        Ok(RunOutcome::Completed(report))
    }
}

fn cancelled(fetch: FetchSummary, graph: &SocialGraph) -> RunOutcome {
    let report = RunReport {
        fetch,
        stats: graph.stats(),
        modularity: None,
        communities: Vec::new(),
        html_path: None,
        json_path: None,
    };
    info!(%report, "Generation cancelled");
    RunOutcome::Cancelled(report)
}

/// Apply names reported alongside mutual lists; results are visited in id
/// order so the outcome does not depend on cache layout
fn refresh_display_names(
    identities: &mut IdentityStore,
    results: &[crate::cache::MutualResult],
) -> usize {
    let mut refreshed = 0;
    for result in results.iter().filter(|r| r.is_ok()) {
        for (user_id, name) in &result.display_names {
            if identities.refresh_display_name(user_id, name) {
                refreshed += 1;
            }
        }
    }
    refreshed
}

/// Delete every file the pipeline owns. Returns the files that existed.
pub fn clear_user_data(layout: &DataLayout) -> Result<Vec<PathBuf>> {
    let owned = [
        layout.cache_file(),
        layout.session_file(),
        layout.html_file(),
        layout.json_file(),
        layout.dot_file(),
    ];
    let present: Vec<PathBuf> = owned.iter().filter(|path| path.exists()).cloned().collect();

    MutualCache::open(layout.cache_file(), Some(layout.session_file()))?.clear()?;
    for artifact in [layout.html_file(), layout.json_file(), layout.dot_file()] {
        if artifact.exists() {
            std::fs::remove_file(&artifact)
                .map_err(|e| NetworkError::Storage(format!("{}: {}", artifact.display(), e)))?;
        }
    }

    info!(removed = present.len(), root = %layout.root.display(), "Cleared user data");
    Ok(present)
}
