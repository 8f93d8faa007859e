//! Mutual-friend network generation.
//!
//! Takes a friend list, fetches each friend's mutual connections from a
//! rate-limited remote service (resuming from a local cache), builds a
//! weighted friend graph, finds its communities with Louvain modularity
//! optimization and writes a standalone interactive visualization.

pub mod api;
pub mod cache;
pub mod cancel;
pub mod community;
pub mod config;
pub mod error;
pub mod export;
pub mod fetcher;
pub mod graph;
pub mod identity;
pub mod layout;
pub mod pipeline;
pub mod session;
pub mod worker;

pub use api::{ApiOutcome, HttpMutualsApi, MutualFriend, MutualsApi};
pub use cache::{FetchStatus, MutualCache, MutualResult};
pub use cancel::CancelFlag;
pub use community::{Community, Louvain, Partition};
pub use config::{Config, DataLayout};
pub use error::{NetworkError, Result};
pub use export::NetworkDocument;
pub use fetcher::{FetchOutcome, FetchSummary, MutualFetcher, RetryPolicy};
pub use graph::{GraphStats, SocialGraph};
pub use identity::{FriendRecord, IdentityStore, load_friend_csv};
pub use layout::{ForceLayout, Point};
pub use pipeline::{Pipeline, Progress, RunOutcome, RunReport, Stage, clear_user_data};
pub use session::{CookieSession, Session};
pub use worker::{PipelineEvent, PipelineRunner, RunHandle};
