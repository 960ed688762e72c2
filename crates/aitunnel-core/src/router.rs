use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;

use aitunnel_common::RouteStrategy;

use crate::channel::Channel;

#[derive(Debug, Clone)]
pub struct RouteGroup {
    pub pattern: String,
    pub channels: Vec<String>,
    pub strategy: RouteStrategy,
}

pub struct Resolved {
    pub channel: Arc<Channel>,
    pub key: String,
    pub key_index: usize,
}

struct Table {
    /// Declaration order matters: it is the priority tie-breaker and the
    /// round-robin pool identity.
    channels: Vec<Arc<Channel>>,
    by_name: HashMap<String, Arc<Channel>>,
    routes: Vec<RouteGroup>,
}

/// Maps a request path to a candidate channel and credential.
///
/// The table is swapped wholesale on reload; in-flight requests keep the
/// `Arc<Channel>` they resolved and finish against the old state.
pub struct Router {
    table: ArcSwap<Table>,
    /// Round-robin cursor per pool identity (member names joined by comma).
    cursors: Mutex<HashMap<String, usize>>,
}

impl Router {
    pub fn new(channels: Vec<Arc<Channel>>, routes: Vec<RouteGroup>) -> Self {
        Self {
            table: ArcSwap::from_pointee(Table::build(channels, routes)),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically replace channels and routes for hot reload.
    pub fn update(&self, channels: Vec<Arc<Channel>>, routes: Vec<RouteGroup>) {
        self.table.store(Arc::new(Table::build(channels, routes)));
    }

    /// All channels in declaration order.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.table.load().channels.clone()
    }

    pub fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.table.load().by_name.get(name).cloned()
    }

    pub fn resolve(&self, path: &str) -> Option<Resolved> {
        self.resolve_next(path, &HashSet::new())
    }

    /// Same algorithm restricted to channels outside `excluded`; the only
    /// routing primitive used during failover.
    pub fn resolve_next(&self, path: &str, excluded: &HashSet<String>) -> Option<Resolved> {
        let table = self.table.load();
        let (members, strategy) = table.group_for(path);

        let candidates: Vec<(usize, &Arc<Channel>)> = members
            .iter()
            .enumerate()
            .filter(|(_, ch)| !excluded.contains(ch.name()))
            .map(|(index, ch)| (index, ch))
            .collect();

        let mut pool: Vec<(usize, &Arc<Channel>)> = candidates
            .iter()
            .filter(|(_, ch)| ch.is_available())
            .copied()
            .collect();
        if pool.is_empty() {
            // Degraded last resort: fallback channels that are at least
            // switched on, even if their health is not known-good.
            pool = candidates
                .iter()
                .filter(|(_, ch)| ch.enabled() && ch.fallback())
                .copied()
                .collect();
        }
        if pool.is_empty() {
            return None;
        }

        let chosen = match strategy {
            RouteStrategy::Priority => self.pick_priority(&pool),
            RouteStrategy::RoundRobin => self.pick_round_robin(&pool),
            RouteStrategy::LowestLatency => self.pick_lowest_latency(&pool),
        };

        // A missing credential is not a routing failure to recover from
        // here; the retry controller owns cross-channel iteration.
        let (key, key_index) = chosen.pick_key()?;
        Some(Resolved {
            channel: chosen.clone(),
            key,
            key_index,
        })
    }

    fn pick_priority(&self, pool: &[(usize, &Arc<Channel>)]) -> Arc<Channel> {
        let (_, chosen) = pool
            .iter()
            .min_by_key(|(index, ch)| (ch.fallback(), std::cmp::Reverse(ch.weight()), *index))
            .copied()
            .expect("pool checked non-empty");
        chosen.clone()
    }

    fn pick_round_robin(&self, pool: &[(usize, &Arc<Channel>)]) -> Arc<Channel> {
        let identity = pool
            .iter()
            .map(|(_, ch)| ch.name())
            .collect::<Vec<_>>()
            .join(",");
        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        let cursor = cursors.entry(identity).or_insert(0);
        let index = *cursor % pool.len();
        *cursor = cursor.wrapping_add(1);
        pool[index].1.clone()
    }

    fn pick_lowest_latency(&self, pool: &[(usize, &Arc<Channel>)]) -> Arc<Channel> {
        let (_, chosen) = pool
            .iter()
            .min_by_key(|(index, ch)| {
                let latency = ch.latency_ms();
                (latency.is_none(), latency.unwrap_or(u64::MAX), *index)
            })
            .copied()
            .expect("pool checked non-empty");
        chosen.clone()
    }
}

impl Table {
    fn build(channels: Vec<Arc<Channel>>, routes: Vec<RouteGroup>) -> Self {
        let by_name = channels
            .iter()
            .map(|ch| (ch.name().to_string(), ch.clone()))
            .collect();
        Self {
            channels,
            by_name,
            routes,
        }
    }

    /// First matching route group in declaration order; the synthetic
    /// default group (all channels, priority) when nothing matches.
    fn group_for(&self, path: &str) -> (Vec<Arc<Channel>>, RouteStrategy) {
        for route in &self.routes {
            if !matches_pattern(&route.pattern, path) {
                continue;
            }
            let members = route
                .channels
                .iter()
                .filter_map(|name| self.by_name.get(name).cloned())
                .collect();
            return (members, route.strategy);
        }
        (self.channels.clone(), RouteStrategy::Priority)
    }
}

/// Literal paths plus two wildcards: `prefix/**` matches the prefix itself
/// or any descendant; `prefix/*` matches exactly one more segment.
pub fn matches_pattern(pattern: &str, path: &str) -> bool {
    let path = path.trim_end_matches('/');
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return path == prefix || path.starts_with(&format!("{prefix}/"));
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return match path.strip_prefix(prefix).and_then(|rest| rest.strip_prefix('/')) {
            Some(rest) => !rest.is_empty() && !rest.contains('/'),
            None => false,
        };
    }
    pattern.trim_end_matches('/') == path
}
