//! Resource queries issued by this node.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::{
    core::{
        message::{Message, MessageKind, Search, SearchOk},
        node::Node,
        resource::{AggregatedResource, NameMatcher},
    },
    router::{Router, RouterListener},
};

/// Issues searches and collects their replies.
///
/// Replies keep arriving for as long as the search travels, the results are whatever has been
/// collected when they are read.
pub struct QueryManager {
    this: Weak<QueryManager>,
    router: Arc<Router>,
    results: RwLock<HashMap<String, HashMap<String, AggregatedResource>>>,
}

impl std::fmt::Debug for QueryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryManager")
            .field("addr", &self.router.local_addr())
            .field("queries", &self.results.read().len())
            .finish()
    }
}

impl QueryManager {
    /// Creates the manager and subscribes it to the router.
    pub fn new(router: Arc<Router>) -> Arc<Self> {
        let manager = Arc::new_cyclic(|this| QueryManager {
            this: this.clone(),
            router,
            results: Default::default(),
        });

        manager
            .router
            .add_listener(manager.this.clone() as Weak<dyn RouterListener>);

        manager
    }

    /// Routes a search for the query, earlier results for it are kept.
    pub fn query(&self, query: &str) {
        self.results.write().entry(query.to_owned()).or_default();

        let search = Search {
            origin: self.router.local_addr(),
            query: query.to_owned(),
            hops: 0,
        };
        self.router.route(None, search.into());
    }

    /// The resources found for the query so far, sorted by name.
    pub fn results(&self, query: &str) -> Vec<AggregatedResource> {
        let mut results: Vec<AggregatedResource> = self
            .results
            .read()
            .get(query)
            .map(|found| found.values().cloned().collect())
            .unwrap_or_default();
        results.sort_by(|a, b| a.name().cmp(b.name()));

        results
    }

    /// The queries results are being collected for.
    pub fn queries(&self) -> Vec<String> {
        self.results.read().keys().cloned().collect()
    }

    /// Stops collecting results for the query, returns `false` if it wasn't issued.
    pub fn clear(&self, query: &str) -> bool {
        self.results.write().remove(query).is_some()
    }

    // Merges the reply into every outstanding query one of its names matches.
    fn on_search_ok(&self, search_ok: SearchOk) {
        let node = self.router.resolve(search_ok.addr);
        let mut results = self.results.write();
        let mut merged = false;

        for (query, found) in results.iter_mut() {
            let matcher = NameMatcher::new(query);
            for name in search_ok.names.iter().filter(|name| matcher.matches(name)) {
                found
                    .entry(name.clone())
                    .or_insert_with(|| AggregatedResource::new(name.as_str()))
                    .insert(node.clone());
                merged = true;
            }
        }

        if !merged {
            debug!(
                "{}: no outstanding query for the results from {}",
                self.router.local_addr(),
                search_ok.addr
            );
        }
    }
}

impl RouterListener for QueryManager {
    fn on_message_received(&self, from: &Node, message: &Message) {
        if message.kind() != MessageKind::SearchOk {
            return;
        }

        match SearchOk::try_from(message) {
            Ok(search_ok) => self.on_search_ok(search_ok),
            Err(e) => warn!(
                "{}: dropping malformed results from {from}: {e}",
                self.router.local_addr()
            ),
        }
    }
}
