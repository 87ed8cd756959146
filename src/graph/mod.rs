pub mod reference;
pub mod url_info;
pub mod visitor;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use petgraph::Directed;
use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::visit::EdgeRef;
use tracing::{debug, info};

use crate::error::{KitchenError, KitchenResult, Trace};
use reference::{Reference, ReferenceId, ReferenceInit};
use url_info::{Content, InlineUrlSite, UrlInfo};

/// Called once when a UrlInfo loses its last live incoming reference.
pub type DereferenceListener = Arc<dyn Fn(&UrlInfo) + Send + Sync>;

/// The url graph: a directed petgraph StableGraph of UrlInfo nodes with O(1) url lookup.
///
/// Edges exist only for finalized, live references. Every reference ever created stays
/// in `references` so redirection chains remain inspectable.
pub struct UrlGraph {
    pub name: String,
    /// Edge weight is the reference that produced the edge.
    pub graph: StableGraph<UrlInfo, ReferenceId, Directed>,
    /// Maps urls to node indices. The root node is not indexed.
    pub url_index: HashMap<String, NodeIndex>,
    references: BTreeMap<ReferenceId, Reference>,
    superseded_by: HashMap<ReferenceId, ReferenceId>,
    next_reference_id: u64,
    root: NodeIndex,
    /// Search-param variants get an implicit reference to their base url.
    pub tracks_search_param_variants: bool,
    /// Build graphs allow removing references of finalized owners.
    pub is_build: bool,
    clock: u64,
    dereference_listeners: Vec<DereferenceListener>,
}

impl fmt::Debug for UrlGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlGraph")
            .field("name", &self.name)
            .field("urls", &self.url_index.len())
            .field("references", &self.references.len())
            .finish()
    }
}

impl UrlGraph {
    /// Create a graph whose root node stands for `root_directory_url`.
    pub fn new(name: impl Into<String>, root_directory_url: &str) -> Self {
        let mut graph = StableGraph::new();
        let mut root_info = UrlInfo::new(root_directory_url);
        root_info.is_root = true;
        root_info.content_finalized = true;
        let root = graph.add_node(root_info);
        Self {
            name: name.into(),
            graph,
            url_index: HashMap::new(),
            references: BTreeMap::new(),
            superseded_by: HashMap::new(),
            next_reference_id: 1,
            root,
            tracks_search_param_variants: false,
            is_build: false,
            clock: 0,
            dereference_listeners: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    /// Monotonic logical clock used for modification and dereference timestamps.
    pub fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn url_info(&self, idx: NodeIndex) -> &UrlInfo {
        &self.graph[idx]
    }

    pub fn url_info_mut(&mut self, idx: NodeIndex) -> &mut UrlInfo {
        &mut self.graph[idx]
    }

    pub fn get_url_info(&self, url: &str) -> Option<NodeIndex> {
        self.url_index.get(url).copied()
    }

    /// All non-root nodes in insertion order.
    pub fn url_infos(&self) -> impl Iterator<Item = (NodeIndex, &UrlInfo)> {
        self.graph
            .node_indices()
            .filter(move |&i| i != self.root)
            .map(move |i| (i, &self.graph[i]))
    }

    pub fn url_count(&self) -> usize {
        self.url_index.len()
    }

    pub fn reference(&self, id: ReferenceId) -> Option<&Reference> {
        self.references.get(&id)
    }

    pub(crate) fn reference_mut(&mut self, id: ReferenceId) -> Option<&mut Reference> {
        self.references.get_mut(&id)
    }

    fn expect_reference(&self, id: ReferenceId) -> KitchenResult<&Reference> {
        self.references
            .get(&id)
            .ok_or_else(|| KitchenError::ReferenceLifecycle(format!("unknown reference {id}")))
    }

    /// Every reference ever created, ordered by id.
    pub fn references(&self) -> impl Iterator<Item = &Reference> {
        self.references.values()
    }

    pub fn add_dereference_listener(&mut self, listener: DereferenceListener) {
        self.dereference_listeners.push(listener);
    }

    // -----------------------------------------------------------------------
    // Reference lifecycle
    // -----------------------------------------------------------------------

    /// Register a new, unresolved reference owned by `owner`.
    pub fn create_reference(&mut self, owner: NodeIndex, init: ReferenceInit) -> ReferenceId {
        let id = ReferenceId(self.next_reference_id);
        self.next_reference_id += 1;
        let owner_info = &self.graph[owner];
        let trace = match init.position {
            Some(pos) => Trace::at(
                owner_info.url(),
                pos.line,
                pos.column,
                owner_info.content_text(),
            ),
            None => Trace::from_url(owner_info.url()),
        };
        let reference = Reference::from_init(id, owner, trace, init);
        if reference.debug {
            info!(reference = %id, specifier = %reference.specifier, owner = %owner_info.url(), "reference created");
        }
        self.references.insert(id, reference);
        id
    }

    pub fn set_reference_url(&mut self, id: ReferenceId, url: String) -> KitchenResult<()> {
        let reference = self
            .references
            .get_mut(&id)
            .ok_or_else(|| KitchenError::ReferenceLifecycle(format!("unknown reference {id}")))?;
        if reference.debug {
            info!(reference = %id, url = %url, "reference resolved");
        }
        reference.set_url(url)
    }

    /// Replace `id` by a new reference pointing at `url`. Only unfinalized references redirect.
    pub fn redirect_reference(&mut self, id: ReferenceId, url: String) -> KitchenResult<ReferenceId> {
        let current = self.expect_reference(id)?;
        if current.is_finalized() {
            return Err(KitchenError::ReferenceLifecycle(format!(
                "{id} is finalized and cannot be redirected to {url}"
            )));
        }
        if current.debug {
            info!(reference = %id, from = ?current.url(), to = %url, "reference redirected");
        }
        let next_id = ReferenceId(self.next_reference_id);
        let mut next = current.successor(next_id);
        self.next_reference_id += 1;
        next.set_url(url)?;
        self.references.insert(next_id, next);
        self.superseded_by.insert(id, next_id);
        Ok(next_id)
    }

    /// Last reference of the chain `id` belongs to.
    pub fn chain_tail(&self, id: ReferenceId) -> ReferenceId {
        let mut current = id;
        while let Some(&next) = self.superseded_by.get(&current) {
            current = next;
        }
        current
    }

    /// A reference is live when it is finalized, not removed, and not superseded.
    pub fn is_live(&self, id: ReferenceId) -> bool {
        match self.references.get(&id) {
            Some(r) => r.edge.is_some() && !r.removed && self.chain_tail(id) == id,
            None => false,
        }
    }

    /// Attach the reference to its target UrlInfo, creating it when needed.
    pub fn finalize_reference(&mut self, id: ReferenceId) -> KitchenResult<NodeIndex> {
        let reference = self.expect_reference(id)?;
        if let Some(target) = reference.target {
            return Ok(target);
        }
        if reference.url().is_none() {
            return Err(KitchenError::ReferenceLifecycle(format!(
                "{id} must be resolved before it is finalized"
            )));
        }
        let owner = reference.owner;
        let target = self.reuse_or_create_url_info(id, false)?;
        let edge = self.graph.add_edge(owner, target, id);
        if let Some(r) = self.references.get_mut(&id) {
            r.edge = Some(edge);
            r.target = Some(target);
        }
        self.apply_first_reference(target, id);
        if let Some(r) = self.references.get(&id) {
            if r.is_inline {
                let site = self.inline_site_for(r);
                let info = &mut self.graph[target];
                info.is_inline = true;
                info.inline_url_site = site;
            }
            if r.debug {
                info!(reference = %id, target = %self.graph[target].url(), "reference finalized");
            }
        }
        Ok(target)
    }

    fn inline_site_for(&self, reference: &Reference) -> Option<InlineUrlSite> {
        let host = self.find_parent_if_inline(reference.owner).unwrap_or(reference.owner);
        let owner_info = &self.graph[reference.owner];
        let (mut line, mut column) = reference
            .position
            .map(|p| (p.line, p.column))
            .unwrap_or((1, 0));
        // Nested inline content: shift by where the owner itself sits in the host.
        if let Some(owner_site) = &owner_info.inline_url_site {
            if line == 1 {
                column += owner_site.column;
            }
            line += owner_site.line.saturating_sub(1);
        }
        Some(InlineUrlSite {
            url: self.graph[host].url().to_owned(),
            line,
            column,
        })
    }

    /// First-reference-wins: the first reference sets type expectations, a later strong
    /// reference takes over from a weak one.
    fn apply_first_reference(&mut self, target: NodeIndex, id: ReferenceId) {
        let Some(reference) = self.references.get(&id) else {
            return;
        };
        let replace = match self.graph[target].first_reference {
            None => true,
            Some(prev) => {
                let prev_is_weak = self.references.get(&prev).is_none_or(|p| p.is_weak);
                let prev_gone = !self.is_live(prev) && prev != id;
                (prev_is_weak || prev_gone) && !reference.is_weak
            }
        };
        let is_entry_point = reference.is_entry_point;
        let expected_type = reference.expected_type;
        let expected_subtype = reference.expected_subtype.clone();
        let filename_hint = reference.filename_hint.clone();
        let info = &mut self.graph[target];
        if is_entry_point {
            info.is_entry_point = true;
        }
        if !replace {
            return;
        }
        info.first_reference = Some(id);
        if info.url_type.is_none() {
            info.url_type = expected_type;
        }
        if info.subtype.is_none() {
            info.subtype = expected_subtype;
        }
        if filename_hint.is_some() {
            info.filename_hint = filename_hint;
        }
    }

    /// Node for the reference's url (or generated url), created on first use.
    ///
    /// Once the graph tracks search-param variants, a new url carrying search params gets
    /// an implicit weak reference to its search-param-free base.
    pub fn reuse_or_create_url_info(
        &mut self,
        id: ReferenceId,
        use_generated_url: bool,
    ) -> KitchenResult<NodeIndex> {
        let reference = self.expect_reference(id)?;
        let url = if use_generated_url {
            reference.generated_url.clone()
        } else {
            reference.url().map(str::to_owned)
        }
        .ok_or_else(|| {
            KitchenError::ReferenceLifecycle(format!("{id} has no url to create a node for"))
        })?;
        if let Some(existing) = self.url_index.get(&url) {
            return Ok(*existing);
        }
        let kind = reference.kind;
        let mut info = UrlInfo::new(url.clone());
        info.modified_timestamp = 0;
        let idx = self.graph.add_node(info);
        self.url_index.insert(url.clone(), idx);
        debug!(graph = %self.name, url = %url, "url info created");

        if self.tracks_search_param_variants
            && !url.starts_with("ignore:")
            && !url.starts_with("data:")
            && url.contains('?')
        {
            let base_url = self.graph[idx].url_without_search().to_owned();
            let implicit_id = self.create_reference(
                idx,
                ReferenceInit::new(kind, base_url.clone()).weak().implicit(),
            );
            self.set_reference_url(implicit_id, base_url.clone())?;
            let base = self.finalize_reference(implicit_id)?;
            self.graph[base].search_param_variants.insert(url);
            if let Some(r) = self.references.get_mut(&id) {
                r.implicit_references.insert(implicit_id);
            }
        }
        Ok(idx)
    }

    /// Remove a reference, patching its redirection chain.
    ///
    /// Once an owner's content is finalized its references are frozen, except weak or
    /// implicit ones, references owned by the root, and any reference of a build graph.
    pub fn remove_reference(&mut self, id: ReferenceId) -> KitchenResult<()> {
        let reference = self.expect_reference(id)?;
        if reference.removed {
            return Ok(());
        }
        let owner = &self.graph[reference.owner];
        let allowed = !owner.content_finalized
            || reference.is_weak
            || reference.is_implicit
            || self.is_build
            || owner.is_root;
        if !allowed {
            return Err(KitchenError::ReferenceLifecycle(format!(
                "cannot remove {id} (\"{}\"): content of {} is already finalized",
                reference.specifier,
                owner.url()
            )));
        }
        self.detach_reference(id);
        Ok(())
    }

    fn detach_reference(&mut self, id: ReferenceId) {
        let Some(reference) = self.references.get_mut(&id) else {
            return;
        };
        if reference.removed {
            return;
        }
        reference.removed = true;
        let edge = reference.edge.take();
        let target = reference.target;
        let prev = reference.prev;
        let implicit: Vec<ReferenceId> = reference.implicit_references.iter().copied().collect();
        if reference.debug {
            info!(reference = %id, "reference removed");
        }

        if let Some(edge) = edge {
            self.graph.remove_edge(edge);
        }

        let next = self.superseded_by.remove(&id);
        if let Some(next) = next {
            if let Some(n) = self.references.get_mut(&next) {
                n.prev = prev;
            }
        }
        if let Some(prev) = prev {
            match next {
                Some(next) => {
                    self.superseded_by.insert(prev, next);
                }
                None => {
                    self.superseded_by.remove(&prev);
                }
            }
        }

        for implicit_id in implicit {
            self.detach_reference(implicit_id);
        }

        if let Some(target) = target {
            let still_referenced = self
                .graph
                .edges_directed(target, Direction::Incoming)
                .next()
                .is_some();
            if !still_referenced {
                let now = self.tick();
                self.graph[target].dereferenced_timestamp = Some(now);
                let info = &self.graph[target];
                for listener in &self.dereference_listeners {
                    listener(info);
                }
            }
        }
    }

    /// Turn an already finalized reference into an inline one carrying `content`.
    ///
    /// The new reference replaces the old one in the owner; the target and every inline
    /// descendant now live inside the owner's ultimate host.
    pub fn reference_becomes_inline(
        &mut self,
        id: ReferenceId,
        content: Content,
        content_type: impl Into<String>,
    ) -> KitchenResult<ReferenceId> {
        let current = self.expect_reference(id)?;
        let target = current.target.ok_or_else(|| {
            KitchenError::ReferenceLifecycle(format!("{id} must be finalized before inlining"))
        })?;
        let url = current
            .url()
            .map(str::to_owned)
            .ok_or_else(|| KitchenError::ReferenceLifecycle(format!("{id} has no url")))?;
        let next_id = ReferenceId(self.next_reference_id);
        let mut next = current.successor(next_id);
        self.next_reference_id += 1;
        next.is_inline = true;
        next.content = Some(content.clone());
        next.content_type = Some(content_type.into());
        next.set_url(url)?;
        let owner = next.owner;
        self.references.insert(next_id, next);

        // Attach the inline reference before dropping the old edge so the target is
        // never observed as dereferenced.
        let edge = self.graph.add_edge(owner, target, next_id);
        if let Some(r) = self.references.get_mut(&next_id) {
            r.edge = Some(edge);
            r.target = Some(target);
        }
        if let Some(old) = self.references.get_mut(&id) {
            if let Some(old_edge) = old.edge.take() {
                self.graph.remove_edge(old_edge);
            }
        }
        self.superseded_by.insert(id, next_id);

        let site = self
            .references
            .get(&next_id)
            .and_then(|r| self.inline_site_for(r));
        let info = &mut self.graph[target];
        info.is_inline = true;
        info.inline_url_site = site;
        info.set_content(content);
        self.update_inline_descendants(target);
        Ok(next_id)
    }

    /// Re-point every inline descendant of `node` at its current ultimate host.
    fn update_inline_descendants(&mut self, node: NodeIndex) {
        let mut stack = vec![node];
        let mut seen = std::collections::HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let children: Vec<NodeIndex> = self
                .graph
                .edges_directed(current, Direction::Outgoing)
                .map(|e| e.target())
                .filter(|&t| self.graph[t].is_inline)
                .collect();
            for child in children {
                if let Some(host) = self.find_parent_if_inline(child) {
                    let host_url = self.graph[host].url().to_owned();
                    if let Some(site) = self.graph[child].inline_url_site.as_mut() {
                        site.url = host_url;
                    }
                }
                stack.push(child);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Live references owned by `node`, ordered by id.
    pub fn references_to_others(&self, node: NodeIndex) -> Vec<ReferenceId> {
        let mut ids: Vec<ReferenceId> = self
            .graph
            .edges_directed(node, Direction::Outgoing)
            .map(|e| *e.weight())
            .filter(|&id| self.is_live(id))
            .collect();
        ids.sort();
        ids
    }

    /// Live references targeting `node`, ordered by id.
    pub fn references_from_others(&self, node: NodeIndex) -> Vec<ReferenceId> {
        let mut ids: Vec<ReferenceId> = self
            .graph
            .edges_directed(node, Direction::Incoming)
            .map(|e| *e.weight())
            .filter(|&id| self.is_live(id))
            .collect();
        ids.sort();
        ids
    }

    pub fn is_used(&self, node: NodeIndex) -> bool {
        visitor::is_used(self, node)
    }

    /// Entry point nodes still reachable from the root, ordered by url.
    pub fn entry_points(&self) -> Vec<NodeIndex> {
        let mut entries: Vec<NodeIndex> = self
            .url_infos()
            .filter(|(idx, info)| info.is_entry_point && self.is_used(*idx))
            .map(|(idx, _)| idx)
            .collect();
        entries.sort_by(|a, b| self.graph[*a].url().cmp(self.graph[*b].url()));
        entries
    }

    /// Nearest non-inline ancestor of an inline node, `None` when `node` is not inline.
    pub fn find_parent_if_inline(&self, node: NodeIndex) -> Option<NodeIndex> {
        let mut current = node;
        let mut hops = 0;
        while self.graph[current].is_inline {
            let owner = self
                .graph
                .edges_directed(current, Direction::Incoming)
                .filter(|e| self.is_live(*e.weight()))
                .filter_map(|e| self.references.get(e.weight()))
                .find(|r| r.is_inline)
                .map(|r| r.owner)?;
            current = owner;
            hops += 1;
            if hops > self.graph.node_count() {
                return None;
            }
        }
        if current == node { None } else { Some(current) }
    }

    /// Find the live reference of `parent_url` (or one of its inline children) whose
    /// generated specifier designates `specifier`.
    pub fn infer_reference(&self, specifier: &str, parent_url: &str) -> Option<ReferenceId> {
        let parent = self.get_url_info(parent_url)?;
        let mut stack = vec![parent];
        let mut seen = std::collections::HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            for id in self.references_to_others(current) {
                let Some(reference) = self.references.get(&id) else {
                    continue;
                };
                if let Some(generated) = &reference.generated_specifier {
                    if decode_specifier(generated) == specifier {
                        return Some(id);
                    }
                }
                if let Some(target) = reference.target {
                    if self.graph[target].is_inline {
                        stack.push(target);
                    }
                }
            }
        }
        None
    }

    /// Nodes affected when `node`'s source changes: itself, its inline descendants,
    /// its search-param variants and every node implicitly depending on its url.
    pub fn invalidation_set(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut out = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![node];
        let changed_url = self.graph[node].url().to_owned();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            out.push(current);
            let info = &self.graph[current];
            for e in self.graph.edges_directed(current, Direction::Outgoing) {
                if self.graph[e.target()].is_inline && self.is_live(*e.weight()) {
                    stack.push(e.target());
                }
            }
            for variant in &info.search_param_variants {
                if let Some(v) = self.get_url_info(variant) {
                    stack.push(v);
                }
            }
        }
        for (idx, info) in self.url_infos() {
            if info.implicit_urls.contains(&changed_url) && !seen.contains(&idx) {
                out.push(idx);
            }
        }
        out
    }
}

/// Undo the per-type encoding applied to a generated specifier.
pub fn decode_specifier(generated: &str) -> String {
    let trimmed = generated.trim();
    let unquoted = if trimmed.len() >= 2
        && ((trimmed.starts_with('"') && trimmed.ends_with('"'))
            || (trimmed.starts_with('\'') && trimmed.ends_with('\'')))
    {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    };
    unquoted.replace("\\\"", "\"").replace("\\\\", "\\")
}
