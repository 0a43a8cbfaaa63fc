/*
 * pacsmith - Package resolution and build orchestration for Arch Linux.
 * Copyright (C) 2025  pacsmith contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Dependency resolution across both package sources.
//!
//! Resolution is a depth-first walk from the target. Each package gets a
//! [`ResolutionNode`] that is `InProgress` while its own dependencies are
//! walked; reaching an `InProgress` node again is a cycle and fails the
//! request. Post-order of the walk is the install order, so dependencies
//! always precede dependents and siblings keep their declared order.
//!
//! Version constraints are accumulated per name across all requirers and
//! checked pairwise; an incompatible pair fails with `VersionConflict`
//! instead of picking a winner.

pub mod catalog;

pub use catalog::Catalog;

use serde::Deserialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::error::{RequiredConstraint, ResolutionError};
use crate::package::{DependencySpec, InstalledState, Origin, PackageRecord, Version, VersionConstraint};

/// Which provider wins when several packages provide a virtual name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderPolicy {
    /// Repo providers first, AUR providers only when no repo one fits
    #[default]
    PreferBinaryRepo,
    /// AUR providers first
    PreferCommunitySource,
    /// Refuse to guess between several providers
    Strict,
}

/// Knobs for one resolve request
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Restrict the target (not its dependencies) to one origin
    pub pin: Option<Origin>,
    pub provider_policy: ProviderPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitStatus {
    Unvisited,
    InProgress,
    Resolved,
}

/// Resolver bookkeeping around a chosen record
#[derive(Debug, Clone)]
pub struct ResolutionNode {
    pub record: Arc<PackageRecord>,
    pub status: VisitStatus,
    pub required_by: BTreeSet<String>,
    /// Chosen plan items this node needs, in declared order
    pub depends_on: Vec<String>,
    /// Only needed to build other packages
    pub build_only: bool,
}

impl ResolutionNode {
    fn new(record: Arc<PackageRecord>) -> Self {
        Self {
            record,
            status: VisitStatus::Unvisited,
            required_by: BTreeSet::new(),
            depends_on: Vec::new(),
            build_only: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    Install,
    Remove,
}

/// One step of a build plan
#[derive(Debug, Clone, PartialEq)]
pub struct PlanItem {
    pub record: Arc<PackageRecord>,
    pub action: PlanAction,
    pub required_by: Vec<String>,
    pub depends_on: Vec<String>,
    pub build_only: bool,
}

impl PlanItem {
    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn origin(&self) -> Origin {
        self.record.origin
    }

    /// AUR installs run untrusted build scripts
    pub fn needs_review(&self) -> bool {
        self.action == PlanAction::Install && self.record.origin == Origin::CommunitySource
    }
}

/// Dependency already met by the installed system
#[derive(Debug, Clone, PartialEq)]
pub struct SatisfiedLeaf {
    pub name: String,
    pub provider: String,
    pub version: Option<Version>,
    pub required_by: Vec<String>,
}

/// Ordered, conflict-free list of installs for one target
#[derive(Debug, Clone, PartialEq)]
pub struct BuildPlan {
    pub target: String,
    pub items: Vec<PlanItem>,
    /// Pruned dependencies, kept for diagnostics
    pub satisfied: Vec<SatisfiedLeaf>,
}

impl BuildPlan {
    /// Single-package removal
    pub fn removal(name: &str, version: &Version) -> Self {
        let record = PackageRecord::new(name, version.as_str(), Origin::BinaryRepo)
            .in_repository("local")
            .mark_installed(true);
        Self {
            target: name.to_string(),
            items: vec![PlanItem {
                record: Arc::new(record),
                action: PlanAction::Remove,
                required_by: Vec::new(),
                depends_on: Vec::new(),
                build_only: false,
            }],
            satisfied: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.items.iter().map(PlanItem::name).collect()
    }

    pub fn get(&self, name: &str) -> Option<&PlanItem> {
        self.items.iter().find(|i| i.name() == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.items.iter().position(|i| i.name() == name)
    }

    /// Items that must pass the review gate, in plan order
    pub fn review_items(&self) -> impl Iterator<Item = &PlanItem> {
        self.items.iter().filter(|i| i.needs_review())
    }

    /// Check the plan invariants: unique names and every dependency met
    /// by an earlier item or by the installed system
    pub fn validate(&self, installed: &InstalledState) -> Result<(), String> {
        let mut seen: HashSet<&str> = HashSet::new();
        for (idx, item) in self.items.iter().enumerate() {
            if !seen.insert(item.name()) {
                return Err(format!("duplicate plan item '{}'", item.name()));
            }
            if item.action == PlanAction::Remove {
                continue;
            }
            for dep in &item.depends_on {
                if !self.items[..idx].iter().any(|i| i.name() == dep) {
                    return Err(format!("'{}' is ordered before its dependency '{}'", item.name(), dep));
                }
            }
            for dep in &item.record.dependencies {
                if let Some(pos) = self.items.iter().position(|i| i.name() == dep.name) {
                    if pos > idx {
                        return Err(format!("'{}' is ordered before its dependency '{}'", item.name(), dep.name));
                    }
                }
                let earlier = self.items[..idx].iter().any(|i| i.record.satisfies(dep));
                let constraints: Vec<&VersionConstraint> = dep.constraint.iter().collect();
                if !earlier && installed.satisfies(&dep.name, &constraints).is_none() {
                    return Err(format!("dependency '{}' of '{}' is not met", dep, item.name()));
                }
            }
        }
        Ok(())
    }
}

/// Resolves one target against a collected catalog
pub struct Resolver<'a> {
    catalog: &'a Catalog,
    installed: &'a InstalledState,
    options: ResolveOptions,
}

impl<'a> Resolver<'a> {
    pub fn new(catalog: &'a Catalog, installed: &'a InstalledState) -> Self {
        Self {
            catalog,
            installed,
            options: ResolveOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ResolveOptions) -> Self {
        self.options = options;
        self
    }

    /// Produce a complete plan or a typed error; never a partial plan
    pub fn resolve(&self, target: &str) -> Result<BuildPlan, ResolutionError> {
        let _span = crate::span_operation!("resolve").entered();
        let mut walk = Walk::new(self, target);
        walk.visit(None, &DependencySpec::new(target), false)?;
        walk.check_conflicts()?;
        let order = walk.sorted()?;

        let plan = walk.into_plan(target, order);
        tracing::info!(
            package = target,
            items = plan.items.len(),
            satisfied = plan.satisfied.len(),
            "resolved build plan"
        );
        Ok(plan)
    }
}

/// State of one resolution run; never shared between runs
struct Walk<'r, 'a> {
    resolver: &'r Resolver<'a>,
    target: String,
    nodes: HashMap<String, ResolutionNode>,
    /// Requested name (possibly virtual) -> chosen package name
    alias: HashMap<String, String>,
    constraints: HashMap<String, Vec<(String, VersionConstraint)>>,
    satisfied: Vec<SatisfiedLeaf>,
    /// Requirers of pruned leaves that a later constraint pulled back in
    promoted: HashMap<String, Vec<String>>,
    stack: Vec<String>,
    order: Vec<String>,
}

impl<'r, 'a> Walk<'r, 'a> {
    fn new(resolver: &'r Resolver<'a>, target: &str) -> Self {
        Self {
            resolver,
            target: target.to_string(),
            nodes: HashMap::new(),
            alias: HashMap::new(),
            constraints: HashMap::new(),
            satisfied: Vec::new(),
            promoted: HashMap::new(),
            stack: Vec::new(),
            order: Vec::new(),
        }
    }

    fn visit(
        &mut self,
        requirer: Option<&str>,
        dep: &DependencySpec,
        build_only: bool,
    ) -> Result<(), ResolutionError> {
        let requirer_name = requirer.unwrap_or("target").to_string();
        if let Some(constraint) = &dep.constraint {
            self.add_constraint(&dep.name, &requirer_name, constraint)?;
        }

        if let Some(chosen) = self.alias.get(&dep.name).cloned() {
            return self.revisit(&chosen, &dep.name, &requirer_name, build_only);
        }

        if requirer.is_some() && self.check_installed(&dep.name, &requirer_name) {
            return Ok(());
        }

        let record = self.choose(&dep.name, requirer)?;
        if self.nodes.contains_key(&record.name) {
            // reached through another name it provides
            self.alias.insert(dep.name.clone(), record.name.clone());
            if let (Some(earlier), Some(node)) = (self.promoted.remove(&dep.name), self.nodes.get_mut(&record.name)) {
                node.required_by.extend(earlier);
            }
            return self.revisit(&record.name, &dep.name, &requirer_name, build_only);
        }

        let name = record.name.clone();
        self.alias.insert(dep.name.clone(), name.clone());
        self.alias.insert(name.clone(), name.clone());

        let mut node = ResolutionNode::new(Arc::clone(&record));
        node.status = VisitStatus::InProgress;
        node.build_only = build_only;
        if requirer.is_some() {
            node.required_by.insert(requirer_name);
        }
        if let Some(earlier) = self.promoted.remove(&dep.name) {
            node.required_by.extend(earlier);
        }
        self.nodes.insert(name.clone(), node);
        self.stack.push(name.clone());
        tracing::trace!(package = %name, origin = %record.origin, "visiting");

        for child in &record.dependencies {
            self.visit(Some(&name), child, child.build_only)?;
        }

        self.stack.pop();
        if let Some(node) = self.nodes.get_mut(&name) {
            node.status = VisitStatus::Resolved;
        }
        self.order.push(name);
        Ok(())
    }

    /// A name that already has a node: cycle check and constraint recheck
    fn revisit(
        &mut self,
        chosen: &str,
        requested: &str,
        requirer: &str,
        build_only: bool,
    ) -> Result<(), ResolutionError> {
        let status = match self.nodes.get(chosen) {
            Some(node) => node.status,
            None => return Ok(()),
        };

        if status == VisitStatus::InProgress {
            let start = self.stack.iter().position(|n| n == chosen).unwrap_or(0);
            let mut cycle = self.stack[start..].to_vec();
            cycle.push(chosen.to_string());
            tracing::debug!(cycle = %cycle.join(" -> "), "dependency cycle");
            return Err(ResolutionError::CyclicDependency { cycle });
        }

        let record = match self.nodes.get(chosen) {
            Some(node) => Arc::clone(&node.record),
            None => return Ok(()),
        };
        let unmet = self
            .constraints_for(requested)
            .any(|c| !record.satisfies(&DependencySpec::new(requested).with_constraint(c.op, c.version.as_str())));
        if unmet {
            return Err(self.conflict(requested));
        }

        if let Some(node) = self.nodes.get_mut(chosen) {
            node.required_by.insert(requirer.to_string());
            node.build_only &= build_only;
        }
        Ok(())
    }

    fn add_constraint(
        &mut self,
        name: &str,
        requirer: &str,
        constraint: &VersionConstraint,
    ) -> Result<(), ResolutionError> {
        let list = self.constraints.entry(name.to_string()).or_default();
        let compatible = list.iter().all(|(_, c)| c.compatible_with(constraint));
        list.push((requirer.to_string(), constraint.clone()));
        if compatible {
            Ok(())
        } else {
            Err(self.conflict(name))
        }
    }

    fn constraints_for(&self, name: &str) -> impl Iterator<Item = &VersionConstraint> {
        self.constraints
            .get(name)
            .into_iter()
            .flat_map(|list| list.iter().map(|(_, c)| c))
    }

    fn conflict(&self, name: &str) -> ResolutionError {
        let constraints = self
            .constraints
            .get(name)
            .map(|list| {
                list.iter()
                    .map(|(by, c)| RequiredConstraint {
                        required_by: by.clone(),
                        constraint: c.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        tracing::debug!(package = name, "version constraints cannot all hold");
        ResolutionError::VersionConflict {
            name: name.to_string(),
            constraints,
        }
    }

    /// Prune a dependency the system already satisfies; promotes a
    /// previously pruned one whose installed version no longer fits
    fn check_installed(&mut self, name: &str, requirer: &str) -> bool {
        let constraints: Vec<&VersionConstraint> = self.constraints_for(name).collect();
        let found = self.resolver.installed.satisfies(name, &constraints);
        let existing = self.satisfied.iter().position(|leaf| leaf.name == name);

        match (found, existing) {
            (Some(_), Some(idx)) => {
                let leaf = &mut self.satisfied[idx];
                if !leaf.required_by.iter().any(|r| r == requirer) {
                    leaf.required_by.push(requirer.to_string());
                }
                true
            }
            (Some(found), None) => {
                self.satisfied.push(SatisfiedLeaf {
                    name: name.to_string(),
                    provider: found.provider,
                    version: found.version,
                    required_by: vec![requirer.to_string()],
                });
                true
            }
            (None, Some(idx)) => {
                let leaf = self.satisfied.remove(idx);
                tracing::debug!(package = name, provider = %leaf.provider, "installed version no longer satisfies");
                // requirers that already finished depend on the new node too
                self.promoted.insert(name.to_string(), leaf.required_by);
                false
            }
            (None, None) => false,
        }
    }

    fn choose(&self, name: &str, requirer: Option<&str>) -> Result<Arc<PackageRecord>, ResolutionError> {
        let catalog = self.resolver.catalog;
        let options = &self.resolver.options;
        let pin = if name == self.target { options.pin } else { None };
        let fits = |record: &PackageRecord| {
            pin.map_or(true, |o| record.origin == o)
                && self.constraints_for(name).all(|c| {
                    record.satisfies(&DependencySpec::new(name).with_constraint(c.op, c.version.as_str()))
                })
        };

        // Exact names: repo first
        let direct = catalog.candidates(name);
        if let Some(record) = direct.iter().find(|r| fits(r)) {
            return Ok(Arc::clone(record));
        }

        // Something already in the plan may provide it
        let mut in_plan: Vec<&Arc<PackageRecord>> = self
            .order
            .iter()
            .chain(self.stack.iter())
            .filter_map(|n| self.nodes.get(n).map(|node| &node.record))
            .filter(|r| r.provision(name).is_some() && fits(r))
            .collect();
        if !in_plan.is_empty() {
            return Ok(Arc::clone(in_plan.remove(0)));
        }

        let providers: Vec<&Arc<PackageRecord>> = catalog.providers(name).iter().filter(|r| fits(r)).collect();
        match providers.len() {
            0 => {}
            1 => return Ok(Arc::clone(providers[0])),
            _ if options.provider_policy == ProviderPolicy::Strict => {
                return Err(ResolutionError::AmbiguousProvider {
                    name: name.to_string(),
                    candidates: providers
                        .iter()
                        .map(|r| format!("{} ({})", r.name, r.origin))
                        .collect(),
                });
            }
            _ => {
                let preferred = match options.provider_policy {
                    ProviderPolicy::PreferCommunitySource => Origin::CommunitySource,
                    _ => Origin::BinaryRepo,
                };
                let pick = providers
                    .iter()
                    .find(|r| r.origin == preferred)
                    .unwrap_or(&providers[0]);
                tracing::debug!(virtual_name = name, provider = %pick.name, "selected provider");
                return Ok(Arc::clone(pick));
            }
        }

        if !direct.is_empty() && self.constraints_for(name).next().is_some() {
            return Err(self.conflict(name));
        }
        Err(ResolutionError::NotFound {
            name: name.to_string(),
            required_by: requirer.map(str::to_string),
        })
    }

    fn check_conflicts(&self) -> Result<(), ResolutionError> {
        for name in &self.order {
            let Some(node) = self.nodes.get(name) else { continue };
            for conflict in &node.record.conflicts {
                for other in &self.order {
                    if other == name {
                        continue;
                    }
                    let Some(other_node) = self.nodes.get(other) else { continue };
                    if other_node.record.satisfies(conflict) {
                        return Err(ResolutionError::PackageConflict {
                            package: name.clone(),
                            conflicts_with: other.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Plan nodes a node depends on, in declaration order. Taken after the
    /// walk, so leaves promoted after their requirer finished are included.
    fn dependency_edges(&self, name: &str) -> Vec<String> {
        let mut edges: Vec<String> = Vec::new();
        let Some(node) = self.nodes.get(name) else {
            return edges;
        };
        for child in &node.record.dependencies {
            if let Some(chosen) = self.alias.get(&child.name) {
                if chosen != name && self.nodes.contains_key(chosen) && !edges.contains(chosen) {
                    edges.push(chosen.clone());
                }
            }
        }
        edges
    }

    /// Post-order over the final edges, starting at the target; matches
    /// first-discovery order wherever no leaf was promoted
    fn sorted(&mut self) -> Result<Vec<String>, ResolutionError> {
        let edges: HashMap<String, Vec<String>> = self
            .order
            .iter()
            .map(|name| (name.clone(), self.dependency_edges(name)))
            .collect();

        let mut sorted = Vec::with_capacity(self.order.len());
        let mut done: HashSet<String> = HashSet::new();
        let roots: Vec<String> = std::iter::once(self.target.clone())
            .chain(self.order.iter().cloned())
            .collect();
        for root in roots {
            if edges.contains_key(&root) {
                let mut path = Vec::new();
                Self::post_order(&root, &edges, &mut done, &mut path, &mut sorted)?;
            }
        }

        for (name, depends_on) in edges {
            if let Some(node) = self.nodes.get_mut(&name) {
                node.depends_on = depends_on;
            }
        }
        Ok(sorted)
    }

    fn post_order(
        name: &str,
        edges: &HashMap<String, Vec<String>>,
        done: &mut HashSet<String>,
        path: &mut Vec<String>,
        sorted: &mut Vec<String>,
    ) -> Result<(), ResolutionError> {
        if done.contains(name) {
            return Ok(());
        }
        if let Some(start) = path.iter().position(|n| n == name) {
            let mut cycle = path[start..].to_vec();
            cycle.push(name.to_string());
            return Err(ResolutionError::CyclicDependency { cycle });
        }

        path.push(name.to_string());
        for dep in edges.get(name).into_iter().flatten() {
            Self::post_order(dep, edges, done, path, sorted)?;
        }
        path.pop();
        done.insert(name.to_string());
        sorted.push(name.to_string());
        Ok(())
    }

    fn into_plan(mut self, target: &str, order: Vec<String>) -> BuildPlan {
        let items = order
            .iter()
            .filter_map(|name| self.nodes.remove(name))
            .map(|node| PlanItem {
                record: node.record,
                action: PlanAction::Install,
                required_by: node.required_by.into_iter().collect(),
                depends_on: node.depends_on,
                build_only: node.build_only,
            })
            .collect();
        BuildPlan {
            target: target.to_string(),
            items,
            satisfied: self.satisfied,
        }
    }
}
