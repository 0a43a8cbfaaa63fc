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

//! Arch version strings, dependency specifiers and version constraints.
//!
//! Ordering follows pacman's `vercmp`: `[epoch:]pkgver[-pkgrel]`, where the
//! release is only compared when both sides carry one.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A package version, totally ordered by Arch rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Epoch component, "0" when absent
    pub fn epoch(&self) -> &str {
        split_evr(&self.0).0
    }

    /// Upstream version component
    pub fn pkgver(&self) -> &str {
        split_evr(&self.0).1
    }

    /// Package release, if present
    pub fn pkgrel(&self) -> Option<&str> {
        split_evr(&self.0).2
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        vercmp(&self.0, &other.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Version {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Compare two full version strings the way pacman does
pub fn vercmp(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    let (epoch1, ver1, rel1) = split_evr(a);
    let (epoch2, ver2, rel2) = split_evr(b);

    let mut ret = segment_cmp(epoch1, epoch2);
    if ret == Ordering::Equal {
        ret = segment_cmp(ver1, ver2);
        if ret == Ordering::Equal {
            if let (Some(rel1), Some(rel2)) = (rel1, rel2) {
                ret = segment_cmp(rel1, rel2);
            }
        }
    }
    ret
}

/// Split `[epoch:]pkgver[-pkgrel]`
fn split_evr(evr: &str) -> (&str, &str, Option<&str>) {
    let digits = evr.bytes().take_while(u8::is_ascii_digit).count();

    let (epoch, rest) = if evr.as_bytes().get(digits) == Some(&b':') {
        let epoch = &evr[..digits];
        (if epoch.is_empty() { "0" } else { epoch }, &evr[digits + 1..])
    } else {
        ("0", evr)
    };

    match rest.rfind('-') {
        Some(pos) => (epoch, &rest[..pos], Some(&rest[pos + 1..])),
        None => (epoch, rest, None),
    }
}

/// Segment-wise comparison of alternating numeric and alphabetic runs
fn segment_cmp(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    let one = a.as_bytes();
    let two = b.as_bytes();
    let (mut i, mut j) = (0usize, 0usize);

    while i < one.len() && j < two.len() {
        let (sep1, sep2) = (i, j);
        while i < one.len() && !one[i].is_ascii_alphanumeric() {
            i += 1;
        }
        while j < two.len() && !two[j].is_ascii_alphanumeric() {
            j += 1;
        }
        if i >= one.len() || j >= two.len() {
            break;
        }

        // Differing separator runs decide immediately
        if i - sep1 != j - sep2 {
            return (i - sep1).cmp(&(j - sep2));
        }

        let (start1, start2) = (i, j);
        let numeric = one[i].is_ascii_digit();
        if numeric {
            while i < one.len() && one[i].is_ascii_digit() {
                i += 1;
            }
            while j < two.len() && two[j].is_ascii_digit() {
                j += 1;
            }
        } else {
            while i < one.len() && one[i].is_ascii_alphabetic() {
                i += 1;
            }
            while j < two.len() && two[j].is_ascii_alphabetic() {
                j += 1;
            }
        }

        let mut seg1 = &one[start1..i];
        let mut seg2 = &two[start2..j];

        if seg1.is_empty() {
            return Ordering::Less;
        }
        // Numeric segments are newer than alphabetic ones
        if seg2.is_empty() {
            return if numeric { Ordering::Greater } else { Ordering::Less };
        }

        if numeric {
            while seg1.first() == Some(&b'0') {
                seg1 = &seg1[1..];
            }
            while seg2.first() == Some(&b'0') {
                seg2 = &seg2[1..];
            }
            match seg1.len().cmp(&seg2.len()) {
                Ordering::Equal => {}
                other => return other,
            }
        }

        match seg1.cmp(seg2) {
            Ordering::Equal => {}
            other => return other,
        }
    }

    let end1 = i >= one.len();
    let end2 = j >= two.len();
    if end1 && end2 {
        return Ordering::Equal;
    }

    // A trailing alpha run never beats an empty string
    if (end1 && !two[j].is_ascii_alphabetic()) || (!end1 && one[i].is_ascii_alphabetic()) {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

/// Comparison operator of a version constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintOp {
    Eq,
    Ge,
    Le,
    Gt,
    Lt,
}

impl ConstraintOp {
    fn as_str(self) -> &'static str {
        match self {
            ConstraintOp::Eq => "=",
            ConstraintOp::Ge => ">=",
            ConstraintOp::Le => "<=",
            ConstraintOp::Gt => ">",
            ConstraintOp::Lt => "<",
        }
    }

    fn is_lower_bound(self) -> bool {
        matches!(self, ConstraintOp::Ge | ConstraintOp::Gt)
    }

    fn is_upper_bound(self) -> bool {
        matches!(self, ConstraintOp::Le | ConstraintOp::Lt)
    }
}

/// A version requirement such as `>=1.2-3`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionConstraint {
    pub op: ConstraintOp,
    pub version: Version,
}

impl VersionConstraint {
    pub fn new(op: ConstraintOp, version: impl Into<String>) -> Self {
        Self {
            op,
            version: Version::new(version),
        }
    }

    /// Check whether a concrete version meets this constraint
    pub fn satisfied_by(&self, version: &Version) -> bool {
        let ord = version.cmp(&self.version);
        match self.op {
            ConstraintOp::Eq => ord == Ordering::Equal,
            ConstraintOp::Ge => ord != Ordering::Less,
            ConstraintOp::Le => ord != Ordering::Greater,
            ConstraintOp::Gt => ord == Ordering::Greater,
            ConstraintOp::Lt => ord == Ordering::Less,
        }
    }

    /// Whether some version can satisfy both constraints.
    ///
    /// Constraints are intervals on a total order, so pairwise compatibility
    /// of a set implies the whole set has a common solution.
    pub fn compatible_with(&self, other: &VersionConstraint) -> bool {
        if self.op == ConstraintOp::Eq {
            return other.satisfied_by(&self.version);
        }
        if other.op == ConstraintOp::Eq {
            return self.satisfied_by(&other.version);
        }
        if self.op.is_lower_bound() && other.op.is_upper_bound() {
            return bounds_overlap(self, other);
        }
        if self.op.is_upper_bound() && other.op.is_lower_bound() {
            return bounds_overlap(other, self);
        }
        true
    }
}

fn bounds_overlap(lower: &VersionConstraint, upper: &VersionConstraint) -> bool {
    match lower.version.cmp(&upper.version) {
        Ordering::Less => true,
        Ordering::Equal => lower.op == ConstraintOp::Ge && upper.op == ConstraintOp::Le,
        Ordering::Greater => false,
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.as_str(), self.version)
    }
}

/// Split `name<op>version` at the first comparison operator
fn split_operator(raw: &str) -> (&str, Option<VersionConstraint>) {
    let raw = raw.trim();
    let Some(pos) = raw.find(['<', '>', '=']) else {
        return (raw, None);
    };

    let name = raw[..pos].trim();
    let rest = &raw[pos..];
    let (op, version) = if let Some(v) = rest.strip_prefix(">=") {
        (ConstraintOp::Ge, v)
    } else if let Some(v) = rest.strip_prefix("<=") {
        (ConstraintOp::Le, v)
    } else if let Some(v) = rest.strip_prefix('=') {
        (ConstraintOp::Eq, v)
    } else if let Some(v) = rest.strip_prefix('>') {
        (ConstraintOp::Gt, v)
    } else if let Some(v) = rest.strip_prefix('<') {
        (ConstraintOp::Lt, v)
    } else {
        return (name, None);
    };

    let version = version.trim();
    if version.is_empty() {
        (name, None)
    } else {
        (name, Some(VersionConstraint::new(op, version)))
    }
}

/// A dependency entry: name plus optional constraint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub name: String,
    pub constraint: Option<VersionConstraint>,
    /// Needed only to build the package (makedepends/checkdepends)
    pub build_only: bool,
}

impl DependencySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constraint: None,
            build_only: false,
        }
    }

    /// Parse a dependency string such as `python>=3.10`
    pub fn parse(raw: &str) -> Self {
        // optdepends carry a trailing ": description"
        let raw = raw.split(": ").next().unwrap_or(raw);
        let (name, constraint) = split_operator(raw);
        Self {
            name: name.to_string(),
            constraint,
            build_only: false,
        }
    }

    pub fn parse_build(raw: &str) -> Self {
        Self {
            build_only: true,
            ..Self::parse(raw)
        }
    }

    pub fn with_constraint(mut self, op: ConstraintOp, version: &str) -> Self {
        self.constraint = Some(VersionConstraint::new(op, version));
        self
    }

    pub fn build_only(mut self) -> Self {
        self.build_only = true;
        self
    }

    pub fn is_satisfied_by(&self, version: &Version) -> bool {
        self.constraint
            .as_ref()
            .map(|c| c.satisfied_by(version))
            .unwrap_or(true)
    }
}

impl fmt::Display for DependencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.constraint {
            Some(c) => write!(f, "{}{}", self.name, c),
            None => f.write_str(&self.name),
        }
    }
}

/// A `provides` entry: a virtual name, optionally versioned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provision {
    pub name: String,
    pub version: Option<Version>,
}

impl Provision {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().split_once('=') {
            Some((name, version)) if !version.trim().is_empty() => Self {
                name: name.trim().to_string(),
                version: Some(Version::new(version)),
            },
            Some((name, _)) => Self {
                name: name.trim().to_string(),
                version: None,
            },
            None => Self {
                name: raw.trim().to_string(),
                version: None,
            },
        }
    }

    /// Unversioned provisions never satisfy a versioned dependency
    pub fn satisfies(&self, name: &str, constraint: Option<&VersionConstraint>) -> bool {
        if self.name != name {
            return false;
        }
        match (constraint, &self.version) {
            (None, _) => true,
            (Some(c), Some(v)) => c.satisfied_by(v),
            (Some(_), None) => false,
        }
    }
}

impl fmt::Display for Provision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}={}", self.name, v),
            None => f.write_str(&self.name),
        }
    }
}
