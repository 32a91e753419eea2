//! Structural diff between two manifests

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::manifest::ManifestEntry;

/// How a single path differs between the desired and current trees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiffKind {
    /// Present in desired, absent in current
    AddNew,
    /// Present in current, absent in desired
    RemoveOld,
    /// File on one side, directory on the other
    DiffType,
    /// Both files, digests differ
    DiffMd5,
}

/// A single diff operation, addressed by path segments from the root
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiffOp {
    pub kind: DiffKind,
    pub path: Vec<String>,
}

impl DiffOp {
    #[must_use]
    pub fn new<S: Into<String>>(kind: DiffKind, path: impl IntoIterator<Item = S>) -> Self {
        Self {
            kind,
            path: path.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for DiffOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.kind {
            DiffKind::AddNew => "+",
            DiffKind::RemoveOld => "-",
            DiffKind::DiffType => "T",
            DiffKind::DiffMd5 => "M",
        };
        write!(f, "{tag} {}", self.path.join("/"))
    }
}

/// Compute the operations that turn `current` into `desired`
///
/// The walk stops at a type mismatch: children of a node reported as
/// [`DiffKind::DiffType`] are never reported themselves.
#[must_use]
pub fn diff(desired: &ManifestEntry, current: &ManifestEntry) -> Vec<DiffOp> {
    diff_at(desired, current, &[])
}

fn diff_at(desired: &ManifestEntry, current: &ManifestEntry, prefix: &[String]) -> Vec<DiffOp> {
    let child_path = |name: &str| {
        let mut path = prefix.to_vec();
        path.push(name.to_owned());
        path
    };

    match (desired, current) {
        (ManifestEntry::File { digest: want }, ManifestEntry::File { digest: have }) => {
            if want == have {
                Vec::new()
            } else {
                vec![DiffOp {
                    kind: DiffKind::DiffMd5,
                    path: prefix.to_vec(),
                }]
            }
        }
        (
            ManifestEntry::Directory { children: want },
            ManifestEntry::Directory { children: have },
        ) => {
            let mut ops = Vec::new();
            for (name, entry) in want {
                match have.get(name) {
                    None => ops.push(DiffOp {
                        kind: DiffKind::AddNew,
                        path: child_path(name),
                    }),
                    Some(existing) => ops.extend(diff_at(entry, existing, &child_path(name))),
                }
            }
            for name in have.keys().filter(|name| !want.contains_key(*name)) {
                ops.push(DiffOp {
                    kind: DiffKind::RemoveOld,
                    path: child_path(name),
                });
            }
            ops
        }
        _ => vec![DiffOp {
            kind: DiffKind::DiffType,
            path: prefix.to_vec(),
        }],
    }
}

/// Diff operations partitioned into what to delete and what to upload
///
/// A path that changed type or content appears in both lists: the stale
/// remote entry is removed first, then the local one is uploaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub deletions: Vec<Vec<String>>,
    pub uploads: Vec<Vec<String>>,
}

impl SyncPlan {
    #[must_use]
    pub fn from_ops(ops: &[DiffOp]) -> Self {
        let mut plan = Self::default();
        for op in ops {
            match op.kind {
                DiffKind::RemoveOld => plan.deletions.push(op.path.clone()),
                DiffKind::AddNew => plan.uploads.push(op.path.clone()),
                DiffKind::DiffType | DiffKind::DiffMd5 => {
                    plan.deletions.push(op.path.clone());
                    plan.uploads.push(op.path.clone());
                }
            }
        }
        plan
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty() && self.uploads.is_empty()
    }
}
