//! Advisory file-reservation arbiter
//!
//! Shared by the broker (authoritative conflict rejection) and the client
//! (pre-flight write guard). Paths are normalized before storage or
//! comparison; a trailing `/` marks a directory reservation that subsumes
//! everything beneath it.

use crate::protocol::{Reservation, ReservationMap};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReserveError {
    #[error("No paths provided")]
    Empty,
    #[error("Invalid path: '{0}'")]
    InvalidPath(String),
    #[error("Path '{path}' is already reserved by agent {owner_id}")]
    Conflict {
        path: String,
        owner_id: String,
        reason: Option<String>,
    },
}

/// Normalize a reservation path.
///
/// Trims whitespace, converts backslashes, collapses slash runs, and strips
/// the trailing separator, re-appending exactly one `/` iff the input marked
/// a directory. Empty input normalizes to the empty string (invalid); a
/// directory input that reduces to nothing becomes the literal `/`.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let is_dir = trimmed.ends_with('/') || trimmed.ends_with('\\');

    let mut collapsed = String::with_capacity(trimmed.len());
    let mut prev_was_slash = false;
    for ch in trimmed.chars() {
        let ch = if ch == '\\' { '/' } else { ch };
        if ch == '/' {
            if prev_was_slash {
                continue;
            }
            prev_was_slash = true;
        } else {
            prev_was_slash = false;
        }
        collapsed.push(ch);
    }

    let stem = collapsed.strip_suffix('/').unwrap_or(&collapsed);
    if stem.is_empty() {
        return if is_dir { "/".to_string() } else { String::new() };
    }
    if is_dir {
        format!("{stem}/")
    } else {
        stem.to_string()
    }
}

/// Client-side normalization: resolve non-absolute inputs against the
/// agent's working directory before normalizing.
pub fn normalize_path_in(cwd: &str, path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if is_absolute(trimmed) {
        normalize_path(trimmed)
    } else {
        normalize_path(&format!("{cwd}/{trimmed}"))
    }
}

fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
        || path.starts_with('\\')
        || (path.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            && path.chars().nth(1) == Some(':'))
}

/// Whether two normalized paths claim overlapping filesystem regions.
pub fn paths_overlap(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    if let Some(stem) = a.strip_suffix('/') {
        if b.starts_with(a) || b == stem {
            return true;
        }
    }
    if let Some(stem) = b.strip_suffix('/') {
        if a.starts_with(b) || a == stem {
            return true;
        }
    }
    false
}

/// Find a reservation held by a different agent that overlaps `path`.
///
/// `path` must already be normalized. Used by the broker for authoritative
/// rejection and by the client write guard against its cached replica.
pub fn find_conflict<'a>(
    map: &'a ReservationMap,
    requester_id: &str,
    path: &str,
) -> Option<(&'a str, &'a Reservation)> {
    map.iter()
        .filter(|(owner, _)| owner.as_str() != requester_id)
        .find(|(_, reservation)| reservation.paths.iter().any(|held| paths_overlap(held, path)))
        .map(|(owner, reservation)| (owner.as_str(), reservation))
}

/// The broker's authoritative reservation table.
#[derive(Debug, Clone, Default)]
pub struct ReservationTable {
    map: ReservationMap,
}

impl ReservationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize, deduplicate, and merge `raw_paths` into the caller's
    /// reservation, rejecting any overlap with a different agent's claim.
    pub fn reserve(
        &mut self,
        agent_id: &str,
        raw_paths: &[String],
        reason: Option<String>,
    ) -> Result<(), ReserveError> {
        if raw_paths.is_empty() {
            return Err(ReserveError::Empty);
        }

        let mut incoming: Vec<String> = Vec::with_capacity(raw_paths.len());
        for raw in raw_paths {
            let normalized = normalize_path(raw);
            if normalized.is_empty() {
                return Err(ReserveError::InvalidPath(raw.clone()));
            }
            if !incoming.contains(&normalized) {
                incoming.push(normalized);
            }
        }

        for path in &incoming {
            if let Some((owner_id, held)) = find_conflict(&self.map, agent_id, path) {
                return Err(ReserveError::Conflict {
                    path: path.clone(),
                    owner_id: owner_id.to_string(),
                    reason: held.reason.clone(),
                });
            }
        }

        let entry = self.map.entry(agent_id.to_string()).or_insert_with(|| Reservation {
            paths: Vec::new(),
            reason: None,
        });
        for path in incoming {
            if !entry.paths.contains(&path) {
                entry.paths.push(path);
            }
        }
        if reason.is_some() {
            entry.reason = reason;
        }
        Ok(())
    }

    /// Release paths held by `agent_id`. With `None`, the whole reservation
    /// is deleted. Releasing paths that were never held is a no-op.
    pub fn release(&mut self, agent_id: &str, raw_paths: Option<&[String]>) {
        match raw_paths {
            None => {
                self.map.remove(agent_id);
            }
            Some(paths) => {
                let released: Vec<String> = paths.iter().map(|p| normalize_path(p)).collect();
                if let Some(entry) = self.map.get_mut(agent_id) {
                    entry.paths.retain(|held| !released.contains(held));
                    if entry.paths.is_empty() {
                        self.map.remove(agent_id);
                    }
                }
            }
        }
    }

    /// Drop everything owned by `agent_id`. Returns whether anything was held.
    pub fn remove_agent(&mut self, agent_id: &str) -> bool {
        self.map.remove(agent_id).is_some()
    }

    pub fn get(&self, agent_id: &str) -> Option<&Reservation> {
        self.map.get(agent_id)
    }

    pub fn snapshot(&self) -> ReservationMap {
        self.map.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_basics() {
        assert_eq!(normalize_path("  /repo/file.ts "), "/repo/file.ts");
        assert_eq!(normalize_path("C:\\repo\\dir\\"), "C:/repo/dir/");
        assert_eq!(normalize_path("/repo//deep///file"), "/repo/deep/file");
        assert_eq!(normalize_path("/repo/dir/"), "/repo/dir/");
        assert_eq!(normalize_path("/repo/dir///"), "/repo/dir/");
        assert_eq!(normalize_path(""), "");
        assert_eq!(normalize_path("   "), "");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("///"), "/");
    }

    #[test]
    fn relative_paths_resolve_against_cwd() {
        assert_eq!(normalize_path_in("/repo", "src/lib.rs"), "/repo/src/lib.rs");
        assert_eq!(normalize_path_in("/repo/", "src/"), "/repo/src/");
        assert_eq!(normalize_path_in("/repo", "/abs/file"), "/abs/file");
        assert_eq!(normalize_path_in("/repo", "D:\\work\\x"), "D:/work/x");
    }

    #[test]
    fn overlap_rule() {
        assert!(paths_overlap("/a/b", "/a/b"));
        assert!(paths_overlap("/a/b/", "/a/b/c"));
        assert!(paths_overlap("/a/b/c", "/a/b/"));
        // A directory reservation also covers the bare path itself.
        assert!(paths_overlap("/a/b/", "/a/b"));
        assert!(paths_overlap("/a/b", "/a/b/"));
        assert!(!paths_overlap("/a/b", "/a/bc"));
        assert!(!paths_overlap("/a/b/", "/a/bc"));
        assert!(!paths_overlap("/a/b", "/a/b2/c"));
    }

    #[test]
    fn reserve_rejects_cross_agent_overlap() {
        let mut table = ReservationTable::new();
        table
            .reserve("scout", &["/repo/file.ts".into()], Some("editing".into()))
            .unwrap();

        let err = table
            .reserve("hub", &["/repo/file.ts".into()], None)
            .unwrap_err();
        assert_eq!(
            err,
            ReserveError::Conflict {
                path: "/repo/file.ts".into(),
                owner_id: "scout".into(),
                reason: Some("editing".into()),
            }
        );
    }

    #[test]
    fn directory_reservation_blocks_children() {
        let mut table = ReservationTable::new();
        table.reserve("scout", &["/repo/dir/".into()], None).unwrap();

        let err = table
            .reserve("hub", &["/repo/dir/sub/file.ts".into()], None)
            .unwrap_err();
        assert!(matches!(err, ReserveError::Conflict { ref owner_id, .. } if owner_id == "scout"));

        // The owner may extend inside its own directory claim.
        table
            .reserve("scout", &["/repo/dir/sub/other.ts".into()], None)
            .unwrap();
    }

    #[test]
    fn reserve_merges_and_dedups() {
        let mut table = ReservationTable::new();
        table
            .reserve("scout", &["/a".into(), "/b".into(), "/a".into()], None)
            .unwrap();
        table
            .reserve("scout", &["/b".into(), "/c".into()], Some("more".into()))
            .unwrap();

        let held = table.get("scout").unwrap();
        assert_eq!(held.paths, vec!["/a", "/b", "/c"]);
        assert_eq!(held.reason.as_deref(), Some("more"));

        // A later reserve without a reason preserves the existing one.
        table.reserve("scout", &["/d".into()], None).unwrap();
        assert_eq!(table.get("scout").unwrap().reason.as_deref(), Some("more"));
    }

    #[test]
    fn reserve_validates_input() {
        let mut table = ReservationTable::new();
        assert_eq!(table.reserve("scout", &[], None), Err(ReserveError::Empty));
        assert_eq!(
            table.reserve("scout", &["   ".into()], None),
            Err(ReserveError::InvalidPath("   ".into()))
        );
    }

    #[test]
    fn release_shrinks_then_deletes() {
        let mut table = ReservationTable::new();
        table
            .reserve("scout", &["/a".into(), "/b".into()], None)
            .unwrap();

        table.release("scout", Some(&["/a".into()]));
        assert_eq!(table.get("scout").unwrap().paths, vec!["/b"]);

        table.release("scout", Some(&["/never-held".into()]));
        assert_eq!(table.get("scout").unwrap().paths, vec!["/b"]);

        table.release("scout", Some(&["/b".into()]));
        assert!(table.get("scout").is_none());
    }

    #[test]
    fn release_without_paths_deletes_everything() {
        let mut table = ReservationTable::new();
        table
            .reserve("scout", &["/a".into(), "/b/".into()], None)
            .unwrap();
        table.release("scout", None);
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn reserve_then_release_restores_prior_state() {
        let mut table = ReservationTable::new();
        table.reserve("hub", &["/elsewhere".into()], None).unwrap();
        let before = table.snapshot();

        table.reserve("scout", &["/repo/x".into()], None).unwrap();
        table.release("scout", Some(&["/repo/x".into()]));
        assert_eq!(table.snapshot(), before);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_raw_path() -> impl Strategy<Value = String> {
            // Mix of separators, duplicate slashes, whitespace padding.
            r"[ ]{0,2}[/\\]?[a-c]{1,3}([/\\][a-c]{1,3}){0,3}[/\\]{0,2}[ ]{0,2}"
        }

        proptest! {
            #[test]
            fn normalization_is_idempotent(raw in arb_raw_path()) {
                let once = normalize_path(&raw);
                prop_assert_eq!(normalize_path(&once), once);
            }

            #[test]
            fn overlap_is_symmetric(a in arb_raw_path(), b in arb_raw_path()) {
                let a = normalize_path(&a);
                let b = normalize_path(&b);
                prop_assert_eq!(paths_overlap(&a, &b), paths_overlap(&b, &a));
            }

            #[test]
            fn no_cross_agent_overlap_survives_any_sequence(
                ops in proptest::collection::vec(
                    (0..3u8, 0..3usize, proptest::collection::vec(arb_raw_path(), 0..3)),
                    0..20,
                )
            ) {
                let agents = ["a1", "a2", "a3"];
                let mut table = ReservationTable::new();
                for (kind, agent_idx, paths) in ops {
                    let agent = agents[agent_idx];
                    match kind {
                        0 => { let _ = table.reserve(agent, &paths, None); }
                        1 => table.release(agent, Some(&paths)),
                        _ => table.release(agent, None),
                    }
                }

                let snapshot = table.snapshot();
                for (owner, reservation) in &snapshot {
                    for path in &reservation.paths {
                        // Stored paths stay normalized.
                        prop_assert_eq!(&normalize_path(path), path);
                        // And never overlap another agent's claim.
                        for (other, other_res) in &snapshot {
                            if other == owner { continue; }
                            for other_path in &other_res.paths {
                                prop_assert!(!paths_overlap(path, other_path));
                            }
                        }
                    }
                }
            }
        }
    }
}
