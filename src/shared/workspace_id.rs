use std::path::PathBuf;

/// Make an entity id safe for use as a directory name. History and stream
/// files are keyed by ids that ultimately come from the embedding layer, so
/// anything outside [A-Za-z0-9_-] is replaced.
pub fn sanitize_entity_id(id: &str) -> String {
    let sanitized: String = id
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "unknown".to_string()
    } else {
        sanitized
    }
}

/// Directory for a `(workspace, tab)` pair under a storage root.
pub fn tab_dir(root: &std::path::Path, workspace_id: &str, tab_id: &str) -> PathBuf {
    root.join(sanitize_entity_id(workspace_id))
        .join(sanitize_entity_id(tab_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_passes_safe_ids_through() {
        assert_eq!(sanitize_entity_id("workspace-42_a"), "workspace-42_a");
    }

    #[test]
    fn sanitize_replaces_path_separators() {
        assert_eq!(sanitize_entity_id("../etc/passwd"), "___etc_passwd");
        assert_eq!(sanitize_entity_id("a b/c"), "a_b_c");
    }

    #[test]
    fn sanitize_never_returns_empty() {
        assert_eq!(sanitize_entity_id(""), "unknown");
        assert_eq!(sanitize_entity_id("///"), "___");
    }

    #[test]
    fn tab_dir_nests_workspace_then_tab() {
        let dir = tab_dir(std::path::Path::new("/tmp/hist"), "ws1", "tab/2");
        assert_eq!(dir, PathBuf::from("/tmp/hist/ws1/tab_2"));
    }
}
