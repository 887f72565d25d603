/// Whether a request path is dispatched to the interpreter rather than
/// served as a static file.
///
/// A path is dynamic when it ends in the script extension, contains the
/// extension followed by a path separator (path-info style), or, after
/// removing a trailing slash, its final segment has no extension (a
/// directory index).
pub fn is_dynamic_path(path: &str, script_ext: &str) -> bool {
    has_script_extension(path, script_ext) || is_directory_root(path)
}

fn has_script_extension(path: &str, script_ext: &str) -> bool {
    path.ends_with(script_ext) || path.contains(&format!("{script_ext}/"))
}

fn is_directory_root(path: &str) -> bool {
    let trimmed = path.trim_end_matches('/');
    let last = trimmed.rsplit('/').next().unwrap_or("");
    !last.contains('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_paths_are_dynamic() {
        assert!(is_dynamic_path("/index.php", ".php"));
        assert!(is_dynamic_path("/index.php/foo/bar", ".php"));
        assert!(is_dynamic_path("/", ".php"));
        assert!(is_dynamic_path("/wp-admin/", ".php"));
        assert!(is_dynamic_path("/no-extension", ".php"));
    }

    #[test]
    fn asset_paths_are_static() {
        assert!(!is_dynamic_path("/index.html", ".php"));
        assert!(!is_dynamic_path("/missing.png", ".php"));
        assert!(!is_dynamic_path("/assets/app.js", ".php"));
        assert!(!is_dynamic_path("/style.css/", ".php"));
    }
}
