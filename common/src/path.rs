use anyhow::Context;

/// Maps a source path to its mirrored location under the destination root.
///
/// Pure function: the location of `source` relative to `src_root` is joined
/// onto `dst_root`. The source root itself maps to the destination root.
/// Fails if `source` does not lie under `src_root`.
pub fn resolve(
    src_root: &std::path::Path,
    source: &std::path::Path,
    dst_root: &std::path::Path,
) -> anyhow::Result<std::path::PathBuf> {
    let relative = source.strip_prefix(src_root).with_context(|| {
        format!(
            "path {:?} does not lie under source root {:?}",
            &source, &src_root
        )
    })?;
    // joining an empty relative path would tack a trailing separator onto the
    // destination root, which the filesystem rejects for regular files
    if relative.as_os_str().is_empty() {
        return Ok(dst_root.to_path_buf());
    }
    Ok(dst_root.join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_nested_path() -> Result<(), anyhow::Error> {
        let destination = resolve(
            std::path::Path::new("/src"),
            std::path::Path::new("/src/a/b.txt"),
            std::path::Path::new("/dst"),
        )?;
        assert_eq!(destination, std::path::PathBuf::from("/dst/a/b.txt"));
        Ok(())
    }

    #[test]
    fn resolve_root_maps_to_root() -> Result<(), anyhow::Error> {
        let destination = resolve(
            std::path::Path::new("/src"),
            std::path::Path::new("/src"),
            std::path::Path::new("/dst"),
        )?;
        assert_eq!(destination, std::path::PathBuf::from("/dst"));
        // no trailing separator may sneak in - the root can be a regular file
        assert_eq!(destination.as_os_str(), "/dst");
        Ok(())
    }

    #[test]
    fn resolve_relative_roots() -> Result<(), anyhow::Error> {
        let destination = resolve(
            std::path::Path::new("foo"),
            std::path::Path::new("foo/bar/baz.txt"),
            std::path::Path::new("out"),
        )?;
        assert_eq!(destination, std::path::PathBuf::from("out/bar/baz.txt"));
        Ok(())
    }

    #[test]
    fn resolve_outside_source_root_fails() {
        let result = resolve(
            std::path::Path::new("/src"),
            std::path::Path::new("/other/a.txt"),
            std::path::Path::new("/dst"),
        );
        assert!(result.is_err());
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("does not lie under source root"));
    }
}
