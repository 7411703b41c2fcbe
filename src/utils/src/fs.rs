use std::path::Path;

pub fn open_with_create_append<P: AsRef<Path>>(path: P) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)
}

/// Names of the subdirectories and regular files directly under `dir`, each sorted.
pub fn list_dir<P: AsRef<Path>>(dir: P) -> std::io::Result<(Vec<String>, Vec<String>)> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let ty = entry.file_type()?;
        if ty.is_dir() {
            dirs.push(name);
        } else if ty.is_file() {
            files.push(name);
        }
    }
    dirs.sort();
    files.sort();
    Ok((dirs, files))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_appends() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.stdout");
        writeln!(open_with_create_append(&path).unwrap(), "first").unwrap();
        writeln!(open_with_create_append(&path).unwrap(), "second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn list_dir_separates_kinds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("b_dir")).unwrap();
        std::fs::create_dir(dir.path().join("a_dir")).unwrap();
        std::fs::write(dir.path().join("z.rs"), b"").unwrap();
        std::fs::write(dir.path().join("m.rs"), b"").unwrap();

        let (dirs, files) = list_dir(dir.path()).unwrap();
        assert_eq!(dirs, vec!["a_dir", "b_dir"]);
        assert_eq!(files, vec!["m.rs", "z.rs"]);
    }

    #[test]
    fn list_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_dir(dir.path().join("nope")).is_err());
    }
}
